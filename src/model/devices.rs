//! Device trees: the hierarchical description of the channels a model
//! object exposes (battery voltage, link quality, ...), reported through
//! the `DEV-*` message family by driver extensions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single measurement channel of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelNode {
    /// Type tag of the values in the channel (`number`, `string`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Physical unit, when meaningful.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Most recent value, if any has been recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// A node of a device tree: a device with nested sub-devices and channels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceTreeNode {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, DeviceTreeNode>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub channels: BTreeMap<String, ChannelNode>,
}

impl DeviceTreeNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&mut self, id: impl Into<String>) -> &mut DeviceTreeNode {
        self.children.entry(id.into()).or_default()
    }

    pub fn add_channel(&mut self, id: impl Into<String>, kind: impl Into<String>) {
        self.channels.insert(
            id.into(),
            ChannelNode {
                kind: kind.into(),
                unit: None,
                value: None,
            },
        );
    }

    /// Looks up a node by a `/`-separated path.
    pub fn find(&self, path: &str) -> Option<&DeviceTreeNode> {
        let mut node = self;
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            node = node.children.get(segment)?;
        }
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_lookup() {
        let mut tree = DeviceTreeNode::new();
        let battery = tree.add_device("battery");
        battery.add_channel("voltage", "number");

        assert!(tree.find("battery").is_some());
        assert!(tree.find("battery/").is_some());
        assert!(tree.find("motor").is_none());
        assert_eq!(
            tree.find("battery").unwrap().channels["voltage"].kind,
            "number"
        );
    }
}
