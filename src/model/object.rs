//! Model objects: the entities the server manages on behalf of its
//! clients. UAVs are the primary kind; beacons, docks and local
//! positioning systems share the same registry with a different kind tag.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::devices::DeviceTreeNode;

/// Kind tag of a model object. Kind-specific registries are views over the
/// object registry filtered by this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObjectKind {
    Uav,
    Beacon,
    Dock,
    LocalPositioningSystem,
}

/// An object managed by the server: something with an id, a kind, a status
/// snapshot and optionally a device tree.
pub trait ModelObject: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> ObjectKind;

    /// A JSON snapshot of the current status, in the shape the `*-INF`
    /// messages report it.
    fn status(&self) -> Value;

    fn device_tree(&self) -> Option<DeviceTreeNode> {
        None
    }
}

#[derive(Debug, Clone)]
struct UavState {
    /// Geodetic position as [lat, lon, AMSL in meters].
    position: [f64; 3],
    heading: f64,
    battery_voltage: f64,
}

/// A simulated UAV, used by the `virtual_uavs` extension. It hovers around
/// its home position and slowly drains its battery.
pub struct VirtualUav {
    id: String,
    home: [f64; 3],
    state: Mutex<UavState>,
}

impl VirtualUav {
    pub fn new(id: impl Into<String>, home: [f64; 3]) -> Self {
        Self {
            id: id.into(),
            home,
            state: Mutex::new(UavState {
                position: home,
                heading: 0.0,
                battery_voltage: 12.6,
            }),
        }
    }

    /// Advances the simulation by `dt` seconds. The UAV traces a small
    /// circle around its home position.
    pub fn step(&self, dt: f64) {
        let mut state = self.state.lock().unwrap();
        state.heading = (state.heading + 10.0 * dt) % 360.0;
        let radians = state.heading.to_radians();
        state.position[0] = self.home[0] + 1e-5 * radians.cos();
        state.position[1] = self.home[1] + 1e-5 * radians.sin();
        state.battery_voltage = (state.battery_voltage - 0.001 * dt).max(9.0);
    }
}

impl ModelObject for VirtualUav {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Uav
    }

    fn status(&self) -> Value {
        let state = self.state.lock().unwrap();
        json!({
            "id": self.id,
            "position": state.position,
            "heading": state.heading,
            "battery": { "voltage": state.battery_voltage },
        })
    }

    fn device_tree(&self) -> Option<DeviceTreeNode> {
        let mut tree = DeviceTreeNode::new();
        let battery = tree.add_device("battery");
        battery.add_channel("voltage", "number");
        Some(tree)
    }
}
