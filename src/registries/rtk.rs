//! Registry of RTK correction-source presets.
//!
//! Presets come from two places: the user's configuration, and automatic
//! enumeration of serial ports that look like RTK base stations. The
//! auto-generated ones are tagged so a hot-plug event can regenerate them
//! without touching the user-defined entries.

use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

use super::RegistryBase;

/// Format of the correction stream a preset provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtkFormat {
    Rtcm2,
    Rtcm3,
    Auto,
}

impl Default for RtkFormat {
    fn default() -> Self {
        Self::Auto
    }
}

/// A single RTK correction-source preset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtkPreset {
    pub id: String,
    pub title: String,
    /// Connection specifications of the correction sources, e.g.
    /// `tcp://192.168.47.1:8010` or `serial:/dev/ttyUSB0`.
    pub sources: Vec<String>,
    #[serde(default)]
    pub format: RtkFormat,
    /// Set on presets produced by serial-port enumeration.
    #[serde(default, skip_serializing)]
    pub auto_generated: bool,
}

impl RtkPreset {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            sources: Vec::new(),
            format: RtkFormat::default(),
            auto_generated: false,
        }
    }

    pub fn auto_generated(mut self) -> Self {
        self.auto_generated = true;
        self
    }
}

/// Registry of RTK presets.
#[derive(Default)]
pub struct RtkPresetRegistry {
    base: RegistryBase<Arc<RtkPreset>>,
}

impl RtkPresetRegistry {
    pub fn new() -> Self {
        Self {
            base: RegistryBase::new(),
        }
    }

    /// Registers a preset; an error when the id is taken.
    pub fn add(&self, preset: RtkPreset) -> Result<(), RegistryError> {
        if self.base.contains(&preset.id) {
            return Err(RegistryError::IdTaken(preset.id));
        }
        self.base.insert(preset.id.clone(), Arc::new(preset));
        Ok(())
    }

    pub fn remove_by_id(&self, preset_id: &str) -> Option<Arc<RtkPreset>> {
        self.base.take(preset_id)
    }

    /// Drops every auto-generated preset, typically right before the
    /// serial ports are re-enumerated after a hot-plug event. Returns the
    /// number of presets removed.
    pub fn remove_auto_generated(&self) -> usize {
        let doomed: Vec<String> = self
            .base
            .ids()
            .into_iter()
            .filter(|id| {
                self.base
                    .find_by_id(id)
                    .is_some_and(|preset| preset.auto_generated)
            })
            .collect();
        let count = doomed.len();
        for id in doomed {
            self.base.take(&id);
        }
        count
    }
}

impl Deref for RtkPresetRegistry {
    type Target = RegistryBase<Arc<RtkPreset>>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}
