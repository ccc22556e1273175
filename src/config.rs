//! Device configuration, version-2 schema.
//!
//! ```yaml
//! version: 2
//! platforms:
//!   rear:
//!     std_addr: 2
//!     bus: can0
//!     actuators:
//!       - lower: [0.0, 50.0, 0.0]
//!         upper: [0.0, 40.0, 104.523]
//!         min: 105.0
//! ```
//!
//! The core consumes the parsed value; loading it from disk and writing
//! calibration back are the caller's concern.

use crate::{Result, TalusError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The schema this build understands.
pub const CONFIG_VERSION: u32 = 2;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub version: u32,
    pub platforms: HashMap<String, PlatformConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlatformConfig {
    /// Node id on the bus.
    pub std_addr: u32,
    /// Bus name, e.g. `can0`. Platforms naming the same bus share it.
    pub bus: String,
    pub actuators: Vec<ActuatorConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActuatorConfig {
    /// Lower anchor, millimetres in the base frame.
    pub lower: [f64; 3],
    /// Upper anchor, millimetres in the platform frame.
    pub upper: [f64; 3],
    /// Leg length at full retraction.
    pub min: f64,
}

impl DeviceConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TalusError::Config(e.to_string()))
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| TalusError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: 2
platforms:
  rear:
    std_addr: 2
    bus: can0
    actuators:
      - lower: [0.0, 50.0, 0.0]
        upper: [0.0, 40.0, 104.523]
        min: 105.0
      - lower: [43.301, -25.0, 0.0]
        upper: [34.641, -20.0, 104.523]
        min: 105.0
      - lower: [-43.301, -25.0, 0.0]
        upper: [-34.641, -20.0, 104.523]
        min: 105.0
"#;

    #[test]
    fn parses_the_sample() {
        let config = DeviceConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.version, 2);

        let rear = &config.platforms["rear"];
        assert_eq!(rear.std_addr, 2);
        assert_eq!(rear.bus, "can0");
        assert_eq!(rear.actuators.len(), 3);
        assert_eq!(rear.actuators[0].lower, [0.0, 50.0, 0.0]);
        assert_eq!(rear.actuators[1].upper, [34.641, -20.0, 104.523]);
        assert_eq!(rear.actuators[2].min, 105.0);
    }

    #[test]
    fn round_trips_through_yaml() {
        let config = DeviceConfig::from_yaml_str(SAMPLE).unwrap();
        let dumped = config.to_yaml_string().unwrap();
        let reparsed = DeviceConfig::from_yaml_str(&dumped).unwrap();
        assert_eq!(reparsed.platforms["rear"].actuators.len(), 3);
    }

    #[test]
    fn rejects_garbage() {
        assert!(DeviceConfig::from_yaml_str("version: [nope").is_err());
    }
}
