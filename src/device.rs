//! Device facade: the only surface the external collaborators see.
//!
//! Resolves platform names and forwards pose operations. Degrees convert to
//! radians here; everything below works in radians and millimetres.

use crate::actuator::Actuator;
use crate::bus::CanBus;
use crate::can::{CanEndpoint, SocketCan};
use crate::config::{DeviceConfig, CONFIG_VERSION};
use crate::node::{NodeController, VersionPolicy};
use crate::platform::KinematicPlatform;
use crate::{Result, TalusError};
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// A parsed external command, as handed over by the signalling layer.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCommand {
    pub cmd: String,
    pub name: String,
    /// Millimetres or degrees, depending on `cmd`.
    pub value: f64,
}

/// Sampled per-actuator state for the streaming layer to poll.
#[derive(Debug, Clone, Serialize)]
pub struct ActuatorReading {
    pub index: u8,
    pub target_mm: f64,
    pub current_mm: f64,
    pub speed: u8,
}

pub struct Device {
    platforms: HashMap<String, Mutex<KinematicPlatform>>,
    buses: HashMap<String, Arc<CanBus>>,
}

impl Device {
    /// Builds the device against real SocketCAN interfaces.
    pub async fn connect(config: &DeviceConfig) -> Result<Device> {
        Self::with_endpoints(config, &VersionPolicy::default(), |name| {
            Ok(Arc::new(SocketCan::open(name)?) as Arc<dyn CanEndpoint>)
        })
        .await
    }

    /// Builds the device over caller-supplied endpoints; tests and
    /// simulators hand in loopbacks. Platforms naming the same bus share
    /// one endpoint.
    pub async fn with_endpoints(
        config: &DeviceConfig,
        policy: &VersionPolicy,
        mut open: impl FnMut(&str) -> Result<Arc<dyn CanEndpoint>>,
    ) -> Result<Device> {
        if config.version != CONFIG_VERSION {
            return Err(TalusError::ConfigVersion(config.version));
        }

        let mut buses: HashMap<String, Arc<CanBus>> = HashMap::new();
        let mut platforms = HashMap::new();

        for (name, platform_config) in &config.platforms {
            let bus = match buses.entry(platform_config.bus.clone()) {
                Entry::Occupied(entry) => Arc::clone(entry.get()),
                Entry::Vacant(entry) => {
                    let endpoint = open(&platform_config.bus)?;
                    Arc::clone(entry.insert(CanBus::open(endpoint)))
                }
            };

            let actuators = platform_config
                .actuators
                .iter()
                .enumerate()
                .map(|(i, a)| {
                    // control boards use 1-based indexing
                    Actuator::new(
                        (i + 1) as u8,
                        Point3::from(a.lower),
                        Point3::from(a.upper),
                        a.min,
                    )
                    .map(Arc::new)
                })
                .collect::<Result<Vec<_>>>()?;

            let node = NodeController::connect(
                Arc::clone(&bus),
                platform_config.std_addr,
                actuators.clone(),
                policy,
            )
            .await?;

            let platform = KinematicPlatform::new(node, actuators)?;
            platforms.insert(name.clone(), Mutex::new(platform));
            info!(platform = %name, bus = %platform_config.bus, "platform ready");
        }

        Ok(Device { platforms, buses })
    }

    pub fn platform_names(&self) -> Vec<&str> {
        self.platforms.keys().map(String::as_str).collect()
    }

    pub fn bus(&self, name: &str) -> Result<&Arc<CanBus>> {
        self.buses
            .get(name)
            .ok_or_else(|| TalusError::UnknownBus(name.to_string()))
    }

    fn platform(&self, name: &str) -> Result<&Mutex<KinematicPlatform>> {
        self.platforms
            .get(name)
            .ok_or_else(|| TalusError::UnknownPlatform(name.to_string()))
    }

    /// Sets the platform height in millimetres, leaving rotation alone.
    pub async fn set_height(&self, name: &str, height_mm: f64) -> Result<()> {
        let mut platform = self.platform(name)?.lock().await;
        platform.set_translation(0.0, 0.0, height_mm);
        platform.set().await
    }

    /// Sets frontal-plane and incline rotation in degrees.
    pub async fn set_rotation(&self, name: &str, deg_frontal: f64, deg_incline: f64) -> Result<()> {
        let mut platform = self.platform(name)?.lock().await;
        platform.set_rotation(0.0, deg_frontal.to_radians(), deg_incline.to_radians());
        platform.set().await
    }

    /// Sets the first-ray drop angle in degrees on a forefoot platform.
    pub async fn set_first_ray(&self, name: &str, deg: f64) -> Result<()> {
        let mut platform = self.platform(name)?.lock().await;
        platform.set_first_ray(deg.to_radians())?;
        platform.set().await
    }

    pub async fn home(&self, name: &str) -> Result<()> {
        self.platform(name)?.lock().await.home().await
    }

    /// One position exchange, then a snapshot of every actuator.
    pub async fn state(&self, name: &str) -> Result<Vec<ActuatorReading>> {
        let platform = self.platform(name)?.lock().await;
        platform.node().refresh_positions().await?;

        Ok(platform
            .actuators()
            .iter()
            .map(|actuator| {
                let state = actuator.state();
                ActuatorReading {
                    index: actuator.index(),
                    target_mm: actuator.get_target_mm(),
                    current_mm: actuator.get_current_mm(),
                    speed: state.max_speed,
                }
            })
            .collect())
    }

    /// Routes one external command. Unknown commands are logged and dropped;
    /// `set_frontal` touches only the frontal angle, preserving incline.
    pub async fn dispatch(&self, command: &DeviceCommand) -> Result<()> {
        match command.cmd.as_str() {
            "set_height" => self.set_height(&command.name, command.value).await,
            "set_frontal" => {
                let mut platform = self.platform(&command.name)?.lock().await;
                let (_, _, incline) = platform.euler_angles();
                platform.set_rotation(0.0, command.value.to_radians(), incline);
                platform.set().await
            }
            "set_first_ray" => self.set_first_ray(&command.name, command.value).await,
            "home_platform" => self.home(&command.name).await,
            other => {
                warn!(cmd = other, "unknown command, dropped");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::Loopback;
    use crate::command::codes;
    use crate::frame::Frame;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echo firmware serving every node on one loopback bus.
    fn spawn_echo(endpoint: Loopback) {
        tokio::spawn(async move {
            loop {
                let Ok(record) = endpoint.recv_record().await else {
                    break;
                };
                let Ok(Some(frame)) = Frame::decode(&record) else {
                    continue;
                };
                let reply = match frame.cmd {
                    codes::VERSION => Frame::new(frame.id, codes::VERSION, b"0.1.0".to_vec()),
                    _ => frame,
                };
                let Ok(record) = reply.encode() else { continue };
                if endpoint.send_record(&record).await.is_err() {
                    break;
                }
            }
        });
    }

    fn two_platform_config() -> DeviceConfig {
        DeviceConfig::from_yaml_str(
            r#"
version: 2
platforms:
  rear:
    std_addr: 2
    bus: can0
    actuators:
      - { lower: [0.0, 50.0, 0.0], upper: [0.0, 40.0, 104.523], min: 105.0 }
      - { lower: [43.301, -25.0, 0.0], upper: [34.641, -20.0, 104.523], min: 105.0 }
      - { lower: [-43.301, -25.0, 0.0], upper: [-34.641, -20.0, 104.523], min: 105.0 }
  fore:
    std_addr: 3
    bus: can0
    actuators:
      - { lower: [0.0, 50.0, 0.0], upper: [0.0, 40.0, 104.523], min: 105.0 }
      - { lower: [50.0, 0.0, 0.0], upper: [40.0, 0.0, 104.523], min: 105.0 }
      - { lower: [0.0, -50.0, 0.0], upper: [0.0, -40.0, 104.523], min: 105.0 }
      - { lower: [-50.0, 0.0, 0.0], upper: [-40.0, 0.0, 104.523], min: 105.0 }
"#,
        )
        .unwrap()
    }

    async fn device() -> (Device, usize) {
        let opened = AtomicUsize::new(0);
        let device = Device::with_endpoints(
            &two_platform_config(),
            &VersionPolicy::default(),
            |_name| {
                opened.fetch_add(1, Ordering::SeqCst);
                let (host, far) = Loopback::pair();
                spawn_echo(far);
                Ok(Arc::new(host) as Arc<dyn CanEndpoint>)
            },
        )
        .await
        .unwrap();
        let count = opened.load(Ordering::SeqCst);
        (device, count)
    }

    #[tokio::test]
    async fn platforms_on_one_bus_share_the_endpoint() {
        let (device, opened) = device().await;
        assert_eq!(opened, 1);
        let mut names = device.platform_names();
        names.sort_unstable();
        assert_eq!(names, ["fore", "rear"]);
        assert!(device.bus("can0").is_ok());
        assert!(matches!(
            device.bus("can9"),
            Err(TalusError::UnknownBus(_))
        ));
    }

    #[tokio::test]
    async fn wrong_config_version_fails_construction() {
        let mut config = two_platform_config();
        config.version = 1;
        let result = Device::with_endpoints(&config, &VersionPolicy::default(), |_| {
            let (host, far) = Loopback::pair();
            spawn_echo(far);
            Ok(Arc::new(host) as Arc<dyn CanEndpoint>)
        })
        .await;
        assert!(matches!(result, Err(TalusError::ConfigVersion(1))));
    }

    #[tokio::test]
    async fn unknown_platform_is_reported() {
        let (device, _) = device().await;
        let result = device.set_height("mid", 10.0).await;
        assert!(matches!(result, Err(TalusError::UnknownPlatform(name)) if name == "mid"));
    }

    #[tokio::test]
    async fn set_height_stages_every_leg() {
        let (device, _) = device().await;
        device.set_height("rear", 50.0).await.unwrap();

        let state = device.state("rear").await.unwrap();
        assert_eq!(state.len(), 3);
        for reading in state {
            assert!((reading.target_mm - 50.0).abs() <= 1.0);
            assert_eq!(reading.speed, 255);
        }
    }

    #[tokio::test]
    async fn first_ray_rejected_on_rearfoot() {
        let (device, _) = device().await;
        let result = device.set_first_ray("rear", 10.0).await;
        assert!(matches!(result, Err(TalusError::UnsupportedAction { .. })));
    }

    #[tokio::test]
    async fn dispatch_routes_and_drops() {
        let (device, _) = device().await;

        device
            .dispatch(&DeviceCommand {
                cmd: "set_height".into(),
                name: "rear".into(),
                value: 40.0,
            })
            .await
            .unwrap();

        device
            .dispatch(&DeviceCommand {
                cmd: "set_frontal".into(),
                name: "rear".into(),
                value: 5.0,
            })
            .await
            .unwrap();

        // unknown commands are dropped, not errors
        device
            .dispatch(&DeviceCommand {
                cmd: "make_coffee".into(),
                name: "rear".into(),
                value: 1.0,
            })
            .await
            .unwrap();

        // unknown platform still surfaces
        let result = device
            .dispatch(&DeviceCommand {
                cmd: "home_platform".into(),
                name: "mid".into(),
                value: 0.0,
            })
            .await;
        assert!(matches!(result, Err(TalusError::UnknownPlatform(_))));
    }

    #[tokio::test]
    async fn set_frontal_preserves_incline() {
        let (device, _) = device().await;
        device.set_height("rear", 50.0).await.unwrap();
        device.set_rotation("rear", 0.0, 8.0).await.unwrap();

        device
            .dispatch(&DeviceCommand {
                cmd: "set_frontal".into(),
                name: "rear".into(),
                value: 5.0,
            })
            .await
            .unwrap();

        let platform = device.platform("rear").unwrap().lock().await;
        let (_, frontal, incline) = platform.euler_angles();
        assert!((frontal.to_degrees() - 5.0).abs() < 1e-6);
        assert!((incline.to_degrees() - 8.0).abs() < 1e-6);
    }
}
