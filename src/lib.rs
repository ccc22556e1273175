//! # Talus Driver
//!
//! Onboard controller for multi-platform parallel-kinematics foot simulators
//! (CAN-based communication). Each platform is a Stewart-style mechanism of
//! three or four linear actuators behind one firmware node; a pose command
//! resolves to per-leg lengths and coordinated speeds, then goes out as
//! correlated, retried exchanges on the bus.

mod actuator;
mod bus;
mod can;
mod command;
mod config;
mod device;
mod error;
mod frame;
mod node;
mod platform;
mod sim;

pub use crate::actuator::{Actuator, ActuatorState, MAX_TRAVEL_MM};
pub use crate::bus::CanBus;
pub use crate::can::{CanEndpoint, CanRecord, Loopback, SocketCan, CAN_MAX_DLEN};
pub use crate::command::{codes, Command};
pub use crate::config::{ActuatorConfig, DeviceConfig, PlatformConfig, CONFIG_VERSION};
pub use crate::device::{ActuatorReading, Device, DeviceCommand};
pub use crate::error::{Result, TalusError};
pub use crate::frame::{Frame, BROADCAST_ID};
pub use crate::node::{
    FirmwareVersion, NodeController, VersionPolicy, CMD_MAX_RETRIES, CMD_TIMEOUT, COMMIT_TIMEOUT,
    NODE_VERSION_REQ,
};
pub use crate::platform::KinematicPlatform;
pub use crate::sim::SimulatedNode;
