//! Linear actuator: one leg of a parallel-kinematics platform.

use crate::{Result, TalusError};
use nalgebra::Point3;
use parking_lot::Mutex;

/// Full stroke of the linear actuator in millimetres.
pub const MAX_TRAVEL_MM: f64 = 75.0;

/// Snapshot of the actuator's commanded and observed state.
///
/// `current` is eventually consistent: the node's listen task refreshes it
/// from position reports arriving off the bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActuatorState {
    pub target: u16,
    pub current: u16,
    pub max_speed: u8,
    pub current_speed: u8,
}

/// A single leg. Holds commanded state until the platform commits it, and
/// converts between physical millimetres and the firmware's 16-bit encoder
/// range.
#[derive(Debug)]
pub struct Actuator {
    index: u8,
    lower: Point3<f64>,
    upper: Point3<f64>,
    min_length: f64,
    min_height: f64,
    state: Mutex<ActuatorState>,
}

impl Actuator {
    /// `index` is 1-based within the node, matching the control boards.
    /// `lower` is the base-frame anchor, `upper` the platform-frame anchor
    /// at rest, `min_length` the leg length at full retraction.
    pub fn new(index: u8, lower: Point3<f64>, upper: Point3<f64>, min_length: f64) -> Result<Self> {
        if !(1..=4).contains(&index) {
            return Err(TalusError::Config(format!(
                "actuator index {index} outside 1-4"
            )));
        }

        let displacement = ((lower.x - upper.x).powi(2) + (lower.y - upper.y).powi(2)).sqrt();
        let vertical_sq = min_length.powi(2) - displacement.powi(2);
        if vertical_sq < 0.0 {
            return Err(TalusError::Config(format!(
                "actuator {index}: minimum length {min_length} shorter than anchor displacement {displacement:.3}"
            )));
        }
        let min_height = vertical_sq.sqrt() + lower.z;

        Ok(Actuator {
            index,
            lower,
            upper,
            min_length,
            min_height,
            state: Mutex::new(ActuatorState::default()),
        })
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn lower(&self) -> Point3<f64> {
        self.lower
    }

    pub fn upper(&self) -> Point3<f64> {
        self.upper
    }

    pub fn min_length(&self) -> f64 {
        self.min_length
    }

    /// Height of the upper anchor above the base plane at full retraction.
    /// Memoised at construction; lengths are measured from here.
    pub fn min_height(&self) -> f64 {
        self.min_height
    }

    /// Encodes a length in millimetres as firmware counts, saturating to the
    /// encoder range.
    pub fn encode_mm(length_mm: f64) -> u16 {
        let counts = (length_mm / MAX_TRAVEL_MM * f64::from(u16::MAX)).round();
        counts.clamp(0.0, f64::from(u16::MAX)) as u16
    }

    pub fn decode_counts(counts: u16) -> f64 {
        f64::from(counts) * MAX_TRAVEL_MM / f64::from(u16::MAX)
    }

    pub fn state(&self) -> ActuatorState {
        *self.state.lock()
    }

    pub fn target_counts(&self) -> u16 {
        self.state.lock().target
    }

    pub fn current_counts(&self) -> u16 {
        self.state.lock().current
    }

    pub fn max_speed(&self) -> u8 {
        self.state.lock().max_speed
    }

    pub fn get_target_mm(&self) -> f64 {
        Self::decode_counts(self.target_counts())
    }

    pub fn get_current_mm(&self) -> f64 {
        Self::decode_counts(self.current_counts())
    }

    pub fn set_target_mm(&self, length_mm: f64) {
        self.state.lock().target = Self::encode_mm(length_mm);
    }

    /// Speed byte for the next movement: 0 is stopped, 255 maximum.
    pub fn set_speed(&self, speed: u8) {
        self.state.lock().max_speed = speed;
    }

    /// Called by the node once the speed has gone out on the wire.
    pub(crate) fn mark_speed_sent(&self) {
        let mut state = self.state.lock();
        state.current_speed = state.max_speed;
    }

    /// Called by the node's listen task on position reports.
    pub(crate) fn set_current_counts(&self, counts: u16) {
        self.state.lock().current = counts;
    }
}
