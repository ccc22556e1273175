//! Kinematic platform: pose in, coordinated actuator lengths out.
//!
//! The platform frame is reached from the base frame by translating to the
//! rotation origin, rotating, translating back, then applying the pose
//! translation. Leg lengths fall out of the distance between each actuator's
//! transformed upper anchor and its fixed lower anchor.

use crate::actuator::Actuator;
use crate::node::NodeController;
use crate::{Result, TalusError};
use nalgebra::{Matrix4, Translation3, UnitQuaternion, Vector3};
use std::sync::Arc;

/// Auxiliary hinge on four-leg platforms dropping the medial forefoot
/// independently of the main pose.
#[derive(Debug, Clone)]
struct FirstRay {
    origin: Vector3<f64>,
    rotation: UnitQuaternion<f64>,
}

pub struct KinematicPlatform {
    node: Arc<NodeController>,
    actuators: Vec<Arc<Actuator>>,
    rotation: UnitQuaternion<f64>,
    translation: Vector3<f64>,
    origin: Vector3<f64>,
    first_ray: Option<FirstRay>,
}

impl KinematicPlatform {
    /// Three legs form a rearfoot platform, four a forefoot platform with a
    /// first-ray hinge on the fourth leg.
    pub fn new(node: Arc<NodeController>, actuators: Vec<Arc<Actuator>>) -> Result<Self> {
        let first_ray = match actuators.len() {
            3 => None,
            4 => Some(FirstRay {
                origin: Vector3::zeros(),
                rotation: UnitQuaternion::identity(),
            }),
            n => {
                return Err(TalusError::Config(format!(
                    "platform needs 3 or 4 actuators, got {n}"
                )))
            }
        };

        Ok(KinematicPlatform {
            node,
            actuators,
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            origin: Vector3::zeros(),
            first_ray,
        })
    }

    pub fn node(&self) -> &Arc<NodeController> {
        &self.node
    }

    pub fn actuators(&self) -> &[Arc<Actuator>] {
        &self.actuators
    }

    pub fn has_first_ray(&self) -> bool {
        self.first_ray.is_some()
    }

    /// Platform rotation as ZYX Euler angles, radians.
    pub fn set_rotation(&mut self, z: f64, y: f64, x: f64) {
        self.rotation = UnitQuaternion::from_euler_angles(x, y, z);
    }

    /// Current rotation as (z, y, x) Euler angles, radians.
    pub fn euler_angles(&self) -> (f64, f64, f64) {
        let (x, y, z) = self.rotation.euler_angles();
        (z, y, x)
    }

    pub fn set_translation(&mut self, x: f64, y: f64, z: f64) {
        self.translation = Vector3::new(x, y, z);
    }

    /// Moves the centre the platform rotates about.
    pub fn set_origin(&mut self, x: f64, y: f64, z: f64) {
        self.origin = Vector3::new(x, y, z);
    }

    /// First-ray drop angle in radians, about the hinge axis.
    pub fn set_first_ray(&mut self, angle: f64) -> Result<()> {
        match &mut self.first_ray {
            Some(first_ray) => {
                first_ray.rotation = UnitQuaternion::from_euler_angles(0.0, angle, 0.0);
                Ok(())
            }
            None => Err(self.unsupported("set_first_ray")),
        }
    }

    /// Places the hinge the first ray pivots about.
    pub fn set_first_ray_origin(&mut self, x: f64, y: f64, z: f64) -> Result<()> {
        match &mut self.first_ray {
            Some(first_ray) => {
                first_ray.origin = Vector3::new(x, y, z);
                Ok(())
            }
            None => Err(self.unsupported("set_first_ray_origin")),
        }
    }

    fn unsupported(&self, action: &str) -> TalusError {
        TalusError::UnsupportedAction {
            name: format!("node {}", self.node.id()),
            action: action.to_string(),
        }
    }

    fn transform(&self) -> Matrix4<f64> {
        Translation3::from(self.origin).to_homogeneous()
            * self.rotation.to_homogeneous()
            * Translation3::from(-self.origin).to_homogeneous()
            * Translation3::from(self.translation).to_homogeneous()
    }

    fn hinge_transform(first_ray: &FirstRay) -> Matrix4<f64> {
        Translation3::from(first_ray.origin).to_homogeneous()
            * first_ray.rotation.to_homogeneous()
            * Translation3::from(-first_ray.origin).to_homogeneous()
    }

    /// Solves the current pose to a length in millimetres per actuator.
    /// Fails without side effects when any leg would need to be shorter
    /// than fully retracted.
    fn solve(&self) -> Result<Vec<f64>> {
        let transform = self.transform();
        let hinge = self.first_ray.as_ref().map(Self::hinge_transform);

        let mut lengths = Vec::with_capacity(self.actuators.len());
        for (i, actuator) in self.actuators.iter().enumerate() {
            let mut upper = actuator.upper();
            if i == 3 {
                if let Some(hinge) = &hinge {
                    upper = hinge.transform_point(&upper);
                }
            }

            let world = transform.transform_point(&upper);
            let length = ((world - actuator.lower()).norm() - actuator.min_height()).round();
            if length < 0.0 {
                return Err(TalusError::ImpossiblePose {
                    index: actuator.index(),
                });
            }
            lengths.push(length);
        }

        Ok(lengths)
    }

    /// Commits the current pose: feasibility-check every leg, stage targets
    /// and movement-proportional speeds, then issue SetSpeed followed by
    /// SetPosition so the firmware has speeds in place before targets land.
    ///
    /// Speeds scale so every leg arrives together: the leg moving furthest
    /// runs flat out at 255. A pose that moves nothing skips the wire
    /// entirely.
    pub async fn set(&self) -> Result<()> {
        let lengths = self.solve()?;

        let mut deltas = Vec::with_capacity(lengths.len());
        let mut delta_max: f64 = 0.0;
        for (actuator, &length) in self.actuators.iter().zip(&lengths) {
            let staged = f64::from(Actuator::encode_mm(length));
            let delta = (staged - f64::from(actuator.target_counts())).abs();
            delta_max = delta_max.max(delta);
            deltas.push(delta);
        }

        if delta_max == 0.0 {
            return Ok(());
        }

        for ((actuator, &length), &delta) in self.actuators.iter().zip(&lengths).zip(&deltas) {
            actuator.set_target_mm(length);
            actuator.set_speed((delta * 255.0 / delta_max).round() as u8);
        }

        self.node.set_speeds().await?;
        self.node.set_targets().await?;
        Ok(())
    }

    /// Drives every leg to its home switch and awaits the acknowledgement.
    pub async fn home(&self) -> Result<()> {
        self.node.home().await
    }
}
