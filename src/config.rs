//! Immutable configuration snapshots handed to each component at construction.
//!
//! Values are not validated beyond [`sanitized`](JointConfig::sanitized)
//! clamping, which replaces non-finite or negative numbers with sane ones.

use serde::{Deserialize, Serialize};

use crate::body::ShapePrimitive;
use glam::Vec3;

/// Which vessels a source may link to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkMode {
    /// Both peers must be on the same composite body.
    SameVesselOnly,
    /// Peers must be on different composite bodies.
    DifferentVesselOnly,
    #[default]
    Any,
}

/// Configuration of one link endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Compatibility key; only peers with equal tags can link.
    pub link_type: String,
    /// Name of the attach node the peer occupies.
    pub attach_node: String,
    /// Node definition (`"px, py, pz, dx, dy, dz"`) used when the part has no
    /// node of that name. `None` creates a node at the origin facing +Z.
    pub attach_node_def: Option<String>,
    /// Names of sibling nodes whose link/block state this peer mirrors.
    pub dependent_nodes: Vec<String>,
    pub link_mode: LinkMode,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            link_type: "cable".to_string(),
            attach_node: "tether".to_string(),
            attach_node_def: None,
            dependent_nodes: Vec::new(),
            link_mode: LinkMode::Any,
        }
    }
}

impl LinkConfig {
    pub fn new(link_type: impl Into<String>, attach_node: impl Into<String>) -> Self {
        Self {
            link_type: link_type.into(),
            attach_node: attach_node.into(),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: LinkMode) -> Self {
        self.link_mode = mode;
        self
    }

    pub fn with_dependent(mut self, node: impl Into<String>) -> Self {
        self.dependent_nodes.push(node.into());
        self
    }

    pub fn with_node_def(mut self, def: impl Into<String>) -> Self {
        self.attach_node_def = Some(def.into());
        self
    }
}

/// Parameters of the spring joint a link materializes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JointConfig {
    /// Longest distance (m) between anchors at link time.
    pub max_length: f32,
    /// Spring force (N/m) pulling the bodies back within the allowed length.
    pub spring: f32,
    pub damper: f32,
    /// Force (N) above which the joint breaks.
    pub break_force: f32,
    /// Torque (Nm) above which the joint breaks.
    pub break_torque: f32,
    /// Steps to wait before disabling collisions between freshly linked
    /// bodies of different vessels.
    pub collision_warmup_steps: u64,
}

impl Default for JointConfig {
    fn default() -> Self {
        Self {
            max_length: 10.0,
            spring: 1000.0,
            damper: 1.0,
            break_force: f32::INFINITY,
            break_torque: f32::INFINITY,
            collision_warmup_steps: 2,
        }
    }
}

impl JointConfig {
    pub fn sanitized(self) -> Self {
        let d = Self::default();
        Self {
            max_length: non_negative(self.max_length, d.max_length),
            spring: non_negative(self.spring, d.spring),
            damper: non_negative(self.damper, d.damper),
            break_force: threshold(self.break_force),
            break_torque: threshold(self.break_torque),
            collision_warmup_steps: self.collision_warmup_steps,
        }
    }
}

/// Winch motor and connector head parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WinchConfig {
    /// Longest cable (m) the winch can deploy.
    pub max_cable_length: f32,
    /// Motor speed limit (m/s).
    pub motor_max_speed: f32,
    /// Motor acceleration (m/s²). `f32::INFINITY` reaches the target speed in one step.
    pub motor_acceleration: f32,
    /// Electric charge drained per meter of cable moved.
    pub power_per_meter: f32,
    /// Largest anchor distance (m) at which the connector may lock.
    pub lock_distance_tolerance: f32,
    /// Largest angle (degrees) between connector and node at which a linked
    /// connector may dock.
    pub lock_angle_tolerance: f32,
    pub connector_shape: ShapePrimitive,
    /// Connector density (kg/m³), used to derive its mass contribution.
    pub connector_density: f32,
}

impl Default for WinchConfig {
    fn default() -> Self {
        Self {
            max_cable_length: 50.0,
            motor_max_speed: 2.0,
            motor_acceleration: 0.4,
            power_per_meter: 0.5,
            lock_distance_tolerance: 0.05,
            lock_angle_tolerance: 3.0,
            connector_shape: ShapePrimitive::Box(Vec3::splat(0.1)),
            connector_density: 100.0,
        }
    }
}

impl WinchConfig {
    pub fn sanitized(self) -> Self {
        let d = Self::default();
        Self {
            max_cable_length: non_negative(self.max_cable_length, d.max_cable_length),
            motor_max_speed: non_negative(self.motor_max_speed, d.motor_max_speed),
            motor_acceleration: if self.motor_acceleration.is_nan() || self.motor_acceleration <= 0.0
            {
                d.motor_acceleration
            } else {
                self.motor_acceleration
            },
            power_per_meter: non_negative(self.power_per_meter, d.power_per_meter),
            lock_distance_tolerance: non_negative(
                self.lock_distance_tolerance,
                d.lock_distance_tolerance,
            ),
            lock_angle_tolerance: non_negative(self.lock_angle_tolerance, d.lock_angle_tolerance)
                .min(180.0),
            connector_shape: self.connector_shape,
            connector_density: non_negative(self.connector_density, d.connector_density),
        }
    }
}

fn non_negative(value: f32, fallback: f32) -> f32 {
    if value.is_finite() && value >= 0.0 {
        value
    } else {
        fallback
    }
}

// Infinity is a legal "unbreakable" threshold.
fn threshold(value: f32) -> f32 {
    if value.is_nan() || value < 0.0 {
        f32::INFINITY
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_nonsense() {
        let cfg = JointConfig {
            max_length: -3.0,
            spring: f32::NAN,
            break_force: -1.0,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(cfg.max_length, 10.0);
        assert_eq!(cfg.spring, 1000.0);
        assert_eq!(cfg.break_force, f32::INFINITY);
    }

    #[test]
    fn infinite_acceleration_survives_sanitize() {
        let cfg = WinchConfig {
            motor_acceleration: f32::INFINITY,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(cfg.motor_acceleration, f32::INFINITY);
    }

    #[test]
    fn link_config_deserializes_with_defaults_for_mode() {
        let json = r#"{
            "link_type": "rope",
            "attach_node": "top",
            "attach_node_def": null,
            "dependent_nodes": ["bottom"],
            "link_mode": "DifferentVesselOnly"
        }"#;
        let cfg: LinkConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.link_mode, LinkMode::DifferentVesselOnly);
        assert_eq!(cfg.dependent_nodes, vec!["bottom".to_string()]);
    }
}
