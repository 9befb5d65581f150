//! Rigid bodies, attach nodes and poses.
//!
//! These are the plain data records a host engine mirrors. A [`RigidBody`] is
//! either a vessel part or a promoted connector head; parts carry named
//! [`AttachNode`]s where links and other parts connect.

use bevy_heavy::ComputeMassProperties3d;
use bevy_math::primitives::{Cuboid, Cylinder, Sphere};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ConfigError;

/// Identifier of a rigid body inside a [`PhysicsWorld`](crate::PhysicsWorld).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BodyId(pub u32);

impl fmt::Display for BodyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "body#{}", self.0)
    }
}

/// Identifier of a composite body: every part rigidly coupled together shares one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VesselId(pub u32);

impl fmt::Display for VesselId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vessel#{}", self.0)
    }
}

/// Identifier that survives save/load, unlike [`BodyId`].
pub type PersistentId = u32;

/// Position and orientation of a body or node.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
    };

    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }

    /// Local forward direction (Z-axis) in world space.
    pub fn forward(&self) -> Vec3 {
        self.rotation * Vec3::Z
    }

    /// Maps a point from this pose's local space into world space.
    pub fn transform_point(&self, local: Vec3) -> Vec3 {
        self.position + self.rotation * local
    }

    /// Composes a child pose expressed in this pose's local frame.
    pub fn compose(&self, local: &Pose) -> Pose {
        Pose {
            position: self.transform_point(local.position),
            rotation: (self.rotation * local.rotation).normalize(),
        }
    }

    /// The same point, facing the opposite way around the local up axis.
    pub fn flipped(&self) -> Pose {
        Pose {
            position: self.position,
            rotation: (self.rotation * Quat::from_rotation_y(std::f32::consts::PI)).normalize(),
        }
    }
}

/// Mass and obstruction shape of a part or connector head, centered on its pose.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ShapePrimitive {
    /// Half-extents along each local axis.
    Box(Vec3),
    /// Radius and full length along the local Y axis, like a cable drum.
    Cylinder { radius: f32, height: f32 },
    Sphere(f32),
}

impl ShapePrimitive {
    /// Mass in kg at `density` kg/m³.
    pub fn mass(self, density: f32) -> f32 {
        match self {
            Self::Box(half_size) => Cuboid { half_size }.mass(density),
            Self::Cylinder { radius, height } => Cylinder::new(radius, height).mass(density),
            Self::Sphere(radius) => Sphere::new(radius).mass(density),
        }
    }

    /// Radius of a sphere around the shape's center that encloses it.
    pub fn bounding_radius(self) -> f32 {
        match self {
            Self::Box(half_extents) => half_extents.length(),
            Self::Cylinder { radius, height } => Vec3::new(radius, height / 2.0, 0.0).length(),
            Self::Sphere(r) => r,
        }
    }
}

/// A named anchor point on a part.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttachNode {
    pub name: String,
    /// Position in the owning body's local space.
    pub position: Vec3,
    /// Orientation in the owning body's local space. The node faces along its local +Z.
    pub rotation: Quat,
}

impl AttachNode {
    pub fn new(name: impl Into<String>, position: Vec3, direction: Vec3) -> Self {
        let dir = direction.try_normalize().unwrap_or(Vec3::Z);
        Self {
            name: name.into(),
            position,
            rotation: Quat::from_rotation_arc(Vec3::Z, dir),
        }
    }

    /// Parses a node definition of the form `"px, py, pz, dx, dy, dz[, size]"`.
    ///
    /// The trailing size component is accepted and ignored.
    pub fn from_definition(name: impl Into<String>, def: &str) -> Result<Self, ConfigError> {
        let values = def
            .split(',')
            .map(|s| s.trim().parse::<f32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ConfigError::BadNodeDefinition(def.to_string()))?;
        if values.len() < 6 || values.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::BadNodeDefinition(def.to_string()));
        }
        Ok(Self::new(
            name,
            Vec3::new(values[0], values[1], values[2]),
            Vec3::new(values[3], values[4], values[5]),
        ))
    }

    pub fn local_pose(&self) -> Pose {
        Pose::new(self.position, self.rotation)
    }
}

/// What a body represents in the simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyKind {
    Part,
    /// A connector head promoted to independent dynamics.
    Connector,
}

/// A single rigid body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RigidBody {
    pub name: String,
    pub kind: BodyKind,

    /// Assigned by the world when zero.
    pub persistent_id: PersistentId,

    /// Composite body this part belongs to. `None` for free connector heads.
    pub vessel: Option<VesselId>,

    pub pose: Pose,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,

    pub shape: ShapePrimitive,

    /// Mass in kg. Promoting a connector moves part of it to the connector body.
    pub mass: f32,

    pub attach_nodes: Vec<AttachNode>,

    /// Stored electric charge available to motors on this part's vessel.
    pub electric_charge: f32,
}

impl RigidBody {
    /// A part whose mass is derived from `shape` and `density` (kg/m³).
    pub fn part(name: impl Into<String>, shape: ShapePrimitive, density: f32) -> Self {
        Self {
            name: name.into(),
            kind: BodyKind::Part,
            persistent_id: 0,
            vessel: None,
            pose: Pose::IDENTITY,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            shape,
            mass: shape.mass(density),
            attach_nodes: Vec::new(),
            electric_charge: 0.0,
        }
    }

    pub fn with_pose(mut self, pose: Pose) -> Self {
        self.pose = pose;
        self
    }

    pub fn with_node(mut self, node: AttachNode) -> Self {
        self.attach_nodes.push(node);
        self
    }

    pub fn with_charge(mut self, charge: f32) -> Self {
        self.electric_charge = charge;
        self
    }

    pub fn with_persistent_id(mut self, id: PersistentId) -> Self {
        self.persistent_id = id;
        self
    }

    pub fn in_vessel(mut self, vessel: VesselId) -> Self {
        self.vessel = Some(vessel);
        self
    }

    pub fn node(&self, name: &str) -> Option<&AttachNode> {
        self.attach_nodes.iter().find(|n| n.name == name)
    }

    /// World pose of the named node.
    pub fn node_pose(&self, name: &str) -> Option<Pose> {
        self.node(name).map(|n| self.pose.compose(&n.local_pose()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_definition_parses_position_and_direction() {
        let node = AttachNode::from_definition("cable", "0, 0.5, 0, 0, 1, 0, 1").unwrap();
        assert_eq!(node.position, Vec3::new(0.0, 0.5, 0.0));
        let fwd = node.local_pose().forward();
        assert!((fwd - Vec3::Y).length() < 1e-5);
    }

    #[test]
    fn node_definition_rejects_garbage() {
        assert!(AttachNode::from_definition("n", "1, 2, three").is_err());
        assert!(AttachNode::from_definition("n", "1, 2, 3").is_err());
    }

    #[test]
    fn node_pose_follows_body_rotation() {
        let body = RigidBody::part("p", ShapePrimitive::Sphere(0.5), 100.0)
            .with_pose(Pose::new(
                Vec3::new(1.0, 0.0, 0.0),
                Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
            ))
            .with_node(AttachNode::new("top", Vec3::Z, Vec3::Z));
        let pose = body.node_pose("top").unwrap();
        // Local +Z turns into world +X after a quarter turn around Y.
        assert!((pose.position - Vec3::new(2.0, 0.0, 0.0)).length() < 1e-5);
        assert!((pose.forward() - Vec3::X).length() < 1e-5);
    }

    #[test]
    fn part_mass_comes_from_density() {
        let body = RigidBody::part("p", ShapePrimitive::Box(Vec3::splat(0.5)), 100.0);
        assert!((body.mass - 100.0).abs() < 1e-3);
    }

    #[test]
    fn drum_mass_matches_cylinder_volume() {
        let drum = ShapePrimitive::Cylinder {
            radius: 0.5,
            height: 2.0,
        };
        let expected = std::f32::consts::PI * 0.25 * 2.0 * 10.0;
        assert!((drum.mass(10.0) - expected).abs() < 1e-3);
        assert!((drum.bounding_radius() - 1.25f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn flipped_pose_reverses_forward() {
        let pose = Pose::IDENTITY.flipped();
        assert!((pose.forward() + Vec3::Z).length() < 1e-5);
    }
}
