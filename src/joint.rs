//! Physical joint owned by a link source.

use glam::Vec3;
use tracing::{debug, info, warn};

use crate::body::BodyId;
use crate::config::JointConfig;
use crate::error::JointError;
use crate::physics::{JointHandle, PhysicsWorld, SpringJoint};

/// One side of a joint: a body and an anchor in its local space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JointEnd {
    pub body: BodyId,
    pub anchor: Vec3,
}

impl JointEnd {
    pub fn new(body: BodyId, anchor: Vec3) -> Self {
        Self { body, anchor }
    }

    fn world_point(&self, world: &PhysicsWorld) -> Option<Vec3> {
        world
            .body(self.body)
            .map(|b| b.pose.transform_point(self.anchor))
    }
}

/// Creates, tunes and destroys the spring joint of one link.
///
/// At most one joint primitive exists per controller.
#[derive(Clone, Debug)]
pub struct JointController {
    config: JointConfig,
    joint: Option<JointHandle>,
    /// An external parent coupling undone while docked, restored on undock.
    parked_parent: Option<(BodyId, BodyId)>,
}

impl JointController {
    pub fn new(config: JointConfig) -> Self {
        Self {
            config: config.sanitized(),
            joint: None,
            parked_parent: None,
        }
    }

    pub fn config(&self) -> &JointConfig {
        &self.config
    }

    pub fn handle(&self) -> Option<JointHandle> {
        self.joint
    }

    pub fn is_active(&self) -> bool {
        self.joint.is_some()
    }

    pub fn owns(&self, handle: JointHandle) -> bool {
        self.joint == Some(handle)
    }

    /// User-facing reasons why a joint between `a` and `b` cannot exist.
    /// Empty means the joint is possible.
    pub fn check_constraints(&self, world: &PhysicsWorld, a: JointEnd, b: JointEnd) -> Vec<String> {
        let mut violations = Vec::new();
        let (Some(from), Some(to)) = (a.world_point(world), b.world_point(world)) else {
            violations.push("linked body no longer exists".to_string());
            return violations;
        };
        let distance = from.distance(to);
        if distance > self.config.max_length {
            violations.push(format!(
                "distance too long: {distance:.2} > max {:.2}",
                self.config.max_length
            ));
        }
        if let Some(hit) = world.path_obstruction(from, to, &[a.body, b.body]) {
            let name = world.body(hit).map(|b| b.name.as_str()).unwrap_or("?");
            violations.push(format!("path is obstructed by {name}"));
        }
        violations
    }

    /// Materializes the link joint after checking constraints.
    ///
    /// An existing joint is torn down first.
    pub fn create_joint(
        &mut self,
        world: &mut PhysicsWorld,
        a: JointEnd,
        b: JointEnd,
        max_length: f32,
    ) -> Result<JointHandle, JointError> {
        let violations = self.check_constraints(world, a, b);
        if !violations.is_empty() {
            return Err(JointError::Constraints(violations));
        }
        self.create_unchecked(world, a, b, max_length)
    }

    /// Materializes a joint without geometric checks, as for a cable to the
    /// connector head or a joint restored from a save.
    pub fn create_unchecked(
        &mut self,
        world: &mut PhysicsWorld,
        a: JointEnd,
        b: JointEnd,
        max_length: f32,
    ) -> Result<JointHandle, JointError> {
        if let Some(old) = self.joint.take() {
            warn!(joint = %old, "replacing an existing joint");
            world.destroy_joint(old);
        }
        let handle = world.create_spring_joint(SpringJoint {
            body_a: a.body,
            body_b: b.body,
            anchor_a: a.anchor,
            anchor_b: b.anchor,
            spring: self.config.spring,
            damper: self.config.damper,
            break_force: self.config.break_force,
            break_torque: self.config.break_torque,
            max_length: max_length.clamp(0.0, self.config.max_length),
        })?;
        info!(joint = %handle, a = %a.body, b = %b.body, "joint created");
        self.joint = Some(handle);
        Ok(handle)
    }

    /// Destroys the joint, if any.
    pub fn drop_joint(&mut self, world: &mut PhysicsWorld) -> Option<SpringJoint> {
        let handle = self.joint.take()?;
        let joint = world.destroy_joint(handle);
        debug!(joint = %handle, "joint dropped");
        joint
    }

    pub fn set_max_length(&self, world: &mut PhysicsWorld, length: f32) {
        if let Some(handle) = self.joint {
            world.set_joint_max_length(handle, length.clamp(0.0, self.config.max_length));
        }
    }

    pub fn max_length(&self, world: &PhysicsWorld) -> Option<f32> {
        self.joint
            .and_then(|h| world.joint(h))
            .map(|j| j.max_length)
    }

    /// Actual anchor distance.
    pub fn current_length(&self, world: &PhysicsWorld) -> Option<f32> {
        self.joint.and_then(|h| world.joint_length(h))
    }

    /// Whether the joint's far end is `body`.
    pub fn connects(&self, world: &PhysicsWorld, body: BodyId) -> bool {
        self.joint
            .and_then(|h| world.joint(h))
            .is_some_and(|j| j.involves(body))
    }

    pub(crate) fn park_parent(&mut self, parent: BodyId, child: BodyId) {
        self.parked_parent = Some((parent, child));
    }

    pub(crate) fn take_parked_parent(&mut self) -> Option<(BodyId, BodyId)> {
        self.parked_parent.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{Pose, RigidBody, ShapePrimitive};

    fn world_with_gap(gap: f32) -> (PhysicsWorld, BodyId, BodyId) {
        let mut world = PhysicsWorld::new();
        let a = world.add_part(RigidBody::part("a", ShapePrimitive::Sphere(0.5), 100.0));
        let b = world.add_part(
            RigidBody::part("b", ShapePrimitive::Sphere(0.5), 100.0)
                .with_pose(Pose::from_position(Vec3::new(gap, 0.0, 0.0))),
        );
        (world, a, b)
    }

    #[test]
    fn too_long_is_reported_with_numbers() {
        let (world, a, b) = world_with_gap(12.0);
        let ctrl = JointController::new(JointConfig::default());
        let v = ctrl.check_constraints(&world, JointEnd::new(a, Vec3::ZERO), JointEnd::new(b, Vec3::ZERO));
        assert_eq!(v, vec!["distance too long: 12.00 > max 10.00".to_string()]);
    }

    #[test]
    fn create_fails_without_touching_world() {
        let (mut world, a, b) = world_with_gap(12.0);
        let mut ctrl = JointController::new(JointConfig::default());
        let err = ctrl
            .create_joint(&mut world, JointEnd::new(a, Vec3::ZERO), JointEnd::new(b, Vec3::ZERO), 12.0)
            .unwrap_err();
        assert!(matches!(err, JointError::Constraints(_)));
        assert_eq!(world.joint_count(), 0);
        assert!(!ctrl.is_active());
    }

    #[test]
    fn create_replaces_and_drop_is_idempotent() {
        let (mut world, a, b) = world_with_gap(3.0);
        let mut ctrl = JointController::new(JointConfig::default());
        let ends = (JointEnd::new(a, Vec3::ZERO), JointEnd::new(b, Vec3::ZERO));
        let first = ctrl.create_joint(&mut world, ends.0, ends.1, 3.0).unwrap();
        let second = ctrl.create_joint(&mut world, ends.0, ends.1, 3.0).unwrap();
        assert_ne!(first, second);
        assert_eq!(world.joint_count(), 1);
        assert_eq!(ctrl.current_length(&world), Some(3.0));

        assert!(ctrl.drop_joint(&mut world).is_some());
        assert!(ctrl.drop_joint(&mut world).is_none());
        assert_eq!(world.joint_count(), 0);
    }

    #[test]
    fn max_length_is_clamped_to_config() {
        let (mut world, a, b) = world_with_gap(1.0);
        let mut ctrl = JointController::new(JointConfig::default());
        ctrl.create_joint(&mut world, JointEnd::new(a, Vec3::ZERO), JointEnd::new(b, Vec3::ZERO), 1.0)
            .unwrap();
        ctrl.set_max_length(&mut world, 25.0);
        assert_eq!(ctrl.max_length(&world), Some(10.0));
    }
}
