//! Engine-agnostic physics world model.
//!
//! [`PhysicsWorld`] is the record a host engine keeps in sync with its own
//! scene: bodies, spring joints, rigid couplings between composite bodies,
//! promoted connector bodies and pairs excluded from collision. The engine
//! reports joint failures through [`PhysicsWorld::notify_joint_broken`] (or
//! [`PhysicsWorld::apply_joint_load`]); they are consumed on the next
//! simulation step, never inside the engine callback.

use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

use crate::body::{BodyId, BodyKind, PersistentId, Pose, RigidBody, ShapePrimitive, VesselId};
use crate::error::PhysicsError;

/// Identifier of a spring joint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JointHandle(pub u32);

impl fmt::Display for JointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "joint#{}", self.0)
    }
}

/// A spring-like distance joint between two bodies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpringJoint {
    pub body_a: BodyId,
    pub body_b: BodyId,
    /// Anchor in `body_a`'s local space.
    pub anchor_a: Vec3,
    /// Anchor in `body_b`'s local space.
    pub anchor_b: Vec3,
    pub spring: f32,
    pub damper: f32,
    pub break_force: f32,
    pub break_torque: f32,
    /// Current longest distance the spring lets the anchors drift apart.
    pub max_length: f32,
}

impl SpringJoint {
    pub fn involves(&self, body: BodyId) -> bool {
        self.body_a == body || self.body_b == body
    }
}

/// A rigid merge of `child`'s composite body into `parent`'s.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coupling {
    pub parent: BodyId,
    pub child: BodyId,
    /// Vessel the child group belonged to before the merge.
    pub child_vessel: VesselId,
    /// Bodies moved into the parent's vessel.
    pub moved: Vec<BodyId>,
}

/// Bookkeeping for a body promoted out of an owner part.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DynamicsRecord {
    pub owner: BodyId,
    /// Mass taken from the owner, returned on demotion.
    pub mass: f32,
}

#[derive(Debug, Default)]
pub struct PhysicsWorld {
    bodies: BTreeMap<BodyId, RigidBody>,
    joints: BTreeMap<JointHandle, SpringJoint>,
    couplings: Vec<Coupling>,
    dynamics: BTreeMap<BodyId, DynamicsRecord>,
    ignored_collisions: BTreeSet<(BodyId, BodyId)>,
    broken: Vec<JointHandle>,
    next_body: u32,
    next_joint: u32,
    next_vessel: u32,
    next_persistent: PersistentId,
}

fn ordered(a: BodyId, b: BodyId) -> (BodyId, BodyId) {
    if a <= b { (a, b) } else { (b, a) }
}

impl PhysicsWorld {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Bodies ─────────────────────────────────────────────────────────

    /// Registers a part. A part without a vessel gets a fresh one, and a zero
    /// persistent id is replaced by a unique one.
    pub fn add_part(&mut self, mut body: RigidBody) -> BodyId {
        let id = BodyId(self.next_body);
        self.next_body += 1;
        if body.vessel.is_none() {
            body.vessel = Some(self.new_vessel());
        }
        if body.persistent_id == 0 {
            self.next_persistent += 1;
            while self.find_by_persistent_id(self.next_persistent).is_some() {
                self.next_persistent += 1;
            }
            body.persistent_id = self.next_persistent;
        }
        debug!(body = %id, name = %body.name, "part added");
        self.bodies.insert(id, body);
        id
    }

    pub fn new_vessel(&mut self) -> VesselId {
        self.next_vessel += 1;
        VesselId(self.next_vessel)
    }

    /// Removes a body with every joint, coupling and collision pair touching it.
    pub fn remove_body(&mut self, id: BodyId) -> Option<RigidBody> {
        let body = self.bodies.remove(&id)?;
        self.joints.retain(|_, j| !j.involves(id));
        self.couplings.retain(|c| c.parent != id && c.child != id);
        self.ignored_collisions.retain(|(a, b)| *a != id && *b != id);
        self.dynamics.remove(&id);
        Some(body)
    }

    pub fn body(&self, id: BodyId) -> Option<&RigidBody> {
        self.bodies.get(&id)
    }

    pub fn body_mut(&mut self, id: BodyId) -> Option<&mut RigidBody> {
        self.bodies.get_mut(&id)
    }

    pub fn bodies(&self) -> impl Iterator<Item = (BodyId, &RigidBody)> {
        self.bodies.iter().map(|(id, b)| (*id, b))
    }

    pub fn contains(&self, id: BodyId) -> bool {
        self.bodies.contains_key(&id)
    }

    pub fn find_by_persistent_id(&self, pid: PersistentId) -> Option<BodyId> {
        self.bodies
            .iter()
            .find(|(_, b)| b.kind == BodyKind::Part && b.persistent_id == pid)
            .map(|(id, _)| *id)
    }

    pub fn vessel_of(&self, id: BodyId) -> Option<VesselId> {
        self.bodies.get(&id).and_then(|b| b.vessel)
    }

    pub fn vessel_bodies(&self, vessel: VesselId) -> Vec<BodyId> {
        self.bodies
            .iter()
            .filter(|(_, b)| b.vessel == Some(vessel))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn node_pose(&self, id: BodyId, node: &str) -> Result<Pose, PhysicsError> {
        let body = self.bodies.get(&id).ok_or(PhysicsError::UnknownBody(id))?;
        body.node_pose(node)
            .ok_or_else(|| PhysicsError::UnknownNode(id, node.to_string()))
    }

    pub fn has_node(&self, id: BodyId, node: &str) -> bool {
        self.bodies.get(&id).is_some_and(|b| b.node(node).is_some())
    }

    // ─── Joints ─────────────────────────────────────────────────────────

    pub fn create_spring_joint(&mut self, joint: SpringJoint) -> Result<JointHandle, PhysicsError> {
        for body in [joint.body_a, joint.body_b] {
            if !self.bodies.contains_key(&body) {
                return Err(PhysicsError::UnknownBody(body));
            }
        }
        let handle = JointHandle(self.next_joint);
        self.next_joint += 1;
        debug!(joint = %handle, a = %joint.body_a, b = %joint.body_b, max = joint.max_length, "spring joint created");
        self.joints.insert(handle, joint);
        Ok(handle)
    }

    pub fn destroy_joint(&mut self, handle: JointHandle) -> Option<SpringJoint> {
        self.broken.retain(|h| *h != handle);
        self.joints.remove(&handle)
    }

    pub fn joint(&self, handle: JointHandle) -> Option<&SpringJoint> {
        self.joints.get(&handle)
    }

    pub fn joint_count(&self) -> usize {
        self.joints.len()
    }

    pub fn set_joint_max_length(&mut self, handle: JointHandle, length: f32) -> bool {
        match self.joints.get_mut(&handle) {
            Some(joint) => {
                joint.max_length = length.max(0.0);
                true
            }
            None => false,
        }
    }

    /// World positions of both anchors.
    pub fn joint_anchors(&self, handle: JointHandle) -> Option<(Vec3, Vec3)> {
        let joint = self.joints.get(&handle)?;
        let a = self.bodies.get(&joint.body_a)?;
        let b = self.bodies.get(&joint.body_b)?;
        Some((
            a.pose.transform_point(joint.anchor_a),
            b.pose.transform_point(joint.anchor_b),
        ))
    }

    /// Actual distance between the anchors.
    pub fn joint_length(&self, handle: JointHandle) -> Option<f32> {
        self.joint_anchors(handle).map(|(a, b)| a.distance(b))
    }

    /// Reports the load the engine measured on a joint this step. Loads over
    /// either threshold break the joint.
    pub fn apply_joint_load(&mut self, handle: JointHandle, force: f32, torque: f32) {
        if let Some(joint) = self.joints.get(&handle)
            && (force > joint.break_force || torque > joint.break_torque)
        {
            info!(joint = %handle, force, torque, "joint overloaded");
            self.notify_joint_broken(handle);
        }
    }

    /// Engine callback: the joint broke. Processed on the next step.
    pub fn notify_joint_broken(&mut self, handle: JointHandle) {
        if self.joints.contains_key(&handle) && !self.broken.contains(&handle) {
            self.broken.push(handle);
        }
    }

    pub fn take_broken_joints(&mut self) -> Vec<JointHandle> {
        std::mem::take(&mut self.broken)
    }

    // ─── Couplings ──────────────────────────────────────────────────────

    /// Merges `child`'s composite body into `parent`'s.
    pub fn couple(&mut self, parent: BodyId, child: BodyId) -> Result<(), PhysicsError> {
        if self.is_coupled(parent, child) {
            return Ok(());
        }
        let reject = |reason: &str| PhysicsError::CouplingRejected {
            parent,
            child,
            reason: reason.to_string(),
        };
        if parent == child {
            return Err(reject("a body cannot couple to itself"));
        }
        let parent_vessel = self
            .vessel_of(parent)
            .ok_or(PhysicsError::UnknownBody(parent))?;
        let child_vessel = self.vessel_of(child).ok_or(PhysicsError::UnknownBody(child))?;
        if parent_vessel == child_vessel {
            return Err(reject("bodies already share a composite body"));
        }
        if self.parent_coupling(child).is_some() {
            return Err(reject("child is already coupled to a parent"));
        }

        let moved = self.vessel_bodies(child_vessel);
        for id in &moved {
            if let Some(body) = self.bodies.get_mut(id) {
                body.vessel = Some(parent_vessel);
            }
        }
        info!(%parent, %child, moved = moved.len(), "bodies coupled");
        self.couplings.push(Coupling {
            parent,
            child,
            child_vessel,
            moved,
        });
        Ok(())
    }

    /// Undoes the coupling that made `child` part of its parent's composite body.
    pub fn decouple(&mut self, child: BodyId) -> Result<Coupling, PhysicsError> {
        let idx = self
            .couplings
            .iter()
            .position(|c| c.child == child)
            .ok_or(PhysicsError::NotCoupled(child))?;
        let coupling = self.couplings.remove(idx);
        for id in &coupling.moved {
            if let Some(body) = self.bodies.get_mut(id) {
                body.vessel = Some(coupling.child_vessel);
            }
        }
        info!(parent = %coupling.parent, %child, "bodies decoupled");
        Ok(coupling)
    }

    /// Moves `body` alone into a fresh composite body, dropping any coupling
    /// it took part in.
    pub fn separate(&mut self, body: BodyId) -> Result<VesselId, PhysicsError> {
        if !self.bodies.contains_key(&body) {
            return Err(PhysicsError::UnknownBody(body));
        }
        self.couplings.retain(|c| c.parent != body && c.child != body);
        for coupling in &mut self.couplings {
            coupling.moved.retain(|id| *id != body);
        }
        let vessel = self.new_vessel();
        if let Some(b) = self.bodies.get_mut(&body) {
            b.vessel = Some(vessel);
        }
        warn!(%body, %vessel, "body forcibly separated");
        Ok(vessel)
    }

    pub fn parent_coupling(&self, child: BodyId) -> Option<&Coupling> {
        self.couplings.iter().find(|c| c.child == child)
    }

    pub fn is_coupled(&self, a: BodyId, b: BodyId) -> bool {
        self.couplings
            .iter()
            .any(|c| (c.parent == a && c.child == b) || (c.parent == b && c.child == a))
    }

    // ─── Collisions ─────────────────────────────────────────────────────

    pub fn ignore_collisions(&mut self, a: BodyId, b: BodyId) {
        self.ignored_collisions.insert(ordered(a, b));
    }

    pub fn restore_collisions(&mut self, a: BodyId, b: BodyId) {
        self.ignored_collisions.remove(&ordered(a, b));
    }

    pub fn collisions_ignored(&self, a: BodyId, b: BodyId) -> bool {
        self.ignored_collisions.contains(&ordered(a, b))
    }

    /// First part whose bounding sphere the segment `from → to` passes through.
    pub fn path_obstruction(&self, from: Vec3, to: Vec3, ignore: &[BodyId]) -> Option<BodyId> {
        let seg = to - from;
        let len_sq = seg.length_squared();
        self.bodies
            .iter()
            .filter(|(id, b)| b.kind == BodyKind::Part && !ignore.contains(id))
            .find(|(_, b)| {
                let center = b.pose.position;
                let t = if len_sq > f32::EPSILON {
                    ((center - from).dot(seg) / len_sq).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                let closest = from + seg * t;
                closest.distance(center) < b.shape.bounding_radius()
            })
            .map(|(id, _)| *id)
    }

    // ─── Promotion ──────────────────────────────────────────────────────

    /// Gives a shape independent dynamics, taking `mass` from `owner`.
    ///
    /// The new body starts with the owner's velocities so it does not snap.
    pub fn promote(
        &mut self,
        owner: BodyId,
        name: &str,
        pose: Pose,
        shape: ShapePrimitive,
        mass: f32,
    ) -> Result<BodyId, PhysicsError> {
        let owner_body = self
            .bodies
            .get_mut(&owner)
            .ok_or(PhysicsError::UnknownBody(owner))?;
        let taken = mass.min(owner_body.mass).max(0.0);
        owner_body.mass -= taken;
        let body = RigidBody {
            name: name.to_string(),
            kind: BodyKind::Connector,
            persistent_id: 0,
            vessel: None,
            pose,
            linear_velocity: owner_body.linear_velocity,
            angular_velocity: owner_body.angular_velocity,
            shape,
            mass: taken,
            attach_nodes: Vec::new(),
            electric_charge: 0.0,
        };
        let id = BodyId(self.next_body);
        self.next_body += 1;
        self.bodies.insert(id, body);
        self.dynamics.insert(
            id,
            DynamicsRecord {
                owner,
                mass: taken,
            },
        );
        debug!(body = %id, %owner, mass = taken, "body promoted");
        Ok(id)
    }

    /// Removes a promoted body and returns its mass to the owner. Joints
    /// touching the body are destroyed with it.
    pub fn demote(&mut self, body: BodyId) -> Result<(RigidBody, DynamicsRecord), PhysicsError> {
        let record = self
            .dynamics
            .remove(&body)
            .ok_or(PhysicsError::NotPromoted(body))?;
        let removed = self
            .remove_body(body)
            .ok_or(PhysicsError::UnknownBody(body))?;
        if let Some(owner) = self.bodies.get_mut(&record.owner) {
            owner.mass += record.mass;
        }
        debug!(%body, owner = %record.owner, "body demoted");
        Ok((removed, record))
    }

    pub fn is_promoted(&self, body: BodyId) -> bool {
        self.dynamics.contains_key(&body)
    }

    // ─── Resources ──────────────────────────────────────────────────────

    pub fn vessel_charge(&self, vessel: VesselId) -> f32 {
        self.bodies
            .values()
            .filter(|b| b.vessel == Some(vessel))
            .map(|b| b.electric_charge)
            .sum()
    }

    /// Takes `amount` of electric charge from the vessel's parts. Takes
    /// nothing and returns `false` when the vessel holds less.
    pub fn drain_charge(&mut self, vessel: VesselId, amount: f32) -> bool {
        if amount <= 0.0 {
            return true;
        }
        if self.vessel_charge(vessel) + 1e-6 < amount {
            return false;
        }
        let mut left = amount;
        for body in self.bodies.values_mut().filter(|b| b.vessel == Some(vessel)) {
            let take = body.electric_charge.min(left);
            body.electric_charge -= take;
            left -= take;
            if left <= 0.0 {
                break;
            }
        }
        true
    }
}
