//! The link handshake and the link/unlink protocol.
//!
//! A link is made in two phases. The logical phase sets the mutual references
//! and moves both peers to `Linked` before anyone is notified; the physical
//! phase then creates the joint. Breaking runs the other way round: the joint
//! goes first while the link is still known, then the logical state is cleared.

use tracing::{debug, info, warn};

use crate::bus::{BusMessage, Channel};
use crate::config::LinkMode;
use crate::connector::ConnectorState;
use crate::error::{JointError, LinkError};
use crate::events::{LinkActor, LinkEvent, NoticeLevel};
use crate::peer::{LinkState, PeerId, PeerRole};
use crate::sim::{ScheduledTask, Simulation};

impl Simulation {
    /// Puts a source into `Linking` and tells every other peer about it.
    pub fn start_linking(&mut self, id: PeerId, actor: LinkActor) -> Result<(), LinkError> {
        let peer = self.peer_ref(id)?;
        if peer.role != PeerRole::Source {
            return Err(LinkError::NotSource(id));
        }
        let state = peer.state();
        if state != LinkState::Available {
            return Err(LinkError::NotAvailable {
                peer: id,
                state: state.to_string(),
            });
        }
        self.transition(id, LinkState::Linking)?;
        info!(peer = %id, ?actor, "linking started");
        let deliveries = self
            .bus
            .publish(Channel::Linking, id, BusMessage::LinkingStarted { source: id });
        self.deliver(deliveries);
        Ok(())
    }

    /// Abandons a handshake.
    pub fn cancel_linking(&mut self, id: PeerId) -> Result<(), LinkError> {
        if self.peer_ref(id)?.state() != LinkState::Linking {
            return Err(LinkError::NotLinking(id));
        }
        self.transition(id, LinkState::Available)?;
        info!(peer = %id, "linking cancelled");
        let deliveries = self
            .bus
            .publish(Channel::Linking, id, BusMessage::LinkingStopped { source: id });
        self.deliver(deliveries);
        Ok(())
    }

    /// Reasons why `source` cannot link to `target`, as user-facing messages.
    /// Empty means the link is allowed. Checks stop at the first failing
    /// group: states, link type, vessel relationship, then joint geometry.
    pub fn check_can_link_to(&self, source: PeerId, target: PeerId) -> Vec<String> {
        let (Some(src), Some(tgt)) = (self.peers.get(&source), self.peers.get(&target)) else {
            return vec!["peer no longer exists".to_string()];
        };

        let mut violations = Vec::new();
        if src.role != PeerRole::Source {
            violations.push(format!("{source} cannot initiate links"));
        }
        if tgt.role != PeerRole::Target {
            violations.push(format!("{target} cannot accept links"));
        }
        if !matches!(src.state(), LinkState::Available | LinkState::Linking) {
            violations.push(format!("source is {}", src.state()));
        }
        if !matches!(tgt.state(), LinkState::Available | LinkState::AcceptingLinks) {
            violations.push(format!("target is {}", tgt.state()));
        }
        if !violations.is_empty() {
            return violations;
        }

        if src.link_type() != tgt.link_type() {
            return vec![format!(
                "incompatible link type: {} cannot connect to {}",
                src.link_type(),
                tgt.link_type()
            )];
        }

        if src.part == tgt.part {
            return vec!["cannot link a part to itself".to_string()];
        }
        let same_vessel = self.physics.vessel_of(src.part) == self.physics.vessel_of(tgt.part);
        match src.config.link_mode {
            LinkMode::SameVesselOnly if !same_vessel => {
                return vec!["target must be on the same vessel".to_string()];
            }
            LinkMode::DifferentVesselOnly if same_vessel => {
                return vec!["target must be on a different vessel".to_string()];
            }
            _ => {}
        }

        match (
            src.joint.as_ref(),
            self.joint_end(source),
            self.joint_end(target),
        ) {
            (Some(ctrl), Some(a), Some(b)) => ctrl.check_constraints(&self.physics, a, b),
            _ => vec!["attach node is missing".to_string()],
        }
    }

    /// Completes a handshake by linking `source` to `target`.
    ///
    /// On a joint failure both peers end up `Available` again.
    pub fn link_to_target(&mut self, source: PeerId, target: PeerId, actor: LinkActor) -> Result<(), LinkError> {
        if self.peer_ref(source)?.state() != LinkState::Linking {
            return Err(LinkError::NotLinking(source));
        }
        self.peer_ref(target)?;
        let violations = self.check_can_link_to(source, target);
        if !violations.is_empty() {
            self.notice(NoticeLevel::Warning, Some(source), violations.join("; "));
            return Err(LinkError::Rejected(violations));
        }
        self.commit_link(source, target, actor)
    }

    /// Logical link, then the joint. A joint that cannot be made rolls the
    /// logical link back.
    pub(crate) fn commit_link(&mut self, source: PeerId, target: PeerId, actor: LinkActor) -> Result<(), LinkError> {
        let separate_vessels = {
            let part = |id: PeerId| self.peers.get(&id).and_then(|p| self.physics.vessel_of(p.part));
            part(source) != part(target)
        };

        self.logical_link(source, target, actor)?;
        if let Err(err) = self.physical_link(source, target) {
            self.notice(NoticeLevel::Warning, Some(source), format!("cannot link: {err}"));
            self.logical_unlink(source, target, LinkActor::Other);
            return Err(LinkError::JointCreation(err));
        }
        if separate_vessels {
            self.schedule_collision_ignore(source, target);
        }
        info!(%source, %target, ?actor, "link established");
        Ok(())
    }

    /// Breaks the link of either peer.
    pub fn break_current_link(&mut self, id: PeerId, actor: LinkActor) -> Result<(), LinkError> {
        let peer = self.peer_ref(id)?;
        if !peer.is_linked() {
            return Err(LinkError::NotLinked(id));
        }
        let Some(other) = peer.other else {
            warn!(peer = %id, "linked without a partner");
            self.transition(id, LinkState::Available)?;
            return Ok(());
        };
        let (source, target) = match peer.role {
            PeerRole::Source => (id, other),
            PeerRole::Target => (other, id),
        };
        self.physical_unlink(source, target);
        self.logical_unlink(source, target, actor);
        info!(%source, %target, ?actor, "link broken");
        Ok(())
    }

    /// Handles joints the engine reported broken since the last step.
    pub(crate) fn process_joint_breaks(&mut self) {
        for handle in self.physics.take_broken_joints() {
            let owner = self
                .peers
                .values()
                .find(|p| p.joint.as_ref().is_some_and(|c| c.owns(handle)))
                .map(|p| (p.id, p.is_linked()));
            let Some((id, linked)) = owner else {
                debug!(joint = %handle, "stale joint break");
                self.physics.destroy_joint(handle);
                continue;
            };

            if linked {
                if let Err(err) = self.break_current_link(id, LinkActor::Physics) {
                    warn!(peer = %id, %err, "joint break not applied");
                    continue;
                }
                self.restore_parked_parent(id);
                self.notice(NoticeLevel::Info, Some(id), "link broke under load");
            } else if self.connector_state(id) == Some(ConnectorState::Deployed) {
                if let Some(ctrl) = self.peers.get_mut(&id).and_then(|p| p.joint.as_mut()) {
                    ctrl.drop_joint(&mut self.physics);
                }
                if let Err(err) = self.set_connector_state(id, ConnectorState::Locked) {
                    warn!(peer = %id, %err, "connector not recovered");
                }
                self.notice(NoticeLevel::Info, Some(id), "cable snapped, connector returned to the winch");
            } else if let Some(ctrl) = self.peers.get_mut(&id).and_then(|p| p.joint.as_mut()) {
                ctrl.drop_joint(&mut self.physics);
            }
        }
    }

    fn logical_link(&mut self, source: PeerId, target: PeerId, actor: LinkActor) -> Result<(), LinkError> {
        let src = self.peer_ref(source)?;
        let src_pid = self.physics.body(src.part).map(|b| b.persistent_id);
        let src_node = src.config.attach_node.clone();
        let tgt = self.peer_ref(target)?;
        let tgt_pid = self.physics.body(tgt.part).map(|b| b.persistent_id);
        let tgt_node = tgt.config.attach_node.clone();

        // Both sides know each other before either one changes state.
        if let Some(tgt) = self.peers.get_mut(&target) {
            tgt.other = Some(source);
            tgt.other_persistent_id = src_pid;
            tgt.other_node = Some(src_node);
        }
        if let Some(src) = self.peers.get_mut(&source) {
            src.other = Some(target);
            src.other_persistent_id = tgt_pid;
            src.other_node = Some(tgt_node);
        }
        let link = self.next_link_id();
        self.links.insert(source, link);

        self.transition(source, LinkState::Linked)?;
        self.transition(target, LinkState::Linked)?;
        self.emit(LinkEvent::LinkCreated {
            source,
            target,
            actor,
        });
        let deliveries = self.bus.publish(
            Channel::Linking,
            source,
            BusMessage::LinkAccepted { source, target },
        );
        self.deliver(deliveries);
        self.connector_follow_link(source);
        Ok(())
    }

    fn physical_link(&mut self, source: PeerId, target: PeerId) -> Result<(), JointError> {
        let (Some(a), Some(b)) = (self.joint_end(source), self.joint_end(target)) else {
            return Err(JointError::Constraints(vec!["attach node is missing".to_string()]));
        };
        let length = match self.winches.get(&source) {
            Some(w) if w.connector.state() == Some(ConnectorState::Docked) => 0.0,
            Some(_) => match (self.node_world(source), self.node_world(target)) {
                (Some(from), Some(to)) => from.position.distance(to.position),
                _ => 0.0,
            },
            None => self
                .peers
                .get(&source)
                .and_then(|p| p.joint.as_ref())
                .map_or(0.0, |c| c.config().max_length),
        };
        let Some(ctrl) = self.peers.get_mut(&source).and_then(|p| p.joint.as_mut()) else {
            return Err(JointError::Constraints(vec!["peer cannot own a joint".to_string()]));
        };
        ctrl.create_joint(&mut self.physics, a, b, length)?;
        if let Some(winch) = self.winches.get_mut(&source) {
            winch.cable_length = length;
        }
        if !self.winches.contains_key(&source) {
            self.start_rendering(source);
        }
        Ok(())
    }

    fn physical_unlink(&mut self, source: PeerId, target: PeerId) {
        if let Some(link) = self.links.get(&source).copied() {
            self.scheduler.cancel(&link);
        }
        let parts = (
            self.peers.get(&source).map(|p| p.part),
            self.peers.get(&target).map(|p| p.part),
        );
        if let (Some(a), Some(b)) = parts {
            self.physics.restore_collisions(a, b);
        }
        if let Some(ctrl) = self.peers.get_mut(&source).and_then(|p| p.joint.as_mut()) {
            ctrl.drop_joint(&mut self.physics);
        }
        if !self.winches.contains_key(&source) {
            self.stop_rendering(source);
        }
        self.emit(LinkEvent::JointDestroyed { source, target });
    }

    fn logical_unlink(&mut self, source: PeerId, target: PeerId, actor: LinkActor) {
        for id in [source, target] {
            if let Some(peer) = self.peers.get_mut(&id) {
                peer.other = None;
                peer.other_persistent_id = None;
                peer.other_node = None;
            }
        }
        self.links.remove(&source);
        for id in [source, target] {
            if let Err(err) = self.transition(id, LinkState::Available) {
                warn!(peer = %id, %err, "peer did not return to available");
            }
        }
        self.emit(LinkEvent::LinkBroken {
            source,
            target,
            actor,
        });
        self.connector_follow_link(source);
        self.settle(source);
        self.settle(target);
    }

    fn schedule_collision_ignore(&mut self, source: PeerId, target: PeerId) {
        let (Some(link), Some(src), Some(tgt)) = (
            self.links.get(&source).copied(),
            self.peers.get(&source),
            self.peers.get(&target),
        ) else {
            return;
        };
        let steps = src
            .joint
            .as_ref()
            .map_or(1, |c| c.config().collision_warmup_steps);
        let task = ScheduledTask::IgnoreCollisions {
            source,
            a: src.part,
            b: tgt.part,
        };
        self.schedule(steps, link, task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{BodyId, RigidBody, ShapePrimitive};
    use crate::config::{LinkConfig, WinchConfig};
    use crate::sim::PeerSpec;
    use glam::Vec3;

    fn part(sim: &mut Simulation, name: &str) -> BodyId {
        sim.physics_mut()
            .add_part(RigidBody::part(name, ShapePrimitive::Sphere(0.5), 100.0))
    }

    /// A locked winch on `a` ready to dock with a facing target on `b`.
    fn docking_pair(sim: &mut Simulation, a: BodyId, b: BodyId) -> (PeerId, PeerId) {
        let winch = WinchConfig {
            max_cable_length: 10.0,
            ..WinchConfig::default()
        };
        let src = sim
            .add_peer(PeerSpec::source(a, LinkConfig::new("cable", "tether")).with_winch(winch))
            .unwrap();
        let tgt = sim
            .add_peer(PeerSpec::target(
                b,
                LinkConfig::new("cable", "tether").with_node_def("0,0,0,0,0,-1"),
            ))
            .unwrap();
        (src, tgt)
    }

    #[test]
    fn failed_joint_rolls_back_the_logical_link() {
        let mut sim = Simulation::default();
        let a = part(&mut sim, "winch");
        let b = part(&mut sim, "anchor");
        let (src, tgt) = docking_pair(&mut sim, a, b);

        sim.start_linking(src, LinkActor::Player).unwrap();
        assert!(sim.check_can_link_to(src, tgt).is_empty());

        // Debris drifts onto the anchor points after the check passed.
        let debris = part(&mut sim, "debris");
        let result = sim.commit_link(src, tgt, LinkActor::Player);
        assert!(matches!(result, Err(LinkError::JointCreation(_))));

        for id in [src, tgt] {
            assert_eq!(sim.link_state(id), Some(LinkState::Available));
            assert_eq!(sim.peer(id).unwrap().other_peer(), None);
        }
        assert_eq!(sim.physics().joint_count(), 0);
        assert!(!sim.physics().is_coupled(a, b));
        assert_ne!(sim.physics().vessel_of(a), sim.physics().vessel_of(b));
        assert_eq!(sim.connector_state(src), Some(ConnectorState::Locked));

        // The docking was undone through the link events, no joint was reported.
        assert!(sim.events().iter().any(|e| matches!(e, LinkEvent::LinkCreated { .. })));
        assert!(sim.events().iter().any(|e| matches!(e, LinkEvent::LinkBroken { .. })));
        assert!(!sim.events().iter().any(|e| matches!(e, LinkEvent::JointDestroyed { .. })));
        assert!(
            sim.events()
                .iter()
                .filter_map(LinkEvent::as_notice)
                .any(|n| n.level == NoticeLevel::Warning && n.message.starts_with("cannot link"))
        );

        // Clearing the path makes the same pair linkable again.
        sim.physics_mut().remove_body(debris);
        sim.start_linking(src, LinkActor::Player).unwrap();
        sim.link_to_target(src, tgt, LinkActor::Player).unwrap();
        assert_eq!(sim.connector_state(src), Some(ConnectorState::Docked));
        assert!(sim.physics().is_coupled(a, b));
    }
}
