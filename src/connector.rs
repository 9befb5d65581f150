//! The connector head at the end of a winch cable.
//!
//! A connector is either held rigidly at an attach node (the winch's own node
//! while `Locked`, the target's node while `Plugged` or `Docked`) or promoted
//! to a free body hanging on the cable while `Deployed`. Promotion moves the
//! connector's mass out of the winch part and demotion returns it.

use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

use crate::body::{BodyId, Pose, ShapePrimitive};
use crate::error::ConnectorError;
use crate::events::{LinkEvent, NoticeLevel};
use crate::joint::JointEnd;
use crate::peer::{Peer, PeerId};
use crate::sim::Simulation;
use crate::state::{Hook, StateMachine};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectorState {
    /// Held at the winch; cable fully retracted.
    Locked,
    /// Hanging free on the cable.
    Deployed,
    /// Held at a linked target's node; the link joint carries the load.
    Plugged,
    /// Locked at the winch while linked; the two parts are rigidly coupled.
    Docked,
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Locked => "LOCKED",
            Self::Deployed => "DEPLOYED",
            Self::Plugged => "PLUGGED",
            Self::Docked => "DOCKED",
        };
        f.write_str(s)
    }
}

use ConnectorState::*;

const CONNECTOR_TABLE: &[(ConnectorState, &[ConnectorState])] = &[
    (Locked, &[Deployed, Plugged, Docked]),
    (Deployed, &[Locked, Plugged]),
    (Plugged, &[Deployed, Docked]),
    (Docked, &[Plugged, Locked]),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectorReaction {
    Persist,
    Lock,
    Deploy,
    Plug,
    Dock,
    Undock,
}

fn connector_machine() -> StateMachine<ConnectorState, ConnectorReaction> {
    let mut machine = StateMachine::new("connector", CONNECTOR_TABLE);
    machine.on(Hook::Enter(Locked), ConnectorReaction::Lock);
    machine.on(Hook::Enter(Deployed), ConnectorReaction::Deploy);
    machine.on(Hook::Enter(Plugged), ConnectorReaction::Plug);
    machine.on(Hook::Enter(Docked), ConnectorReaction::Dock);
    machine.on(Hook::Leave(Docked), ConnectorReaction::Undock);
    machine.on(Hook::Any, ConnectorReaction::Persist);
    machine
}

/// How the connector is represented in the physics world.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectorBody {
    /// Rigidly held at a peer's attach node, facing it when `flipped`.
    Attached { peer: PeerId, flipped: bool },
    /// Promoted to a body of its own.
    Dynamic { body: BodyId },
}

#[derive(Clone, Debug)]
pub struct Connector {
    pub(crate) pose: Pose,
    pub(crate) body: ConnectorBody,
    pub(crate) shape: ShapePrimitive,
    pub(crate) mass: f32,
    pub(crate) machine: StateMachine<ConnectorState, ConnectorReaction>,
}

impl Connector {
    pub(crate) fn new(owner: PeerId, shape: ShapePrimitive, density: f32) -> Self {
        Self {
            pose: Pose::IDENTITY,
            body: ConnectorBody::Attached {
                peer: owner,
                flipped: false,
            },
            shape,
            mass: shape.mass(density),
            machine: connector_machine(),
        }
    }

    pub fn state(&self) -> Option<ConnectorState> {
        self.machine.current()
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    pub fn body(&self) -> ConnectorBody {
        self.body
    }

    /// The promoted body while deployed.
    pub fn physical_body(&self) -> Option<BodyId> {
        match self.body {
            ConnectorBody::Dynamic { body } => Some(body),
            ConnectorBody::Attached { .. } => None,
        }
    }

    pub fn mass(&self) -> f32 {
        self.mass
    }

    /// Locked at the winch, with or without a link.
    pub fn is_locked(&self) -> bool {
        matches!(self.state(), Some(Locked | Docked))
    }
}

impl Simulation {
    pub fn connector(&self, id: PeerId) -> Option<&Connector> {
        self.winches.get(&id).map(|w| &w.connector)
    }

    pub fn connector_state(&self, id: PeerId) -> Option<ConnectorState> {
        self.connector(id).and_then(Connector::state)
    }

    /// Strict connector transition. The first call starts the machine in any
    /// state. `Plugged` and `Docked` need a live link; `Locked` and
    /// `Deployed` need its absence.
    pub fn set_connector_state(&mut self, id: PeerId, to: ConnectorState) -> Result<(), ConnectorError> {
        let winch = self.winches.get(&id).ok_or(ConnectorError::NoConnector(id))?;
        let linked = self.peers.get(&id).is_some_and(Peer::is_linked);
        match to {
            Plugged | Docked if !linked => return Err(ConnectorError::NotLinked(id)),
            Locked | Deployed if linked => return Err(ConnectorError::StillLinked(id)),
            _ => {}
        }
        if winch.connector.state() == Some(to) {
            return Ok(());
        }

        let t = self
            .winches
            .get_mut(&id)
            .ok_or(ConnectorError::NoConnector(id))?
            .connector
            .machine
            .set_state(to)?;
        debug!(peer = %id, from = ?t.from, to = %t.to, "connector state");
        for reaction in t.reactions {
            match reaction {
                ConnectorReaction::Persist => self.emit(LinkEvent::ConnectorStateChanged {
                    peer: id,
                    from: t.from,
                    to: t.to,
                }),
                ConnectorReaction::Lock => self.lock_connector(id),
                ConnectorReaction::Deploy => self.deploy_connector(id)?,
                ConnectorReaction::Plug => self.plug_connector(id)?,
                ConnectorReaction::Dock => self.dock_connector(id)?,
                ConnectorReaction::Undock => self.undock_connector(id),
            }
        }
        Ok(())
    }

    /// Moves the connector to match a link that was just made or broken.
    pub(crate) fn connector_follow_link(&mut self, id: PeerId) {
        let Some(state) = self.connector_state(id) else {
            return;
        };
        let linked = self.peers.get(&id).is_some_and(Peer::is_linked);
        let next = match (linked, state) {
            (true, Deployed) => Plugged,
            (true, Locked) => match self.dock_blocker(id) {
                None => Docked,
                Some(reason) => {
                    info!(peer = %id, %reason, "connector plugged instead of docked");
                    Plugged
                }
            },
            (false, Plugged) => Deployed,
            (false, Docked) => Locked,
            _ => return,
        };
        if let Err(err) = self.set_connector_state(id, next) {
            warn!(peer = %id, %err, ?next, "connector did not follow the link");
        }
    }

    /// Why a locked connector cannot dock straight onto the linked target node.
    fn dock_blocker(&self, id: PeerId) -> Option<String> {
        let winch = self.winches.get(&id)?;
        let Some(target) = self
            .peers
            .get(&id)
            .and_then(|p| p.other)
            .and_then(|other| self.node_world(other))
        else {
            return Some("target node is missing".to_string());
        };
        self.seat_blocker(id, winch, target.flipped(), true)
    }

    /// Demotes a promoted connector, dropping the cable joint that holds it.
    pub(crate) fn release_connector_body(&mut self, id: PeerId) {
        let Some(ConnectorBody::Dynamic { body }) = self.winches.get(&id).map(|w| w.connector.body) else {
            return;
        };
        if let Some(ctrl) = self.peers.get_mut(&id).and_then(|p| p.joint.as_mut())
            && ctrl.connects(&self.physics, body)
        {
            ctrl.drop_joint(&mut self.physics);
        }
        if let Err(err) = self.physics.demote(body) {
            warn!(peer = %id, %err, "connector body could not be demoted");
        }
    }

    fn attach_connector(&mut self, id: PeerId, host: PeerId, flipped: bool) {
        let pose = self
            .node_world(host)
            .map(|p| if flipped { p.flipped() } else { p });
        if let Some(winch) = self.winches.get_mut(&id) {
            winch.connector.body = ConnectorBody::Attached {
                peer: host,
                flipped,
            };
            if let Some(pose) = pose {
                winch.connector.pose = pose;
            }
        }
    }

    fn lock_connector(&mut self, id: PeerId) {
        self.release_connector_body(id);
        self.attach_connector(id, id, false);
        if let Some(winch) = self.winches.get_mut(&id) {
            winch.cable_length = 0.0;
            winch.kill_motor();
        }
        self.stop_rendering(id);
        info!(peer = %id, "connector locked");
    }

    fn deploy_connector(&mut self, id: PeerId) -> Result<(), ConnectorError> {
        let owner = self.joint_end(id).ok_or(ConnectorError::NoConnector(id))?;
        let winch = self.winches.get(&id).ok_or(ConnectorError::NoConnector(id))?;
        let length = winch.cable_length;
        let body = match winch.connector.body {
            ConnectorBody::Dynamic { body } => body,
            ConnectorBody::Attached { .. } => {
                let c = &winch.connector;
                self.physics
                    .promote(owner.body, "connector", c.pose, c.shape, c.mass)?
            }
        };
        if let Some(winch) = self.winches.get_mut(&id) {
            winch.connector.body = ConnectorBody::Dynamic { body };
        }
        if let Some(ctrl) = self.peers.get_mut(&id).and_then(|p| p.joint.as_mut()) {
            ctrl.create_unchecked(&mut self.physics, owner, JointEnd::new(body, Vec3::ZERO), length)?;
        }
        self.start_rendering(id);
        info!(peer = %id, %body, cable = length, "connector deployed");
        Ok(())
    }

    fn plug_connector(&mut self, id: PeerId) -> Result<(), ConnectorError> {
        let target = self
            .peers
            .get(&id)
            .and_then(|p| p.other)
            .ok_or(ConnectorError::NotLinked(id))?;
        self.release_connector_body(id);
        self.attach_connector(id, target, true);
        self.start_rendering(id);
        info!(peer = %id, %target, "connector plugged");
        Ok(())
    }

    fn dock_connector(&mut self, id: PeerId) -> Result<(), ConnectorError> {
        self.plug_connector(id)?;
        let (part, target) = self
            .peers
            .get(&id)
            .and_then(|p| Some((p.part, p.other?)))
            .ok_or(ConnectorError::NotLinked(id))?;
        let target_part = self
            .peers
            .get(&target)
            .map(|p| p.part)
            .ok_or(ConnectorError::NotLinked(id))?;

        let coupled = if self.physics.is_coupled(part, target_part) {
            true
        } else if self.physics.vessel_of(part) != self.physics.vessel_of(target_part) {
            // The target can have only one parent; park the one it had.
            if let Some(parent) = self.physics.parent_coupling(target_part).map(|c| c.parent) {
                self.physics.decouple(target_part)?;
                if let Some(ctrl) = self.peers.get_mut(&id).and_then(|p| p.joint.as_mut()) {
                    ctrl.park_parent(parent, target_part);
                }
            }
            if let Err(err) = self.physics.couple(part, target_part) {
                self.notice(NoticeLevel::Warning, Some(id), format!("cannot dock: {err}"));
                self.restore_parked_parent(id);
                return Err(err.into());
            }
            true
        } else {
            false
        };

        if let Some(winch) = self.winches.get_mut(&id) {
            winch.cable_length = 0.0;
            winch.kill_motor();
            if coupled {
                winch.coupled_child = Some(target_part);
            }
        }
        if let Some(ctrl) = self.peers.get(&id).and_then(|p| p.joint.as_ref()) {
            ctrl.set_max_length(&mut self.physics, 0.0);
        }
        self.stop_rendering(id);
        info!(peer = %id, %target, coupled, "connector docked");
        Ok(())
    }

    fn undock_connector(&mut self, id: PeerId) {
        if let Some(child) = self.winches.get_mut(&id).and_then(|w| w.coupled_child.take())
            && let Err(err) = self.physics.decouple(child)
        {
            // The target part may already be gone.
            debug!(peer = %id, %err, "nothing to decouple");
        }
        self.restore_parked_parent(id);
        info!(peer = %id, "connector undocked");
    }

    pub(crate) fn restore_parked_parent(&mut self, id: PeerId) {
        let Some((parent, child)) = self
            .peers
            .get_mut(&id)
            .and_then(|p| p.joint.as_mut())
            .and_then(|c| c.take_parked_parent())
        else {
            return;
        };
        if let Err(err) = self.physics.couple(parent, child) {
            warn!(%parent, %child, %err, "previous coupling could not be restored");
        }
    }

    /// Copies attached connectors to their node and promoted ones to their body.
    pub(crate) fn sync_connectors(&mut self) {
        let poses: Vec<(PeerId, Pose)> = self
            .winches
            .iter()
            .filter_map(|(id, w)| {
                let pose = match w.connector.body {
                    ConnectorBody::Attached { peer, flipped } => self
                        .node_world(peer)
                        .map(|p| if flipped { p.flipped() } else { p }),
                    ConnectorBody::Dynamic { body } => self.physics.body(body).map(|b| b.pose),
                }?;
                Some((*id, pose))
            })
            .collect();
        for (id, pose) in poses {
            if let Some(winch) = self.winches.get_mut(&id) {
                winch.connector.pose = pose;
            }
        }
    }
}
