//! The step-serialized simulation that owns every peer, link and joint.
//!
//! All mutation happens on the host's thread through [`Simulation::fixed_step`]
//! (physics tick) and [`Simulation::on_frame`] (render bookkeeping) or through
//! the link operations in between them. Peers live in an arena keyed by
//! [`PeerId`]; links are mutual `PeerId` references, never owning pointers.

use glam::Vec3;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

use crate::body::{AttachNode, BodyId, Pose, RigidBody};
use crate::bus::{BusMessage, Channel, Delivery, LinkBus};
use crate::config::{JointConfig, LinkConfig, WinchConfig};
use crate::connector::ConnectorState;
use crate::error::{ConfigError, LinkError};
use crate::events::{LinkActor, LinkEvent, Notice, NoticeLevel};
use crate::joint::{JointController, JointEnd};
use crate::motor::Winch;
use crate::peer::{LinkState, Peer, PeerId, PeerReaction, PeerRole, link_machine};
use crate::physics::PhysicsWorld;
use crate::renderer::LinkRenderer;
use crate::schedule::StepScheduler;

/// Identifier of one committed link; a relink gets a new one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ScheduledTask {
    /// Stop the two linked bodies from colliding once physics has settled.
    IgnoreCollisions {
        source: PeerId,
        a: BodyId,
        b: BodyId,
    },
}

/// Everything needed to create a peer.
#[derive(Clone, Debug)]
pub struct PeerSpec {
    pub part: BodyId,
    pub role: PeerRole,
    pub link: LinkConfig,
    pub joint: JointConfig,
    /// Sources only: a motorized cable with a connector head.
    pub winch: Option<WinchConfig>,
}

impl PeerSpec {
    pub fn source(part: BodyId, link: LinkConfig) -> Self {
        Self {
            part,
            role: PeerRole::Source,
            link,
            joint: JointConfig::default(),
            winch: None,
        }
    }

    pub fn target(part: BodyId, link: LinkConfig) -> Self {
        Self {
            part,
            role: PeerRole::Target,
            link,
            joint: JointConfig::default(),
            winch: None,
        }
    }

    pub fn with_joint(mut self, joint: JointConfig) -> Self {
        self.joint = joint;
        self
    }

    pub fn with_winch(mut self, winch: WinchConfig) -> Self {
        self.winch = Some(winch);
        self
    }
}

pub struct Simulation {
    pub(crate) physics: PhysicsWorld,
    pub(crate) peers: BTreeMap<PeerId, Peer>,
    pub(crate) winches: BTreeMap<PeerId, Winch>,
    pub(crate) renderers: BTreeMap<PeerId, Box<dyn LinkRenderer>>,
    pub(crate) rendering: BTreeSet<PeerId>,
    pub(crate) bus: LinkBus,
    pub(crate) scheduler: StepScheduler<LinkId, ScheduledTask>,
    /// Active link of each linked source.
    pub(crate) links: BTreeMap<PeerId, LinkId>,
    events: Vec<LinkEvent>,
    next_peer: u32,
    next_link: u64,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new(PhysicsWorld::new())
    }
}

impl Simulation {
    pub fn new(physics: PhysicsWorld) -> Self {
        Self {
            physics,
            peers: BTreeMap::new(),
            winches: BTreeMap::new(),
            renderers: BTreeMap::new(),
            rendering: BTreeSet::new(),
            bus: LinkBus::new(),
            scheduler: StepScheduler::new(),
            links: BTreeMap::new(),
            events: Vec::new(),
            next_peer: 0,
            next_link: 0,
        }
    }

    pub fn physics(&self) -> &PhysicsWorld {
        &self.physics
    }

    pub fn physics_mut(&mut self) -> &mut PhysicsWorld {
        &mut self.physics
    }

    pub fn current_step(&self) -> u64 {
        self.scheduler.current_step()
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn peers_on(&self, part: BodyId) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|p| p.part == part)
            .map(|p| p.id)
            .collect()
    }

    pub fn link_state(&self, id: PeerId) -> Option<LinkState> {
        self.peers.get(&id).and_then(Peer::current_state)
    }

    pub fn link_id(&self, source: PeerId) -> Option<LinkId> {
        self.links.get(&source).copied()
    }

    pub fn set_renderer(&mut self, id: PeerId, renderer: Box<dyn LinkRenderer>) {
        self.renderers.insert(id, renderer);
    }

    pub fn is_rendering(&self, id: PeerId) -> bool {
        self.rendering.contains(&id)
    }

    pub fn events(&self) -> &[LinkEvent] {
        &self.events
    }

    pub fn drain_events(&mut self) -> Vec<LinkEvent> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn emit(&mut self, event: LinkEvent) {
        self.events.push(event);
    }

    pub(crate) fn notice(&mut self, level: NoticeLevel, peer: Option<PeerId>, message: impl Into<String>) {
        let message = message.into();
        match level {
            NoticeLevel::Info => info!(peer = ?peer, %message, "notice"),
            NoticeLevel::Warning => warn!(peer = ?peer, %message, "notice"),
        }
        self.events.push(LinkEvent::Notice(Notice {
            level,
            peer,
            message,
        }));
    }

    pub(crate) fn peer_ref(&self, id: PeerId) -> Result<&Peer, LinkError> {
        self.peers.get(&id).ok_or(LinkError::UnknownPeer(id))
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Creates a peer in `Available`. Sources with a winch start with the
    /// connector `Locked`.
    pub fn add_peer(&mut self, spec: PeerSpec) -> Result<PeerId, LinkError> {
        let has_winch = spec.winch.is_some() && spec.role == PeerRole::Source;
        let id = self.insert_peer(spec, LinkState::Available)?;
        if has_winch && let Err(err) = self.set_connector_state(id, ConnectorState::Locked) {
            warn!(peer = %id, %err, "connector failed to start");
        }
        self.collect_dependencies(id);
        self.settle(id);
        Ok(id)
    }

    /// Registers a peer and force-sets `initial` as its first state.
    pub(crate) fn insert_peer(&mut self, spec: PeerSpec, initial: LinkState) -> Result<PeerId, LinkError> {
        let PeerSpec {
            part,
            role,
            link,
            mut joint,
            winch,
        } = spec;
        let body = self
            .physics
            .body(part)
            .ok_or(ConfigError::UnknownPart(part))?;

        let node_auto_created = body.node(&link.attach_node).is_none();
        if node_auto_created {
            let node = match &link.attach_node_def {
                Some(def) => AttachNode::from_definition(link.attach_node.clone(), def)?,
                None => AttachNode::new(link.attach_node.clone(), Vec3::ZERO, Vec3::Z),
            };
            debug!(%part, node = %node.name, "attach node created");
            if let Some(body) = self.physics.body_mut(part) {
                body.attach_nodes.push(node);
            }
        }

        let id = PeerId(self.next_peer);
        self.next_peer += 1;

        let winch = match (role, winch) {
            (PeerRole::Source, Some(cfg)) => {
                let cfg = cfg.sanitized();
                joint.max_length = cfg.max_cable_length;
                Some(Winch::new(cfg, id))
            }
            (PeerRole::Target, Some(_)) => {
                warn!(peer = %id, "winch ignored on a link target");
                None
            }
            _ => None,
        };

        let peer = Peer {
            id,
            role,
            part,
            config: link,
            machine: link_machine(role),
            other: None,
            other_persistent_id: None,
            other_node: None,
            joint: (role == PeerRole::Source).then(|| JointController::new(joint)),
            node_auto_created,
            parked_node: None,
            persisted_state: initial,
            own_node_blocked: false,
            locked_by: BTreeSet::new(),
            blocked_by: BTreeSet::new(),
        };
        info!(peer = %id, %part, ?role, link_type = %peer.config.link_type, "peer added");
        self.peers.insert(id, peer);
        if let Some(winch) = winch {
            self.winches.insert(id, winch);
        }
        self.bus.subscribe(Channel::Part(part), id);
        self.transition(id, initial)?;
        Ok(id)
    }

    /// Tears a peer down: breaks or cancels its link, stops its state
    /// machines so cleanup reactions run, then forgets it.
    pub fn remove_peer(&mut self, id: PeerId) -> Result<(), LinkError> {
        let peer = self.peer_ref(id)?;
        match peer.state() {
            LinkState::Linked => {
                self.break_current_link(id, LinkActor::Other)?;
            }
            LinkState::Linking => self.cancel_linking(id)?,
            _ => {}
        }

        if let Some(winch) = self.winches.get_mut(&id) {
            let reactions = winch.connector.machine.stop();
            debug!(peer = %id, fired = reactions.len(), "connector stopped");
            self.release_connector_body(id);
        }
        self.stop_rendering(id);

        if let Some(peer) = self.peers.get_mut(&id) {
            let reactions = peer.machine.stop();
            for reaction in reactions {
                self.react(id, None, reaction);
            }
        }

        // Dependents must forget this peer.
        if let Some(peer) = self.peers.get(&id) {
            let deliveries = self.bus.publish(
                Channel::Part(peer.part),
                id,
                BusMessage::DependencyChanged {
                    peer: id,
                    node: peer.config.attach_node.clone(),
                    linked: false,
                    blocked: false,
                },
            );
            self.deliver(deliveries);
        }
        self.bus.unsubscribe_all(id);

        if let Some(peer) = self.peers.remove(&id)
            && peer.node_auto_created
            && let Some(body) = self.physics.body_mut(peer.part)
        {
            body.attach_nodes.retain(|n| n.name != peer.config.attach_node);
        }
        self.winches.remove(&id);
        self.renderers.remove(&id);
        info!(peer = %id, "peer removed");
        Ok(())
    }

    /// Removes a part with every peer on it. Links to peers elsewhere are
    /// broken first, so plugged connectors fall back to deployed.
    pub fn remove_part(&mut self, part: BodyId) -> Result<Option<RigidBody>, LinkError> {
        for id in self.peers_on(part) {
            self.remove_peer(id)?;
        }
        Ok(self.physics.remove_body(part))
    }

    // ─── State machine plumbing ─────────────────────────────────────────

    /// Strict transition of a peer's link state, running its reactions.
    pub fn set_peer_state(&mut self, id: PeerId, to: LinkState) -> Result<(), LinkError> {
        self.transition(id, to)
    }

    pub(crate) fn transition(&mut self, id: PeerId, to: LinkState) -> Result<(), LinkError> {
        let peer = self.peers.get_mut(&id).ok_or(LinkError::UnknownPeer(id))?;
        let t = peer.machine.set_state(to)?;
        if t.from == Some(t.to) {
            return Ok(());
        }
        debug!(peer = %id, from = ?t.from, to = ?t.to, "link state");
        self.emit(LinkEvent::StateChanged {
            peer: id,
            from: t.from,
            to: t.to,
        });
        for reaction in t.reactions {
            self.react(id, Some(t.to), reaction);
        }
        Ok(())
    }

    fn react(&mut self, id: PeerId, to: Option<LinkState>, reaction: PeerReaction) {
        match reaction {
            PeerReaction::Persist => {
                if let (Some(peer), Some(to)) = (self.peers.get_mut(&id), to) {
                    peer.persisted_state = to;
                }
            }
            PeerReaction::SyncAttachNode => self.sync_attach_node(id),
            PeerReaction::SubscribeLinking => {
                self.bus.subscribe(Channel::Linking, id);
            }
            PeerReaction::UnsubscribeLinking => {
                self.bus.unsubscribe(Channel::Linking, id);
            }
            PeerReaction::AnnounceLinked => self.announce_dependency(id),
        }
    }

    /// Auto-created nodes are present on the part only while unoccupied.
    fn sync_attach_node(&mut self, id: PeerId) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        if !peer.node_auto_created {
            return;
        }
        let occupied = peer.current_state().is_some_and(LinkState::occupies_node);
        let Some(body) = self.physics.body_mut(peer.part) else {
            return;
        };
        if occupied {
            if let Some(idx) = body
                .attach_nodes
                .iter()
                .position(|n| n.name == peer.config.attach_node)
            {
                peer.parked_node = Some(body.attach_nodes.remove(idx));
            }
        } else if let Some(node) = peer.parked_node.take() {
            body.attach_nodes.push(node);
        }
    }

    pub(crate) fn deliver(&mut self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            self.handle_delivery(delivery);
        }
    }

    fn handle_delivery(&mut self, delivery: Delivery) {
        let Delivery { recipient, message } = delivery;
        let Some(peer) = self.peers.get(&recipient) else {
            return;
        };
        let state = peer.state();
        let result = match message {
            BusMessage::LinkingStarted { source } => {
                let Some(src) = self.peers.get(&source) else {
                    return;
                };
                if state != LinkState::Available || peer.part == src.part {
                    return;
                }
                let next = if peer.role == PeerRole::Target && peer.config.link_type == src.config.link_type
                {
                    LinkState::AcceptingLinks
                } else {
                    LinkState::RejectingLinks
                };
                self.transition(recipient, next)
            }
            BusMessage::LinkingStopped { .. } | BusMessage::LinkAccepted { .. } => {
                if !matches!(state, LinkState::AcceptingLinks | LinkState::RejectingLinks) {
                    return;
                }
                self.transition(recipient, LinkState::Available)
                    .map(|()| self.settle(recipient))
            }
            BusMessage::DependencyChanged {
                peer: origin,
                node,
                linked,
                blocked,
            } => {
                if !peer.config.dependent_nodes.contains(&node) {
                    return;
                }
                if let Some(peer) = self.peers.get_mut(&recipient) {
                    if linked {
                        peer.locked_by.insert(origin);
                    } else {
                        peer.locked_by.remove(&origin);
                    }
                    if blocked {
                        peer.blocked_by.insert(origin);
                    } else {
                        peer.blocked_by.remove(&origin);
                    }
                }
                self.settle(recipient);
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!(peer = %recipient, %err, "bus message not applied");
        }
    }

    // ─── Dependent nodes ────────────────────────────────────────────────

    fn announce_dependency(&mut self, id: PeerId) {
        let Some(peer) = self.peers.get(&id) else {
            return;
        };
        let deliveries = self.bus.publish(
            Channel::Part(peer.part),
            id,
            BusMessage::DependencyChanged {
                peer: id,
                node: peer.config.attach_node.clone(),
                linked: peer.is_linked(),
                blocked: peer.own_node_blocked,
            },
        );
        self.deliver(deliveries);
    }

    /// Rebuilds a peer's view of its dependent siblings from scratch.
    pub(crate) fn collect_dependencies(&mut self, id: PeerId) {
        let Some(peer) = self.peers.get(&id) else {
            return;
        };
        let mut locked_by = BTreeSet::new();
        let mut blocked_by = BTreeSet::new();
        for other in self.peers.values() {
            if other.id == id
                || other.part != peer.part
                || !peer.config.dependent_nodes.contains(&other.config.attach_node)
            {
                continue;
            }
            if other.is_linked() {
                locked_by.insert(other.id);
            }
            if other.own_node_blocked {
                blocked_by.insert(other.id);
            }
        }
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.locked_by = locked_by;
            peer.blocked_by = blocked_by;
        }
    }

    /// Moves a peer into the state its node and dependents call for.
    pub(crate) fn settle(&mut self, id: PeerId) {
        let Some(peer) = self.peers.get(&id) else {
            return;
        };
        let Some(desired) = peer.settled_state() else {
            return;
        };
        if desired == peer.state() {
            return;
        }
        let direct = peer.machine.can_transition(desired);
        let result = if direct {
            self.transition(id, desired)
        } else {
            self.transition(id, LinkState::Available)
                .and_then(|()| self.transition(id, desired))
        };
        if let Err(err) = result {
            warn!(peer = %id, ?desired, %err, "peer could not settle");
        }
    }

    /// Marks the peer's node as occupied by something other than a link.
    pub fn set_node_blocked(&mut self, id: PeerId, blocked: bool) -> Result<(), LinkError> {
        let peer = self.peers.get_mut(&id).ok_or(LinkError::UnknownPeer(id))?;
        if peer.own_node_blocked == blocked {
            return Ok(());
        }
        peer.own_node_blocked = blocked;
        self.settle(id);
        self.announce_dependency(id);
        Ok(())
    }

    // ─── Geometry helpers ───────────────────────────────────────────────

    /// The peer's attach node in its part's local space, even while the node
    /// is detached from the part.
    pub(crate) fn node_local(&self, id: PeerId) -> Option<Pose> {
        let peer = self.peers.get(&id)?;
        self.physics
            .body(peer.part)
            .and_then(|b| b.node(&peer.config.attach_node))
            .or(peer.parked_node.as_ref())
            .map(AttachNode::local_pose)
    }

    /// World pose of the peer's attach node.
    pub fn node_world(&self, id: PeerId) -> Option<Pose> {
        let peer = self.peers.get(&id)?;
        let part = self.physics.body(peer.part)?;
        self.node_local(id).map(|local| part.pose.compose(&local))
    }

    pub(crate) fn joint_end(&self, id: PeerId) -> Option<JointEnd> {
        let peer = self.peers.get(&id)?;
        self.node_local(id)
            .map(|local| JointEnd::new(peer.part, local.position))
    }

    // ─── Stepping ───────────────────────────────────────────────────────

    /// One fixed physics step: deferred joint breaks, due scheduled tasks,
    /// then winch motors.
    pub fn fixed_step(&mut self, dt: f32) {
        let due = self.scheduler.advance();
        self.process_joint_breaks();
        for (link, task) in due {
            self.run_task(link, task);
        }
        let winches: Vec<PeerId> = self.winches.keys().copied().collect();
        for id in winches {
            self.update_motor(id, dt);
        }
        self.sync_connectors();
    }

    /// Once per rendered frame: connector poses and renderer updates.
    pub fn on_frame(&mut self) {
        self.sync_connectors();
        let active: Vec<PeerId> = self.rendering.iter().copied().collect();
        for id in active {
            if let Some((from, to)) = self.render_endpoints(id)
                && let Some(renderer) = self.renderers.get_mut(&id)
            {
                renderer.update_render(from, to);
            }
        }
    }

    fn run_task(&mut self, link: LinkId, task: ScheduledTask) {
        match task {
            ScheduledTask::IgnoreCollisions { source, a, b } => {
                if self.links.get(&source) != Some(&link) {
                    debug!(%link, "link gone before collisions were disabled");
                    return;
                }
                self.physics.ignore_collisions(a, b);
                debug!(%link, %a, %b, "collisions disabled between linked bodies");
            }
        }
    }

    pub(crate) fn schedule(&mut self, steps: u64, link: LinkId, task: ScheduledTask) {
        self.scheduler.schedule_in(steps, link, task);
    }

    pub(crate) fn next_link_id(&mut self) -> LinkId {
        self.next_link += 1;
        LinkId(self.next_link)
    }

    // ─── Rendering ──────────────────────────────────────────────────────

    fn render_endpoints(&self, id: PeerId) -> Option<(Pose, Pose)> {
        let from = self.node_world(id)?;
        let to = match self.winches.get(&id) {
            Some(winch) => winch.connector.pose,
            None => self.node_world(self.peers.get(&id)?.other?)?,
        };
        Some((from, to))
    }

    pub(crate) fn start_rendering(&mut self, id: PeerId) {
        if !self.rendering.insert(id) {
            return;
        }
        if let Some((from, to)) = self.render_endpoints(id)
            && let Some(renderer) = self.renderers.get_mut(&id)
        {
            renderer.start_render(from, to);
        }
    }

    pub(crate) fn stop_rendering(&mut self, id: PeerId) {
        if self.rendering.remove(&id)
            && let Some(renderer) = self.renderers.get_mut(&id)
        {
            renderer.stop_render();
        }
    }
}
