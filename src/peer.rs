//! Link endpoints and their lifecycle state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::body::{AttachNode, BodyId, PersistentId};
use crate::config::LinkConfig;
use crate::joint::JointController;
use crate::state::{Hook, StateMachine};

/// Identifier of a peer inside a [`Simulation`](crate::Simulation).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Lifecycle state of one endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    /// Free to start or accept a link.
    Available,
    /// A source waiting to be connected to a target.
    Linking,
    /// Another pair is handshaking; links are refused meanwhile.
    RejectingLinks,
    /// A compatible source is linking; this target may accept.
    AcceptingLinks,
    Linked,
    /// A dependent sibling is linked.
    Locked,
    /// Something else is attached at the node (here or on a dependent sibling).
    NodeIsBlocked,
}

impl LinkState {
    pub const ALL: [LinkState; 7] = [
        LinkState::Available,
        LinkState::Linking,
        LinkState::RejectingLinks,
        LinkState::AcceptingLinks,
        LinkState::Linked,
        LinkState::Locked,
        LinkState::NodeIsBlocked,
    ];

    /// Handshake states that do not survive a reload.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Linking | Self::AcceptingLinks | Self::RejectingLinks
        )
    }

    /// States in which the attach node is occupied by the link.
    pub fn occupies_node(self) -> bool {
        matches!(self, Self::Linked | Self::Locked)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Available => "AVAILABLE",
            Self::Linking => "LINKING",
            Self::RejectingLinks => "REJECTING_LINKS",
            Self::AcceptingLinks => "ACCEPTING_LINKS",
            Self::Linked => "LINKED",
            Self::Locked => "LOCKED",
            Self::NodeIsBlocked => "NODE_IS_BLOCKED",
        };
        f.write_str(s)
    }
}

/// Which side of a link a peer plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    /// Initiates links and owns the joint.
    Source,
    /// Accepts links.
    Target,
}

use LinkState::*;

const SOURCE_TABLE: &[(LinkState, &[LinkState])] = &[
    (Available, &[Linking, RejectingLinks, Locked, NodeIsBlocked]),
    (Linking, &[Available, Linked]),
    (Linked, &[Available]),
    (Locked, &[Available]),
    (NodeIsBlocked, &[Available]),
    (RejectingLinks, &[Available, Locked, NodeIsBlocked]),
];

const TARGET_TABLE: &[(LinkState, &[LinkState])] = &[
    (Available, &[AcceptingLinks, RejectingLinks, Linked, Locked, NodeIsBlocked]),
    (AcceptingLinks, &[Available, Linked, Locked, NodeIsBlocked]),
    (Linked, &[Available]),
    (Locked, &[Available]),
    (NodeIsBlocked, &[Available]),
    (RejectingLinks, &[Available, Locked, NodeIsBlocked]),
];

impl PeerRole {
    pub fn transitions(self) -> &'static [(LinkState, &'static [LinkState])] {
        match self {
            Self::Source => SOURCE_TABLE,
            Self::Target => TARGET_TABLE,
        }
    }
}

/// Side effects registered on a peer's state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerReaction {
    /// Record the state for the next save and tell the host.
    Persist,
    /// Re-add or drop an auto-created attach node to match the state.
    SyncAttachNode,
    SubscribeLinking,
    UnsubscribeLinking,
    /// Tell dependent siblings this peer's link status changed.
    AnnounceLinked,
}

pub(crate) fn link_machine(role: PeerRole) -> StateMachine<LinkState, PeerReaction> {
    let mut machine = StateMachine::new(
        match role {
            PeerRole::Source => "link-source",
            PeerRole::Target => "link-target",
        },
        role.transitions(),
    );
    machine.on(Hook::Any, PeerReaction::Persist);
    for state in [Linked, Locked] {
        machine.on(Hook::Enter(state), PeerReaction::SyncAttachNode);
        machine.on(Hook::Leave(state), PeerReaction::SyncAttachNode);
    }
    machine.on(Hook::Enter(Available), PeerReaction::SubscribeLinking);
    for state in [Linking, Linked, Locked, NodeIsBlocked] {
        machine.on(Hook::Enter(state), PeerReaction::UnsubscribeLinking);
    }
    machine.on(Hook::Enter(Linked), PeerReaction::AnnounceLinked);
    machine.on(Hook::Leave(Linked), PeerReaction::AnnounceLinked);
    machine
}

/// One endpoint of a potential link.
#[derive(Debug)]
pub struct Peer {
    pub(crate) id: PeerId,
    pub(crate) role: PeerRole,
    pub(crate) part: BodyId,
    pub(crate) config: LinkConfig,
    pub(crate) machine: StateMachine<LinkState, PeerReaction>,

    /// Lookup-only back reference; lifetime is owned by the simulation arena.
    pub(crate) other: Option<PeerId>,
    pub(crate) other_persistent_id: Option<PersistentId>,
    pub(crate) other_node: Option<String>,

    /// Present for sources.
    pub(crate) joint: Option<JointController>,

    /// The node was created by this peer rather than taken from the part.
    pub(crate) node_auto_created: bool,
    /// The auto-created node while it is detached from the part.
    pub(crate) parked_node: Option<AttachNode>,

    pub(crate) persisted_state: LinkState,

    pub(crate) own_node_blocked: bool,
    pub(crate) locked_by: BTreeSet<PeerId>,
    pub(crate) blocked_by: BTreeSet<PeerId>,
}

impl Peer {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn part(&self) -> BodyId {
        self.part
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn link_type(&self) -> &str {
        &self.config.link_type
    }

    pub fn attach_node(&self) -> &str {
        &self.config.attach_node
    }

    /// `None` once the peer has been stopped.
    pub fn current_state(&self) -> Option<LinkState> {
        self.machine.current()
    }

    pub fn state(&self) -> LinkState {
        self.machine.current().unwrap_or(Available)
    }

    pub fn is_linked(&self) -> bool {
        self.machine.current() == Some(Linked)
    }

    pub fn is_locked(&self) -> bool {
        self.machine.current() == Some(Locked)
    }

    pub fn other_peer(&self) -> Option<PeerId> {
        self.other
    }

    /// Persistent id of the linked body; kept even when the live peer is gone.
    pub fn other_persistent_id(&self) -> Option<PersistentId> {
        self.other_persistent_id
    }

    pub fn joint(&self) -> Option<&JointController> {
        self.joint.as_ref()
    }

    /// The state the peer should settle in given its own node and its
    /// dependent siblings, or `None` when it is busy with a link.
    pub(crate) fn settled_state(&self) -> Option<LinkState> {
        match self.state() {
            Linked | Linking => None,
            current => {
                let desired = if self.own_node_blocked || !self.blocked_by.is_empty() {
                    NodeIsBlocked
                } else if !self.locked_by.is_empty() {
                    Locked
                } else {
                    Available
                };
                // A handshake state already counts as available.
                if desired == Available && current.is_transient() {
                    None
                } else {
                    Some(desired)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_linking_sources_reach_linked() {
        let m = link_machine(PeerRole::Source);
        let mut m2 = m.clone();
        m2.set_state(Available).unwrap();
        assert!(!m2.can_transition(Linked));
        m2.set_state(Linking).unwrap();
        assert!(m2.can_transition(Linked));
    }

    #[test]
    fn targets_accept_from_available_or_accepting() {
        let mut m = link_machine(PeerRole::Target);
        m.set_state(Available).unwrap();
        assert!(m.can_transition(Linked));
        m.set_state(AcceptingLinks).unwrap();
        assert!(m.can_transition(Linked));
        assert!(m.set_state(Linking).is_err());
    }

    #[test]
    fn linked_only_returns_to_available() {
        for role in [PeerRole::Source, PeerRole::Target] {
            let mut m = link_machine(role);
            m.set_state(Linked).unwrap();
            for to in LinkState::ALL {
                assert_eq!(m.can_transition(to), to == Available || to == Linked);
            }
        }
    }

    #[test]
    fn entering_linked_fires_node_and_announce_reactions() {
        let mut m = link_machine(PeerRole::Target);
        m.set_state(Available).unwrap();
        let t = m.set_state(Linked).unwrap();
        assert!(t.reactions.contains(&PeerReaction::SyncAttachNode));
        assert!(t.reactions.contains(&PeerReaction::UnsubscribeLinking));
        assert!(t.reactions.contains(&PeerReaction::AnnounceLinked));
        assert_eq!(t.reactions.last(), Some(&PeerReaction::Persist));
    }

    #[test]
    fn state_display() {
        assert_eq!(LinkState::NodeIsBlocked.to_string(), "NODE_IS_BLOCKED");
        assert_eq!(LinkState::Available.to_string(), "AVAILABLE");
    }
}
