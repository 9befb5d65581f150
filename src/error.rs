//! Error types.
//!
//! Nothing in this crate is unrecoverable: every error leaves both peers of a
//! link in a valid state. Failures the player should see are also pushed as
//! [`Notice`](crate::Notice) events.

use thiserror::Error;

use crate::body::BodyId;
use crate::peer::PeerId;

/// Errors raised by a [`StateMachine`](crate::StateMachine).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// The requested state is not a successor of the current one.
    #[error("{machine}: illegal transition {from} -> {to}")]
    InvalidTransition {
        machine: &'static str,
        from: String,
        to: String,
    },

    /// The machine was stopped and accepts no further transitions.
    #[error("{machine}: machine is stopped")]
    Stopped { machine: &'static str },
}

/// Errors from the physics world model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PhysicsError {
    #[error("unknown body {0}")]
    UnknownBody(BodyId),

    #[error("{0} has no attach node named {1:?}")]
    UnknownNode(BodyId, String),

    #[error("{child} cannot be coupled to {parent}: {reason}")]
    CouplingRejected {
        parent: BodyId,
        child: BodyId,
        reason: String,
    },

    #[error("{0} is not coupled to a parent")]
    NotCoupled(BodyId),

    #[error("{0} is not a promoted body")]
    NotPromoted(BodyId),
}

/// Errors from the [`JointController`](crate::JointController).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JointError {
    /// Geometric pre-check failed. Contains user-facing messages.
    #[error("joint constraints violated: {}", .0.join("; "))]
    Constraints(Vec<String>),

    #[error(transparent)]
    Physics(#[from] PhysicsError),
}

/// Errors from the link protocol.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// The peer cannot initiate links.
    #[error("{0} is not a link source")]
    NotSource(PeerId),

    #[error("{peer} cannot start linking from state {state}")]
    NotAvailable { peer: PeerId, state: String },

    #[error("{0} is not linking")]
    NotLinking(PeerId),

    #[error("{0} is not linked")]
    NotLinked(PeerId),

    /// `check_can_link_to` failed. Contains user-facing messages.
    #[error("link rejected: {}", .0.join("; "))]
    Rejected(Vec<String>),

    /// The logical link was committed but the joint could not be created; the
    /// logical link has been rolled back.
    #[error("joint creation failed: {0}")]
    JointCreation(JointError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Physics(#[from] PhysicsError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors from the connector state machine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectorError {
    #[error("{0} has no connector")]
    NoConnector(PeerId),

    /// `Plugged` and `Docked` require an established link.
    #[error("connector of {0} requires a link for this state")]
    NotLinked(PeerId),

    /// `Locked` and `Deployed` are only reachable once the link is gone.
    #[error("connector of {0} is plugged into a live link")]
    StillLinked(PeerId),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Physics(#[from] PhysicsError),

    #[error(transparent)]
    Joint(#[from] JointError),
}

/// Errors from the winch motor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MotorError {
    #[error("{0} has no winch")]
    NoWinch(PeerId),

    #[error("cable is at maximum length")]
    AtMaxLength,

    #[error("connector is already locked")]
    AlreadyLocked,

    #[error("not enough electric charge")]
    NoEnergy,

    #[error("connector cannot lock: {0}")]
    Misaligned(String),

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

/// Configuration problems.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("bad attach node definition {0:?}")]
    BadNodeDefinition(String),

    #[error("unknown part {0}")]
    UnknownPart(BodyId),
}
