//! Events the host drains after each step.

use serde::{Deserialize, Serialize};

use crate::connector::ConnectorState;
use crate::peer::{LinkState, PeerId};

/// Who caused a link change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkActor {
    /// A programmatic request.
    Api,
    Player,
    /// The physics engine broke the joint.
    Physics,
    /// Teardown, restore and other internal causes.
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoticeLevel {
    Info,
    Warning,
}

/// A user-facing message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub peer: Option<PeerId>,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LinkEvent {
    StateChanged {
        peer: PeerId,
        from: Option<LinkState>,
        to: LinkState,
    },
    /// Raised after both peers are `Linked` and before the joint exists.
    LinkCreated {
        source: PeerId,
        target: PeerId,
        actor: LinkActor,
    },
    /// Raised while the link is still logically known, after the joint is gone.
    JointDestroyed { source: PeerId, target: PeerId },
    LinkBroken {
        source: PeerId,
        target: PeerId,
        actor: LinkActor,
    },
    ConnectorStateChanged {
        peer: PeerId,
        from: Option<ConnectorState>,
        to: ConnectorState,
    },
    Notice(Notice),
}

impl LinkEvent {
    pub fn as_notice(&self) -> Option<&Notice> {
        match self {
            Self::Notice(n) => Some(n),
            _ => None,
        }
    }
}
