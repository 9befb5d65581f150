//! # tether-link
//!
//! Engine-agnostic cable links between simulated vessels.
//!
//! Two peers (a *source* that initiates and a *target* that accepts) agree on a
//! link through a handshake, after which the source owns a spring joint that
//! physically tethers the two parts. A source may carry a winch whose connector
//! head is locked at the winch, deployed on the cable, plugged into the target
//! or docked rigidly against it.
//!
//! The logical link state, the physical joint and the connector are kept
//! consistent across any number of [`Simulation::fixed_step`] calls and across
//! save/reload through [`PeerSnapshot`]s. The host mirrors its engine scene in
//! the [`PhysicsWorld`] and drains [`LinkEvent`]s after each step.

pub mod body;
pub mod bus;
pub mod config;
pub mod connector;
pub mod error;
pub mod events;
pub mod joint;
pub mod link;
pub mod motor;
pub mod peer;
pub mod persistence;
pub mod physics;
pub mod renderer;
pub mod schedule;
pub mod sim;
pub mod state;

pub use body::*;
pub use config::*;
pub use connector::{Connector, ConnectorBody, ConnectorState};
pub use error::*;
pub use events::*;
pub use joint::{JointController, JointEnd};
pub use motor::Winch;
pub use peer::{LinkState, Peer, PeerId, PeerRole};
pub use persistence::{ConnectorSnapshot, PeerSnapshot};
pub use physics::*;
pub use renderer::LinkRenderer;
pub use sim::{LinkId, PeerSpec, Simulation};
pub use state::{Hook, StateMachine, Transition};
