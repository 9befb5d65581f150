//! In-process message bus for coordination between peers.
//!
//! The bus is owned by one [`Simulation`](crate::Simulation), so nothing leaks
//! across simulations or reloads. Peers subscribe to [`Channel::Linking`] while
//! they are in a state that cares about other handshakes, and to their part's
//! channel for the lifetime of the peer.

use std::collections::{BTreeMap, BTreeSet};

use crate::body::BodyId;
use crate::peer::PeerId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Channel {
    /// Handshake announcements, simulation wide.
    Linking,
    /// Sibling announcements between peers on one part.
    Part(BodyId),
}

#[derive(Clone, Debug, PartialEq)]
pub enum BusMessage {
    LinkingStarted { source: PeerId },
    LinkingStopped { source: PeerId },
    LinkAccepted { source: PeerId, target: PeerId },
    /// A peer's own link or node-block status changed.
    DependencyChanged {
        peer: PeerId,
        node: String,
        linked: bool,
        blocked: bool,
    },
}

/// A message addressed to one subscriber.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub recipient: PeerId,
    pub message: BusMessage,
}

#[derive(Debug, Default)]
pub struct LinkBus {
    subscriptions: BTreeMap<Channel, BTreeSet<PeerId>>,
}

impl LinkBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the peer was already subscribed.
    pub fn subscribe(&mut self, channel: Channel, peer: PeerId) -> bool {
        self.subscriptions.entry(channel).or_default().insert(peer)
    }

    pub fn unsubscribe(&mut self, channel: Channel, peer: PeerId) -> bool {
        let Some(set) = self.subscriptions.get_mut(&channel) else {
            return false;
        };
        let removed = set.remove(&peer);
        if set.is_empty() {
            self.subscriptions.remove(&channel);
        }
        removed
    }

    pub fn unsubscribe_all(&mut self, peer: PeerId) {
        for set in self.subscriptions.values_mut() {
            set.remove(&peer);
        }
        self.subscriptions.retain(|_, set| !set.is_empty());
    }

    pub fn is_subscribed(&self, channel: Channel, peer: PeerId) -> bool {
        self.subscriptions
            .get(&channel)
            .is_some_and(|set| set.contains(&peer))
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.subscriptions.get(&channel).map_or(0, BTreeSet::len)
    }

    /// Addresses `message` to every subscriber except `sender`.
    pub fn publish(&self, channel: Channel, sender: PeerId, message: BusMessage) -> Vec<Delivery> {
        self.subscriptions
            .get(&channel)
            .into_iter()
            .flatten()
            .filter(|p| **p != sender)
            .map(|p| Delivery {
                recipient: *p,
                message: message.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_skips_sender_and_other_channels() {
        let mut bus = LinkBus::new();
        bus.subscribe(Channel::Linking, PeerId(1));
        bus.subscribe(Channel::Linking, PeerId(2));
        bus.subscribe(Channel::Part(BodyId(0)), PeerId(3));

        let out = bus.publish(
            Channel::Linking,
            PeerId(1),
            BusMessage::LinkingStarted { source: PeerId(1) },
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].recipient, PeerId(2));
    }

    #[test]
    fn unsubscribe_all_cleans_empty_channels() {
        let mut bus = LinkBus::new();
        assert!(bus.subscribe(Channel::Linking, PeerId(1)));
        assert!(!bus.subscribe(Channel::Linking, PeerId(1)));
        bus.subscribe(Channel::Part(BodyId(4)), PeerId(1));
        bus.unsubscribe_all(PeerId(1));
        assert_eq!(bus.subscriber_count(Channel::Linking), 0);
        assert!(!bus.is_subscribed(Channel::Part(BodyId(4)), PeerId(1)));
    }
}
