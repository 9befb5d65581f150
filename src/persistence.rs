//! Saving peers and resolving their links after a reload.
//!
//! Restoring is two-phase: every peer is first recreated from its snapshot
//! with the persisted state force-set as the initial value, then
//! [`Simulation::resolve_restored_links`] pairs linked sources with their
//! targets once all bodies exist. Anything that cannot be paired degrades to
//! `Available` with a warning notice.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::body::{PersistentId, Pose};
use crate::connector::ConnectorState;
use crate::error::LinkError;
use crate::events::NoticeLevel;
use crate::peer::{LinkState, PeerId, PeerRole};
use crate::sim::{PeerSpec, ScheduledTask, Simulation};

/// Persisted values of one peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub link_state: LinkState,
    pub other_persistent_id: Option<PersistentId>,
    pub other_node: Option<String>,
    pub connector: Option<ConnectorSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectorSnapshot {
    pub locked: bool,
    pub state: ConnectorState,
    /// World pose, only kept while the connector is not locked.
    pub pose: Option<Pose>,
    pub cable_length: f32,
}

impl Simulation {
    pub fn save_peer(&self, id: PeerId) -> Option<PeerSnapshot> {
        let peer = self.peers.get(&id)?;
        let connector = self.winches.get(&id).map(|w| {
            let state = w.connector.state().unwrap_or(ConnectorState::Locked);
            let locked = w.connector.is_locked();
            ConnectorSnapshot {
                locked,
                state,
                pose: (!locked).then_some(w.connector.pose),
                cable_length: w.cable_length,
            }
        });
        Some(PeerSnapshot {
            link_state: peer.persisted_state,
            other_persistent_id: peer.other_persistent_id,
            other_node: peer.other_node.clone(),
            connector,
        })
    }

    /// Recreates a peer from a snapshot. Handshake states come back as
    /// `Available`; a `Linked` peer stays unpaired until
    /// [`resolve_restored_links`](Self::resolve_restored_links) runs.
    pub fn restore_peer(&mut self, spec: PeerSpec, snapshot: &PeerSnapshot) -> Result<PeerId, LinkError> {
        let initial = if snapshot.link_state.is_transient() {
            LinkState::Available
        } else {
            snapshot.link_state
        };
        let id = self.insert_peer(spec, initial)?;
        if let Some(peer) = self.peers.get_mut(&id)
            && initial == LinkState::Linked
        {
            peer.other_persistent_id = snapshot.other_persistent_id;
            peer.other_node = snapshot.other_node.clone();
        }
        if let (Some(winch), Some(saved)) = (self.winches.get_mut(&id), &snapshot.connector) {
            winch.cable_length = saved.cable_length.clamp(0.0, winch.config.max_cable_length);
            if let Some(pose) = saved.pose {
                winch.connector.pose = pose;
            }
            winch.restored = Some(saved.state);
        }
        Ok(id)
    }

    /// Pairs restored links, starts connectors and settles dependencies.
    pub fn resolve_restored_links(&mut self) {
        for source in self.unpaired(PeerRole::Source) {
            match self.find_restored_partner(source) {
                Some(target) => self.relink_restored(source, target),
                None => self.degrade_restored(source),
            }
        }
        for target in self.unpaired(PeerRole::Target) {
            self.degrade_restored(target);
        }

        let pending: Vec<PeerId> = self
            .winches
            .iter()
            .filter(|(_, w)| w.connector.state().is_none())
            .map(|(id, _)| *id)
            .collect();
        for id in pending {
            let saved = self.winches.get_mut(&id).and_then(|w| w.restored.take());
            let state = match saved {
                Some(ConnectorState::Deployed) => ConnectorState::Deployed,
                _ => ConnectorState::Locked,
            };
            if let Err(err) = self.set_connector_state(id, state) {
                warn!(peer = %id, %err, "restored connector failed to start");
            }
        }

        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in &ids {
            self.collect_dependencies(*id);
        }
        for id in ids {
            self.settle(id);
        }
    }

    /// Restored as linked but not yet paired.
    fn unpaired(&self, role: PeerRole) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|p| p.role == role && p.is_linked() && p.other.is_none())
            .map(|p| p.id)
            .collect()
    }

    fn find_restored_partner(&self, source: PeerId) -> Option<PeerId> {
        let src = self.peers.get(&source)?;
        let part = self.physics.find_by_persistent_id(src.other_persistent_id?)?;
        let src_pid = self.physics.body(src.part)?.persistent_id;
        self.peers
            .values()
            .find(|p| {
                p.part == part
                    && p.role == PeerRole::Target
                    && p.is_linked()
                    && p.other.is_none()
                    && p.link_type() == src.link_type()
                    && src.other_node.as_deref().is_none_or(|n| n == p.attach_node())
                    && p.other_persistent_id.is_none_or(|pid| pid == src_pid)
            })
            .map(|p| p.id)
    }

    fn relink_restored(&mut self, source: PeerId, target: PeerId) {
        let (Some(src), Some(tgt)) = (self.peers.get(&source), self.peers.get(&target)) else {
            return;
        };
        let (src_part, tgt_part) = (src.part, tgt.part);
        let src_pid = self.physics.body(src_part).map(|b| b.persistent_id);
        let src_node = src.config.attach_node.clone();
        let tgt_node = tgt.config.attach_node.clone();

        if let Some(tgt) = self.peers.get_mut(&target) {
            tgt.other = Some(source);
            tgt.other_persistent_id = src_pid;
            tgt.other_node = Some(src_node);
        }
        if let Some(src) = self.peers.get_mut(&source) {
            src.other = Some(target);
            src.other_node = Some(tgt_node);
        }
        let link = self.next_link_id();
        self.links.insert(source, link);

        let saved = self.winches.get_mut(&source).and_then(|w| w.restored.take());
        let length = match (self.winches.get(&source), saved) {
            (Some(_), Some(ConnectorState::Docked)) => 0.0,
            (Some(w), _) => w.cable_length,
            (None, _) => self
                .peers
                .get(&source)
                .and_then(|p| p.joint.as_ref())
                .map_or(0.0, |c| c.config().max_length),
        };
        let ends = (self.joint_end(source), self.joint_end(target));
        let created = match (ends, self.peers.get_mut(&source).and_then(|p| p.joint.as_mut())) {
            ((Some(a), Some(b)), Some(ctrl)) => ctrl
                .create_unchecked(&mut self.physics, a, b, length)
                .map_err(|e| e.to_string()),
            _ => Err("attach node is missing".to_string()),
        };
        if let Err(reason) = created {
            warn!(%source, %target, %reason, "restored joint could not be created");
            self.links.remove(&source);
            for id in [source, target] {
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.other = None;
                }
                self.degrade_restored(id);
            }
            return;
        }

        if self.winches.contains_key(&source) {
            let state = match saved {
                Some(ConnectorState::Docked)
                    if self.physics.vessel_of(src_part) == self.physics.vessel_of(tgt_part) =>
                {
                    // Docked within one vessel; there is no coupling to restore.
                    ConnectorState::Docked
                }
                Some(ConnectorState::Docked) => {
                    if let Err(err) = self.physics.couple(src_part, tgt_part) {
                        // The saved graph cannot be merged again; keep the
                        // bodies apart rather than half-coupled.
                        warn!(%source, %target, %err, "docked link cannot re-couple");
                        if let Err(err) = self.physics.separate(tgt_part) {
                            warn!(%target, %err, "separation failed");
                        }
                        self.notice(
                            NoticeLevel::Warning,
                            Some(source),
                            "docked link could not be restored, bodies separated",
                        );
                        ConnectorState::Plugged
                    } else {
                        ConnectorState::Docked
                    }
                }
                _ => {
                    if self.physics.is_coupled(src_part, tgt_part) {
                        warn!(%source, %target, "undocked link was coupled, separating");
                        self.physics.decouple(tgt_part).ok();
                    }
                    ConnectorState::Plugged
                }
            };
            if let Err(err) = self.set_connector_state(source, state) {
                warn!(peer = %source, %err, "restored connector failed to start");
            }
        } else {
            self.start_rendering(source);
        }

        if self.physics.vessel_of(src_part) != self.physics.vessel_of(tgt_part) {
            let steps = self
                .peers
                .get(&source)
                .and_then(|p| p.joint.as_ref())
                .map_or(1, |c| c.config().collision_warmup_steps);
            self.schedule(
                steps,
                link,
                ScheduledTask::IgnoreCollisions {
                    source,
                    a: src_part,
                    b: tgt_part,
                },
            );
        }
        info!(%source, %target, "link restored");
    }

    fn degrade_restored(&mut self, id: PeerId) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        let lost = peer.other_persistent_id.take();
        peer.other = None;
        peer.other_node = None;
        warn!(peer = %id, partner = ?lost, "restored link has no partner");
        if let Err(err) = self.transition(id, LinkState::Available) {
            warn!(peer = %id, %err, "could not degrade restored link");
        }
        self.notice(
            NoticeLevel::Warning,
            Some(id),
            "linked part was not found, link dropped",
        );
    }
}
