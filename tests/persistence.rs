// tests/persistence.rs
mod common;

use common::*;
use glam::Vec3;
use tether_link::{
    ConnectorState, LinkActor, LinkState, NoticeLevel, PeerSnapshot, PeerSpec, Pose, RigidBody,
    ShapePrimitive, Simulation,
};

/// Saves both peers of a docked link, passing the snapshots through JSON.
fn docked_snapshots() -> (PeerSnapshot, PeerSnapshot) {
    let (mut sim, a, b) = two_parts(0.0);
    let src = sim
        .add_peer(PeerSpec::source(a, cable()).with_winch(fast_winch()))
        .unwrap();
    let tgt = sim.add_peer(PeerSpec::target(b, facing_cable())).unwrap();
    link(&mut sim, src, tgt);
    assert_eq!(sim.connector_state(src), Some(ConnectorState::Docked));

    let through_json = |snap: PeerSnapshot| -> PeerSnapshot {
        let text = serde_json::to_string(&snap).unwrap();
        serde_json::from_str(&text).unwrap()
    };
    (
        through_json(sim.save_peer(src).unwrap()),
        through_json(sim.save_peer(tgt).unwrap()),
    )
}

#[test]
fn test_docked_snapshot_values() {
    let (src, tgt) = docked_snapshots();
    assert_eq!(src.link_state, LinkState::Linked);
    assert_eq!(src.other_persistent_id, Some(ANCHOR_PID));
    assert_eq!(src.other_node.as_deref(), Some("tether"));
    let connector = src.connector.unwrap();
    assert!(connector.locked);
    assert_eq!(connector.state, ConnectorState::Docked);
    assert_eq!(connector.pose, None, "locked connectors store no pose");

    assert_eq!(tgt.other_persistent_id, Some(WINCH_PID));
    assert!(tgt.connector.is_none());
}

#[test]
fn test_docked_link_survives_reload() {
    let (src_snap, tgt_snap) = docked_snapshots();

    let mut sim = Simulation::default();
    let (a, b) = add_parts(&mut sim, 0.0);
    let src = sim
        .restore_peer(PeerSpec::source(a, cable()).with_winch(fast_winch()), &src_snap)
        .unwrap();
    let tgt = sim
        .restore_peer(PeerSpec::target(b, facing_cable()), &tgt_snap)
        .unwrap();
    sim.resolve_restored_links();

    assert_eq!(sim.link_state(src), Some(LinkState::Linked));
    assert_eq!(sim.link_state(tgt), Some(LinkState::Linked));
    assert_eq!(sim.peer(src).unwrap().other_peer(), Some(tgt));
    assert_eq!(sim.peer(tgt).unwrap().other_peer(), Some(src));
    assert_eq!(sim.connector_state(src), Some(ConnectorState::Docked));
    assert!(sim.physics().is_coupled(a, b));
    assert_eq!(sim.physics().joint_count(), 1);
    assert!(notices(&sim, NoticeLevel::Warning).is_empty());

    // The restored link behaves like a live one.
    sim.break_current_link(src, LinkActor::Player).unwrap();
    assert_eq!(sim.connector_state(src), Some(ConnectorState::Locked));
    assert!(!sim.physics().is_coupled(a, b));
}

#[test]
fn test_missing_partner_degrades_with_warning() {
    let (src_snap, _) = docked_snapshots();

    let mut sim = Simulation::default();
    let a = sim.physics_mut().add_part(
        RigidBody::part("winch", ShapePrimitive::Sphere(0.5), 100.0).with_persistent_id(WINCH_PID),
    );
    let src = sim
        .restore_peer(PeerSpec::source(a, cable()).with_winch(fast_winch()), &src_snap)
        .unwrap();
    sim.resolve_restored_links();

    assert_eq!(sim.link_state(src), Some(LinkState::Available));
    assert_eq!(sim.connector_state(src), Some(ConnectorState::Locked));
    assert_eq!(sim.peer(src).unwrap().other_persistent_id(), None);
    assert_eq!(sim.physics().joint_count(), 0);
    assert_eq!(notices(&sim, NoticeLevel::Warning).len(), 1);
    assert!(sim.physics().has_node(a, "tether"));
}

#[test]
fn test_docked_link_within_one_vessel_survives_reload() {
    let (src_snap, tgt_snap) = docked_snapshots();

    let mut sim = Simulation::default();
    let vessel = sim.physics_mut().new_vessel();
    let a = sim.physics_mut().add_part(
        RigidBody::part("winch", ShapePrimitive::Sphere(0.5), 100.0)
            .with_persistent_id(WINCH_PID)
            .in_vessel(vessel),
    );
    let b = sim.physics_mut().add_part(
        RigidBody::part("anchor", ShapePrimitive::Sphere(0.5), 100.0)
            .with_persistent_id(ANCHOR_PID)
            .in_vessel(vessel),
    );
    let src = sim
        .restore_peer(PeerSpec::source(a, cable()).with_winch(fast_winch()), &src_snap)
        .unwrap();
    sim.restore_peer(PeerSpec::target(b, facing_cable()), &tgt_snap)
        .unwrap();
    sim.resolve_restored_links();

    assert_eq!(sim.link_state(src), Some(LinkState::Linked));
    assert_eq!(sim.connector_state(src), Some(ConnectorState::Docked));
    assert_eq!(sim.physics().vessel_of(a), Some(vessel));
    assert_eq!(sim.physics().vessel_of(b), Some(vessel));
    assert!(!sim.physics().is_coupled(a, b));
    assert!(notices(&sim, NoticeLevel::Warning).is_empty());

    // Undocking leaves the shared vessel alone.
    sim.break_current_link(src, LinkActor::Player).unwrap();
    assert_eq!(sim.connector_state(src), Some(ConnectorState::Locked));
    assert_eq!(sim.physics().vessel_of(b), Some(vessel));
}

#[test]
fn test_docked_link_that_cannot_recouple_is_separated() {
    let (src_snap, tgt_snap) = docked_snapshots();

    let mut sim = Simulation::default();
    let (a, b) = add_parts(&mut sim, 0.0);
    // The anchor came back already hanging off another part.
    let base = sim.physics_mut().add_part(
        RigidBody::part("base", ShapePrimitive::Sphere(0.5), 100.0)
            .with_pose(Pose::from_position(Vec3::new(0.0, 5.0, 0.0))),
    );
    sim.physics_mut().couple(base, b).unwrap();

    let src = sim
        .restore_peer(PeerSpec::source(a, cable()).with_winch(fast_winch()), &src_snap)
        .unwrap();
    sim.restore_peer(PeerSpec::target(b, facing_cable()), &tgt_snap)
        .unwrap();
    sim.resolve_restored_links();

    assert_eq!(sim.link_state(src), Some(LinkState::Linked));
    assert_eq!(sim.connector_state(src), Some(ConnectorState::Plugged));
    assert!(!sim.physics().is_coupled(a, b));
    assert!(!sim.physics().is_coupled(base, b));
    assert_ne!(sim.physics().vessel_of(b), sim.physics().vessel_of(a));
    assert_ne!(sim.physics().vessel_of(b), sim.physics().vessel_of(base));
    assert_eq!(notices(&sim, NoticeLevel::Warning).len(), 1);
}

#[test]
fn test_handshake_states_reload_as_available() {
    let mut sim = Simulation::default();
    let (a, _) = add_parts(&mut sim, 5.0);
    let snap = PeerSnapshot {
        link_state: LinkState::Linking,
        other_persistent_id: None,
        other_node: None,
        connector: None,
    };
    let src = sim.restore_peer(PeerSpec::source(a, cable()), &snap).unwrap();
    sim.resolve_restored_links();
    assert_eq!(sim.link_state(src), Some(LinkState::Available));
}

#[test]
fn test_plain_link_reload_pairs_by_persistent_id() {
    let (mut sim, a, b) = two_parts(4.0);
    let (src, tgt) = plain_pair(&mut sim, a, b);
    link(&mut sim, src, tgt);
    let (src_snap, tgt_snap) = (sim.save_peer(src).unwrap(), sim.save_peer(tgt).unwrap());

    // Restore in the opposite order, with an unrelated target in between.
    let mut sim = Simulation::default();
    let (a, b) = add_parts(&mut sim, 4.0);
    let tgt = sim
        .restore_peer(PeerSpec::target(b, cable()), &tgt_snap)
        .unwrap();
    let spare = sim
        .add_peer(PeerSpec::target(b, tether_link::LinkConfig::new("cable", "spare")))
        .unwrap();
    let src = sim
        .restore_peer(PeerSpec::source(a, cable()), &src_snap)
        .unwrap();
    sim.resolve_restored_links();

    assert_eq!(sim.peer(src).unwrap().other_peer(), Some(tgt));
    assert_eq!(sim.link_state(spare), Some(LinkState::Available));
    assert_eq!(sim.physics().joint_count(), 1);
    assert!(!sim.physics().has_node(a, "tether"));
}
