// tests/common/mod.rs
#![allow(dead_code)]

use glam::Vec3;
use std::cell::RefCell;
use std::rc::Rc;
use tether_link::{
    BodyId, LinkActor, LinkConfig, LinkEvent, LinkRenderer, NoticeLevel, PeerId, PeerSpec, Pose,
    RigidBody, ShapePrimitive, Simulation, WinchConfig,
};

pub const WINCH_PID: u32 = 101;
pub const ANCHOR_PID: u32 = 202;

/// A winch part at the origin and an anchor part `gap` meters along +X, each
/// in its own vessel.
pub fn two_parts(gap: f32) -> (Simulation, BodyId, BodyId) {
    let mut sim = Simulation::default();
    let (a, b) = add_parts(&mut sim, gap);
    (sim, a, b)
}

pub fn add_parts(sim: &mut Simulation, gap: f32) -> (BodyId, BodyId) {
    let world = sim.physics_mut();
    let a = world.add_part(
        RigidBody::part("winch", ShapePrimitive::Sphere(0.5), 100.0)
            .with_charge(1000.0)
            .with_persistent_id(WINCH_PID),
    );
    let b = world.add_part(
        RigidBody::part("anchor", ShapePrimitive::Sphere(0.5), 100.0)
            .with_pose(Pose::from_position(Vec3::new(gap, 0.0, 0.0)))
            .with_persistent_id(ANCHOR_PID),
    );
    (a, b)
}

pub fn cable() -> LinkConfig {
    LinkConfig::new("cable", "tether")
}

/// Target node facing back toward a source node at the same spot.
pub fn facing_cable() -> LinkConfig {
    cable().with_node_def("0,0,0,0,0,-1")
}

pub fn fast_winch() -> WinchConfig {
    WinchConfig {
        max_cable_length: 10.0,
        motor_acceleration: f32::INFINITY,
        ..WinchConfig::default()
    }
}

/// Source on `a`, target on `b`, both plain cable peers.
pub fn plain_pair(sim: &mut Simulation, a: BodyId, b: BodyId) -> (PeerId, PeerId) {
    let src = sim.add_peer(PeerSpec::source(a, cable())).unwrap();
    let tgt = sim.add_peer(PeerSpec::target(b, cable())).unwrap();
    (src, tgt)
}

pub fn link(sim: &mut Simulation, src: PeerId, tgt: PeerId) {
    sim.start_linking(src, LinkActor::Player).unwrap();
    sim.link_to_target(src, tgt, LinkActor::Player).unwrap();
}

pub fn notices(sim: &Simulation, level: NoticeLevel) -> Vec<String> {
    sim.events()
        .iter()
        .filter_map(LinkEvent::as_notice)
        .filter(|n| n.level == level)
        .map(|n| n.message.clone())
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderCall {
    Start,
    Update(Vec3, Vec3),
    Stop,
}

/// Records renderer calls for later inspection.
#[derive(Clone, Default)]
pub struct RecordingRenderer {
    pub calls: Rc<RefCell<Vec<RenderCall>>>,
}

impl LinkRenderer for RecordingRenderer {
    fn start_render(&mut self, _from: Pose, _to: Pose) {
        self.calls.borrow_mut().push(RenderCall::Start);
    }

    fn stop_render(&mut self) {
        self.calls.borrow_mut().push(RenderCall::Stop);
    }

    fn update_render(&mut self, from: Pose, to: Pose) {
        self.calls
            .borrow_mut()
            .push(RenderCall::Update(from.position, to.position));
    }
}
