//! Winch motor: cable length, speed ramping and connector locking.

use tracing::{debug, info, trace, warn};

use crate::body::{BodyId, Pose};
use crate::config::WinchConfig;
use crate::connector::{Connector, ConnectorState};
use crate::error::MotorError;
use crate::events::NoticeLevel;
use crate::peer::{Peer, PeerId};
use crate::sim::Simulation;

/// Cable lengths below this count as fully retracted.
const RETRACTED_EPSILON: f32 = 1e-3;

/// A motorized cable reel with its connector head. Owned by a link source.
#[derive(Clone, Debug)]
pub struct Winch {
    pub(crate) config: WinchConfig,
    pub(crate) connector: Connector,
    pub(crate) cable_length: f32,
    pub(crate) target_speed: f32,
    pub(crate) current_speed: f32,
    /// A lock attempt already failed during this retraction.
    pub(crate) lock_reported: bool,
    /// Target part coupled while docked.
    pub(crate) coupled_child: Option<BodyId>,
    /// Saved connector state waiting for the restored link to resolve.
    pub(crate) restored: Option<ConnectorState>,
}

impl Winch {
    pub(crate) fn new(config: WinchConfig, owner: PeerId) -> Self {
        let connector = Connector::new(owner, config.connector_shape, config.connector_density);
        Self {
            config,
            connector,
            cable_length: 0.0,
            target_speed: 0.0,
            current_speed: 0.0,
            lock_reported: false,
            coupled_child: None,
            restored: None,
        }
    }

    pub fn config(&self) -> &WinchConfig {
        &self.config
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn cable_length(&self) -> f32 {
        self.cable_length
    }

    pub fn target_speed(&self) -> f32 {
        self.target_speed
    }

    pub fn current_speed(&self) -> f32 {
        self.current_speed
    }

    pub fn is_running(&self) -> bool {
        self.target_speed != 0.0 || self.current_speed != 0.0
    }

    pub(crate) fn kill_motor(&mut self) {
        self.target_speed = 0.0;
        self.current_speed = 0.0;
    }

    /// One acceleration-limited step of the current speed toward the target.
    fn ramp(&mut self, dt: f32) {
        let step = self.config.motor_acceleration * dt;
        self.current_speed = if self.current_speed < self.target_speed {
            (self.current_speed + step).min(self.target_speed)
        } else {
            (self.current_speed - step).max(self.target_speed)
        };
    }
}

impl Simulation {
    pub fn winch(&self, id: PeerId) -> Option<&Winch> {
        self.winches.get(&id)
    }

    pub fn cable_length(&self, id: PeerId) -> Option<f32> {
        self.winches.get(&id).map(|w| w.cable_length)
    }

    /// Sets the cable length directly, clamped to the winch range, and
    /// updates the joint to match.
    pub fn set_cable_length(&mut self, id: PeerId, length: f32) -> Result<(), MotorError> {
        let winch = self.winches.get_mut(&id).ok_or(MotorError::NoWinch(id))?;
        let length = if length.is_nan() { 0.0 } else { length };
        winch.cable_length = length.clamp(0.0, winch.config.max_cable_length);
        let length = winch.cable_length;
        self.apply_cable_length(id, length);
        Ok(())
    }

    fn apply_cable_length(&mut self, id: PeerId, length: f32) {
        if let Some(ctrl) = self.peers.get(&id).and_then(|p| p.joint.as_ref()) {
            ctrl.set_max_length(&mut self.physics, length);
        }
    }

    /// Sets the motor's target speed in m/s: positive extends, negative
    /// retracts, zero stops. Extending a locked connector deploys it (or
    /// plugs it when docked).
    pub fn set_motor(&mut self, id: PeerId, target_speed: f32) -> Result<(), MotorError> {
        let winch = self.winches.get(&id).ok_or(MotorError::NoWinch(id))?;
        let max = winch.config.motor_max_speed;
        let speed = if target_speed.is_nan() {
            0.0
        } else {
            target_speed.clamp(-max, max)
        };
        let state = winch.connector.state();
        let at_max = winch.cable_length >= winch.config.max_cable_length - RETRACTED_EPSILON;

        let charge = self
            .peers
            .get(&id)
            .and_then(|p| self.physics.vessel_of(p.part))
            .map_or(0.0, |v| self.physics.vessel_charge(v));
        if speed != 0.0 && charge <= 0.0 {
            self.notice(NoticeLevel::Warning, Some(id), "winch motor has no energy");
            return Err(MotorError::NoEnergy);
        }

        if speed > 0.0 {
            if at_max {
                self.notice(NoticeLevel::Info, Some(id), "cable is at maximum length");
                return Err(MotorError::AtMaxLength);
            }
            let linked = self.peers.get(&id).is_some_and(Peer::is_linked);
            match state {
                Some(ConnectorState::Locked) if !linked => {
                    self.set_connector_state(id, ConnectorState::Deployed)?
                }
                Some(ConnectorState::Docked) => self.set_connector_state(id, ConnectorState::Plugged)?,
                _ => {}
            }
        } else if speed < 0.0 && matches!(state, Some(ConnectorState::Locked | ConnectorState::Docked)) {
            self.notice(NoticeLevel::Info, Some(id), "connector is already locked");
            return Err(MotorError::AlreadyLocked);
        }

        let winch = self.winches.get_mut(&id).ok_or(MotorError::NoWinch(id))?;
        if speed != 0.0 && winch.current_speed != 0.0 && speed.signum() != winch.current_speed.signum() {
            winch.current_speed = 0.0;
        }
        winch.target_speed = speed;
        winch.lock_reported = false;
        debug!(peer = %id, speed, "motor target set");
        Ok(())
    }

    /// Advances one running motor by `dt` seconds.
    pub(crate) fn update_motor(&mut self, id: PeerId, dt: f32) {
        let Some(winch) = self.winches.get_mut(&id) else {
            return;
        };
        if !winch.is_running() {
            return;
        }
        winch.ramp(dt);
        let speed = winch.current_speed;
        if speed == 0.0 {
            return;
        }

        let demand = speed.abs() * dt * winch.config.power_per_meter;
        let powered = self
            .peers
            .get(&id)
            .and_then(|p| self.physics.vessel_of(p.part))
            .is_some_and(|v| self.physics.drain_charge(v, demand));
        if !powered {
            if let Some(winch) = self.winches.get_mut(&id) {
                winch.kill_motor();
            }
            self.notice(NoticeLevel::Warning, Some(id), "winch motor has no energy");
            return;
        }

        let Some(winch) = self.winches.get_mut(&id) else {
            return;
        };
        let max = winch.config.max_cable_length;
        let length = winch.cable_length + speed * dt;
        if length >= max {
            winch.cable_length = max;
            winch.kill_motor();
            self.apply_cable_length(id, max);
            self.notice(NoticeLevel::Info, Some(id), "cable reached maximum length");
        } else if length <= 0.0 && speed < 0.0 {
            winch.cable_length = 0.0;
            let report = !winch.lock_reported;
            winch.lock_reported = true;
            self.apply_cable_length(id, 0.0);
            // Keeps pulling until the connector seats.
            if let Err(err) = self.try_locking_connector(id, report) {
                trace!(peer = %id, %err, "connector not seated yet");
            }
        } else {
            winch.cable_length = length.max(0.0);
            self.apply_cable_length(id, length.max(0.0));
        }
    }

    /// Locks the connector at the winch if the cable is retracted and the
    /// connector sits on the winch node: `Docked` when linked, otherwise
    /// `Locked`. Linked connectors must also be aligned with the node.
    pub fn try_locking_connector(&mut self, id: PeerId, report_failure: bool) -> Result<ConnectorState, MotorError> {
        self.sync_connectors();
        let winch = self.winches.get(&id).ok_or(MotorError::NoWinch(id))?;
        let state = winch.connector.state();
        if let Some(s @ (ConnectorState::Locked | ConnectorState::Docked)) = state {
            return Ok(s);
        }
        let linked = self.peers.get(&id).is_some_and(Peer::is_linked);

        let blocker = self.lock_blocker(id, winch, linked);
        if let Some(reason) = blocker {
            debug!(peer = %id, %reason, "connector cannot lock");
            if report_failure {
                self.notice(NoticeLevel::Info, Some(id), format!("connector cannot lock: {reason}"));
            }
            return Err(MotorError::Misaligned(reason));
        }

        let to = if linked {
            ConnectorState::Docked
        } else {
            ConnectorState::Locked
        };
        if let Err(err) = self.set_connector_state(id, to) {
            warn!(peer = %id, %err, "connector lock failed");
            return Err(err.into());
        }
        if let Some(winch) = self.winches.get_mut(&id) {
            winch.kill_motor();
        }
        info!(peer = %id, state = %to, "connector seated");
        Ok(to)
    }

    fn lock_blocker(&self, id: PeerId, winch: &Winch, linked: bool) -> Option<String> {
        if winch.cable_length > RETRACTED_EPSILON {
            return Some(format!("cable still out ({:.2} m)", winch.cable_length));
        }
        self.seat_blocker(id, winch, winch.connector.pose, linked)
    }

    /// Why a connector at `connector` cannot seat on the winch node. Alignment
    /// only matters when `aligned` is set.
    pub(crate) fn seat_blocker(&self, id: PeerId, winch: &Winch, connector: Pose, aligned: bool) -> Option<String> {
        let Some(node) = self.node_world(id) else {
            return Some("winch node is missing".to_string());
        };
        let distance = node.position.distance(connector.position);
        if distance > winch.config.lock_distance_tolerance {
            return Some(format!("connector is {distance:.2} m from the winch"));
        }
        if aligned {
            let angle = node.forward().angle_between(connector.forward()).to_degrees();
            if angle > winch.config.lock_angle_tolerance {
                return Some(format!("connector is misaligned by {angle:.1} degrees"));
            }
        }
        None
    }
}
