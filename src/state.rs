//! Strict finite state machine with registered reactions.
//!
//! Each machine owns an allowed-successor table. The first assignment is
//! unchecked so a persisted state can be restored as the initial value; every
//! later transition must appear in the table. Reactions registered with
//! [`StateMachine::on`] are returned from [`StateMachine::set_state`] in
//! leave → enter → any order, and the owner executes them.

use std::fmt::Debug;

use tracing::error;

use crate::error::StateError;

/// When a reaction fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hook<S> {
    Enter(S),
    Leave(S),
    /// Every transition, including the initial assignment.
    Any,
}

/// The outcome of a state change.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition<S, R> {
    /// `None` on the initial assignment.
    pub from: Option<S>,
    pub to: S,
    pub reactions: Vec<R>,
}

impl<S: Copy, R> Transition<S, R> {
    fn unchanged(state: S) -> Self {
        Self {
            from: Some(state),
            to: state,
            reactions: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Phase<S> {
    NotStarted,
    Running(S),
    Stopped,
}

#[derive(Clone, Debug)]
pub struct StateMachine<S, R> {
    name: &'static str,
    phase: Phase<S>,
    successors: Vec<(S, Vec<S>)>,
    hooks: Vec<(Hook<S>, R)>,
}

impl<S, R> StateMachine<S, R>
where
    S: Copy + Eq + Debug,
    R: Clone,
{
    pub fn new(name: &'static str, table: &[(S, &[S])]) -> Self {
        Self {
            name,
            phase: Phase::NotStarted,
            successors: table.iter().map(|(s, next)| (*s, next.to_vec())).collect(),
            hooks: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn current(&self) -> Option<S> {
        match self.phase {
            Phase::Running(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self.phase, Phase::Running(_))
    }

    /// Registers a reaction.
    pub fn on(&mut self, hook: Hook<S>, reaction: R) {
        self.hooks.push((hook, reaction));
    }

    pub fn can_transition(&self, to: S) -> bool {
        match self.phase {
            Phase::NotStarted => true,
            Phase::Running(from) => from == to || self.allowed(from, to),
            Phase::Stopped => false,
        }
    }

    fn allowed(&self, from: S, to: S) -> bool {
        self.successors
            .iter()
            .find(|(s, _)| *s == from)
            .is_some_and(|(_, next)| next.contains(&to))
    }

    /// Moves to `to`. Setting the current state again is a no-op.
    pub fn set_state(&mut self, to: S) -> Result<Transition<S, R>, StateError> {
        let from = match self.phase {
            Phase::NotStarted => None,
            Phase::Running(from) if from == to => return Ok(Transition::unchanged(from)),
            Phase::Running(from) => {
                if !self.allowed(from, to) {
                    error!(machine = self.name, ?from, ?to, "illegal state transition");
                    return Err(StateError::InvalidTransition {
                        machine: self.name,
                        from: format!("{from:?}"),
                        to: format!("{to:?}"),
                    });
                }
                Some(from)
            }
            Phase::Stopped => return Err(StateError::Stopped { machine: self.name }),
        };
        self.phase = Phase::Running(to);
        Ok(Transition {
            from,
            to,
            reactions: self.collect(from, Some(to)),
        })
    }

    /// Stops the machine, returning the leave reactions of the final state.
    pub fn stop(&mut self) -> Vec<R> {
        let from = self.current();
        self.phase = Phase::Stopped;
        match from {
            Some(_) => self.collect(from, None),
            None => Vec::new(),
        }
    }

    fn collect(&self, from: Option<S>, to: Option<S>) -> Vec<R> {
        let mut fired = Vec::new();
        if let Some(from) = from {
            fired.extend(
                self.hooks
                    .iter()
                    .filter(|(h, _)| *h == Hook::Leave(from))
                    .map(|(_, r)| r.clone()),
            );
        }
        if let Some(to) = to {
            fired.extend(
                self.hooks
                    .iter()
                    .filter(|(h, _)| *h == Hook::Enter(to))
                    .map(|(_, r)| r.clone()),
            );
            fired.extend(
                self.hooks
                    .iter()
                    .filter(|(h, _)| *h == Hook::Any)
                    .map(|(_, r)| r.clone()),
            );
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Light {
        Red,
        Green,
        Amber,
    }

    const TABLE: &[(Light, &[Light])] = &[
        (Light::Red, &[Light::Green]),
        (Light::Green, &[Light::Amber]),
        (Light::Amber, &[Light::Red]),
    ];

    fn machine() -> StateMachine<Light, &'static str> {
        let mut m = StateMachine::new("light", TABLE);
        m.on(Hook::Leave(Light::Red), "leave-red");
        m.on(Hook::Enter(Light::Green), "enter-green");
        m.on(Hook::Any, "any");
        m
    }

    #[test]
    fn first_assignment_skips_table() {
        let mut m = machine();
        let t = m.set_state(Light::Amber).unwrap();
        assert_eq!(t.from, None);
        assert_eq!(m.current(), Some(Light::Amber));
        assert_eq!(t.reactions, vec!["any"]);
    }

    #[test]
    fn reactions_fire_leave_then_enter() {
        let mut m = machine();
        m.set_state(Light::Red).unwrap();
        let t = m.set_state(Light::Green).unwrap();
        assert_eq!(t.reactions, vec!["leave-red", "enter-green", "any"]);
    }

    #[test]
    fn illegal_transition_is_rejected_and_state_kept() {
        let mut m = machine();
        m.set_state(Light::Red).unwrap();
        let err = m.set_state(Light::Amber).unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
        assert_eq!(m.current(), Some(Light::Red));
    }

    #[test]
    fn same_state_is_a_noop() {
        let mut m = machine();
        m.set_state(Light::Red).unwrap();
        let t = m.set_state(Light::Red).unwrap();
        assert!(t.reactions.is_empty());
    }

    #[test]
    fn stopped_machine_rejects_everything() {
        let mut m = machine();
        m.set_state(Light::Red).unwrap();
        assert_eq!(m.stop(), vec!["leave-red"]);
        assert!(m.current().is_none());
        assert!(matches!(
            m.set_state(Light::Green),
            Err(StateError::Stopped { .. })
        ));
    }

    fn light() -> impl Strategy<Value = Light> {
        prop_oneof![Just(Light::Red), Just(Light::Green), Just(Light::Amber)]
    }

    proptest! {
        /// Whatever is requested, the machine only ever walks table edges.
        #[test]
        fn only_table_edges_are_walked(start in light(), steps in prop::collection::vec(light(), 0..32)) {
            let mut m = machine();
            m.set_state(start).unwrap();
            for to in steps {
                let before = m.current().unwrap();
                let legal = before == to || m.allowed(before, to);
                let result = m.set_state(to);
                prop_assert_eq!(result.is_ok(), legal);
                let after = m.current().unwrap();
                prop_assert!(after == before || m.allowed(before, after));
            }
        }
    }
}
