//! Table-driven state machine with enter/exit and transition actions
//!
//! Transitions are looked up in a `(state, event) -> next state` table. An
//! event without a table entry is ignored. A transition to a different state
//! runs `exit(current)`, the transition action, the state update and then
//! `enter(next)`. A self-transition only runs the transition action.
//!
//! A failing exit action leaves the machine where it was. Once the exit
//! action has run the machine always lands in the next state and runs its
//! enter action, so every enter is paired with exactly one exit; an error
//! from the transition action is returned afterwards.

use crate::error::ClsResult;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// Action run against the machine's context
pub type Action<C> = Box<dyn FnMut(&mut C) -> ClsResult<()> + Send>;

struct Transition<S, C> {
    next: S,
    action: Option<Action<C>>,
}

pub struct StateMachine<S, E, C> {
    initial: S,
    current: S,
    transitions: HashMap<(S, E), Transition<S, C>>,
    enter: HashMap<S, Action<C>>,
    exit: HashMap<S, Action<C>>,
}

impl<S, E, C> StateMachine<S, E, C>
where
    S: Copy + Eq + Hash + fmt::Debug,
    E: Copy + Eq + Hash + fmt::Debug,
{
    pub fn builder(initial: S) -> StateMachineBuilder<S, E, C> {
        StateMachineBuilder::new(initial)
    }

    pub fn current(&self) -> S {
        self.current
    }

    pub fn initial(&self) -> S {
        self.initial
    }

    /// Pure lookup of the transition table
    pub fn next_state(&self, state: S, event: E) -> Option<S> {
        self.transitions.get(&(state, event)).map(|t| t.next)
    }

    /// Run the enter action of the current state
    pub fn start(&mut self, ctx: &mut C) -> ClsResult<()> {
        if let Some(enter) = self.enter.get_mut(&self.current) {
            enter(ctx)?;
        }
        Ok(())
    }

    /// Return to the initial state without running any action
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Feed one event; returns whether the table had an entry for it
    pub fn process_event(&mut self, event: E, ctx: &mut C) -> ClsResult<bool> {
        let from = self.current;
        let Some(transition) = self.transitions.get_mut(&(from, event)) else {
            tracing::trace!(state = ?from, event = ?event, "event ignored");
            return Ok(false);
        };
        let next = transition.next;

        if next == from {
            if let Some(action) = transition.action.as_mut() {
                action(ctx)?;
            }
            return Ok(true);
        }

        if let Some(exit) = self.exit.get_mut(&from) {
            exit(ctx)?;
        }
        // once `from` has been exited the transition is committed
        let action_result = match transition.action.as_mut() {
            Some(action) => action(ctx),
            None => Ok(()),
        };
        self.current = next;
        tracing::trace!(from = ?from, to = ?next, event = ?event, "state transition");
        let enter_result = match self.enter.get_mut(&next) {
            Some(enter) => enter(ctx),
            None => Ok(()),
        };
        action_result?;
        enter_result?;
        Ok(true)
    }
}

impl<S: fmt::Debug, E, C> fmt::Debug for StateMachine<S, E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("initial", &self.initial)
            .field("current", &self.current)
            .field("transitions", &self.transitions.len())
            .finish()
    }
}

/// Builder for [`StateMachine`]
pub struct StateMachineBuilder<S, E, C> {
    initial: S,
    transitions: HashMap<(S, E), Transition<S, C>>,
    enter: HashMap<S, Action<C>>,
    exit: HashMap<S, Action<C>>,
}

impl<S, E, C> StateMachineBuilder<S, E, C>
where
    S: Copy + Eq + Hash + fmt::Debug,
    E: Copy + Eq + Hash + fmt::Debug,
{
    pub fn new(initial: S) -> Self {
        Self {
            initial,
            transitions: HashMap::new(),
            enter: HashMap::new(),
            exit: HashMap::new(),
        }
    }

    pub fn transition(mut self, from: S, event: E, to: S) -> Self {
        self.transitions.insert((from, event), Transition { next: to, action: None });
        self
    }

    pub fn transition_with<F>(mut self, from: S, event: E, to: S, action: F) -> Self
    where
        F: FnMut(&mut C) -> ClsResult<()> + Send + 'static,
    {
        self.transitions.insert(
            (from, event),
            Transition { next: to, action: Some(Box::new(action)) },
        );
        self
    }

    pub fn on_enter<F>(mut self, state: S, action: F) -> Self
    where
        F: FnMut(&mut C) -> ClsResult<()> + Send + 'static,
    {
        self.enter.insert(state, Box::new(action));
        self
    }

    pub fn on_exit<F>(mut self, state: S, action: F) -> Self
    where
        F: FnMut(&mut C) -> ClsResult<()> + Send + 'static,
    {
        self.exit.insert(state, Box::new(action));
        self
    }

    pub fn build(self) -> StateMachine<S, E, C> {
        StateMachine {
            initial: self.initial,
            current: self.initial,
            transitions: self.transitions,
            enter: self.enter,
            exit: self.exit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_error;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Light {
        Off,
        On,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Input {
        Toggle,
        Refresh,
        Break,
    }

    fn machine() -> StateMachine<Light, Input, Vec<String>> {
        StateMachine::builder(Light::Off)
            .transition_with(Light::Off, Input::Toggle, Light::On, |log: &mut Vec<String>| {
                log.push("action:toggle".into());
                Ok(())
            })
            .transition(Light::On, Input::Toggle, Light::Off)
            .transition_with(Light::On, Input::Refresh, Light::On, |log: &mut Vec<String>| {
                log.push("action:refresh".into());
                Ok(())
            })
            .transition_with(Light::On, Input::Break, Light::Off, |_: &mut Vec<String>| {
                Err(config_error!("bulb broke"))
            })
            .on_enter(Light::On, |log: &mut Vec<String>| {
                log.push("enter:on".into());
                Ok(())
            })
            .on_exit(Light::On, |log: &mut Vec<String>| {
                log.push("exit:on".into());
                Ok(())
            })
            .on_enter(Light::Off, |log: &mut Vec<String>| {
                log.push("enter:off".into());
                Ok(())
            })
            .on_exit(Light::Off, |log: &mut Vec<String>| {
                log.push("exit:off".into());
                Ok(())
            })
            .build()
    }

    #[test]
    fn test_unregistered_event_is_ignored() {
        let mut sm = machine();
        let mut log = Vec::new();

        assert!(!sm.process_event(Input::Refresh, &mut log).unwrap());
        assert_eq!(sm.current(), Light::Off);
        assert!(log.is_empty());
    }

    #[test]
    fn test_transition_action_order() {
        let mut sm = machine();
        let mut log = Vec::new();

        assert!(sm.process_event(Input::Toggle, &mut log).unwrap());
        assert_eq!(sm.current(), Light::On);
        assert_eq!(log, vec!["exit:off", "action:toggle", "enter:on"]);
    }

    #[test]
    fn test_self_transition_skips_enter_exit() {
        let mut sm = machine();
        let mut log = Vec::new();
        sm.process_event(Input::Toggle, &mut log).unwrap();
        log.clear();

        sm.process_event(Input::Refresh, &mut log).unwrap();
        assert_eq!(sm.current(), Light::On);
        assert_eq!(log, vec!["action:refresh"]);
    }

    #[test]
    fn test_start_and_next_state() {
        let mut sm = machine();
        let mut log = Vec::new();
        sm.start(&mut log).unwrap();

        assert_eq!(log, vec!["enter:off"]);
        assert_eq!(sm.next_state(Light::Off, Input::Toggle), Some(Light::On));
        assert_eq!(sm.next_state(Light::Off, Input::Break), None);
    }

    #[test]
    fn test_action_error_propagates() {
        let mut sm = machine();
        let mut log = Vec::new();
        sm.process_event(Input::Toggle, &mut log).unwrap();
        log.clear();

        assert!(sm.process_event(Input::Break, &mut log).is_err());
        assert_eq!(sm.current(), Light::Off);
        assert_eq!(log, vec!["exit:on", "enter:off"]);

        sm.reset();
        assert_eq!(sm.current(), Light::Off);
    }

    #[test]
    fn test_failed_action_keeps_enter_exit_paired() {
        let mut sm: StateMachine<Light, Input, Vec<String>> = StateMachine::builder(Light::Off)
            .transition_with(Light::Off, Input::Toggle, Light::On, |_: &mut Vec<String>| {
                Err(config_error!("relay stuck"))
            })
            .transition(Light::On, Input::Toggle, Light::Off)
            .on_enter(Light::On, |log: &mut Vec<String>| {
                log.push("enter:on".into());
                Ok(())
            })
            .on_exit(Light::Off, |log: &mut Vec<String>| {
                log.push("exit:off".into());
                Ok(())
            })
            .on_exit(Light::On, |log: &mut Vec<String>| {
                log.push("exit:on".into());
                Ok(())
            })
            .build();
        let mut log = Vec::new();

        assert!(sm.process_event(Input::Toggle, &mut log).is_err());
        assert_eq!(sm.current(), Light::On);

        sm.process_event(Input::Toggle, &mut log).unwrap();
        assert_eq!(sm.current(), Light::Off);
        assert_eq!(log, vec!["exit:off", "enter:on", "exit:on"]);
    }

    #[test]
    fn test_failed_exit_stays_put() {
        let mut sm: StateMachine<Light, Input, Vec<String>> = StateMachine::builder(Light::Off)
            .transition(Light::Off, Input::Toggle, Light::On)
            .on_exit(Light::Off, |_: &mut Vec<String>| Err(config_error!("cannot leave")))
            .on_enter(Light::On, |log: &mut Vec<String>| {
                log.push("enter:on".into());
                Ok(())
            })
            .build();
        let mut log = Vec::new();

        assert!(sm.process_event(Input::Toggle, &mut log).is_err());
        assert_eq!(sm.current(), Light::Off);
        assert!(log.is_empty());
    }
}
