//! Upgrader lifecycle state machine.
//!
//! ```text
//! CheckingOwner ──→ Owner ──→ TransferringOwnership ──→ Draining
//!       │             │               │    │               │
//!       └─────────────┴───────────────┘    └── Owner       │
//!                     ↓ (every state)                      │
//!                  Stopped ←───────────────────────────────┘
//! ```
//!
//! Transitions run under one mutex; anything outside the table is refused.

use std::fmt;
use std::sync::Mutex;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    /// Connecting to the current owner, if any, to decide whether to take
    /// over. The coordination lock is held throughout.
    CheckingOwner,
    /// This process owns the shareable descriptors.
    Owner,
    /// A new process has asked for the descriptors; they are being passed
    /// or their ready signal is pending.
    TransferringOwnership,
    /// A new owner has taken over; this process serves out in-flight work.
    Draining,
    /// Terminal: stopped explicitly or finished draining.
    Stopped,
}

impl State {
    pub(crate) fn name(self) -> &'static str {
        match self {
            State::CheckingOwner => "checking-owner",
            State::Owner => "owner",
            State::TransferringOwnership => "transferring-ownership",
            State::Draining => "draining",
            State::Stopped => "stopped",
        }
    }

    fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (CheckingOwner, Owner)
                | (Owner, TransferringOwnership)
                | (TransferringOwnership, Owner)
                | (TransferringOwnership, Draining)
                | (Draining, Draining)
                | (_, Stopped)
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) struct StateMachine {
    current: Mutex<State>,
}

impl StateMachine {
    pub(crate) fn new() -> Self {
        Self {
            current: Mutex::new(State::CheckingOwner),
        }
    }

    pub(crate) fn current(&self) -> State {
        *self.current.lock().expect("state mutex poisoned")
    }

    /// Applies a transition, refusing anything outside the table.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] when the table forbids the move; the
    /// state is left unchanged.
    pub(crate) fn transition_to(&self, to: State) -> Result<(), Error> {
        let mut current = self.current.lock().expect("state mutex poisoned");
        if !current.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: current.name(),
                to: to.name(),
            });
        }
        *current = to;
        Ok(())
    }

    /// Applies a transition the caller knows to be legal from every state
    /// it can be invoked in.
    ///
    /// # Panics
    ///
    /// Panics if the table forbids the move; that is a programming error,
    /// not a runtime condition.
    pub(crate) fn must_transition_to(&self, to: State) {
        if let Err(e) = self.transition_to(to) {
            panic!("{e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_lifecycle() {
        use State::*;
        let allowed = [
            (CheckingOwner, Owner),
            (CheckingOwner, Stopped),
            (Owner, TransferringOwnership),
            (Owner, Stopped),
            (TransferringOwnership, Owner),
            (TransferringOwnership, Draining),
            (TransferringOwnership, Stopped),
            (Draining, Draining),
            (Draining, Stopped),
            (Stopped, Stopped),
        ];
        let all = [CheckingOwner, Owner, TransferringOwnership, Draining, Stopped];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn invalid_transition_is_an_error_and_leaves_state() {
        let sm = StateMachine::new();
        let err = sm.transition_to(State::Draining).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(sm.current(), State::CheckingOwner);
    }

    #[test]
    #[should_panic(expected = "invalid lifecycle transition")]
    fn must_transition_panics_on_invalid() {
        let sm = StateMachine::new();
        sm.must_transition_to(State::Draining);
    }

    #[test]
    fn stop_is_reachable_from_everywhere() {
        let sm = StateMachine::new();
        sm.must_transition_to(State::Stopped);
        sm.must_transition_to(State::Stopped);
    }
}
