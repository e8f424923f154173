//! Controller state machine.
//!
//! The remote DAQ controller moves through five states. Six named transitions
//! drive it; each transition partitions the states into three sets:
//!
//! - `ignore`: the transition is a harmless no-op
//! - `from`: the transition is legal and lands on its fixed `end` state
//! - everything else: the transition is refused
//!
//! # State Machine
//!
//! ```text
//!                connect                configure
//! ┌──────────────┐───▶┌───────────┐─────────▶┌────────────┐
//! │ Disconnected │    │ Connected │          │ Configured │◀─┐ configure
//! └──────────────┘◀───└───────────┘          └────────────┘──┘
//!        ▲   disconnect                         │     ▲
//!        └──────────────────────────────────────┘     │ endrun
//!                                       begin │        │
//!                                             ▼        │
//!                               ┌─────────┐  stop  ┌──────┐
//!                               │ Running │───────▶│ Open │
//!                               └─────────┘◀───────└──────┘
//!                                           begin
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DaqError, DaqResult};
use ControllerState::{Configured, Connected, Disconnected, Open, Running};

/// Lifecycle state of the remote DAQ controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerState {
    /// No control session
    Disconnected,
    /// Session open, no run parameters yet
    Connected,
    /// Run parameters applied, no run open
    Configured,
    /// Run open, not acquiring
    Open,
    /// Run open and acquiring
    Running,
}

impl ControllerState {
    /// Every state, in index order.
    pub const ALL: [ControllerState; 5] = [
        ControllerState::Disconnected,
        ControllerState::Connected,
        ControllerState::Configured,
        ControllerState::Open,
        ControllerState::Running,
    ];

    /// Index used by the remote `state()` call.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Inverse of [`ControllerState::index`].
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Short state name, as reported by the controller.
    pub fn as_str(self) -> &'static str {
        match self {
            ControllerState::Disconnected => "Disconnected",
            ControllerState::Connected => "Connected",
            ControllerState::Configured => "Configured",
            ControllerState::Open => "Open",
            ControllerState::Running => "Running",
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControllerState {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DaqError::Validation(format!("unknown controller state '{}'", s)))
    }
}

/// Named transitions understood by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// Open a control session
    Connect,
    /// Close the control session
    Disconnect,
    /// Apply run parameters
    Configure,
    /// Start acquiring (opening a run if needed)
    Begin,
    /// Stop acquiring, keep the run open
    Stop,
    /// Close the open run
    EndRun,
}

/// State partition for one transition.
#[derive(Debug, Clone, Copy)]
pub struct TransitionRule {
    /// States where the transition is a no-op
    pub ignore: &'static [ControllerState],
    /// States where the transition is legal
    pub from: &'static [ControllerState],
    /// State reached after a legal transition
    pub end: ControllerState,
}

impl Transition {
    /// Every transition.
    pub const ALL: [Transition; 6] = [
        Transition::Connect,
        Transition::Disconnect,
        Transition::Configure,
        Transition::Begin,
        Transition::Stop,
        Transition::EndRun,
    ];

    /// Name used in error messages and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Transition::Connect => "connect",
            Transition::Disconnect => "disconnect",
            Transition::Configure => "configure",
            Transition::Begin => "begin",
            Transition::Stop => "stop",
            Transition::EndRun => "endrun",
        }
    }

    /// The authoritative transition table.
    pub fn rule(self) -> TransitionRule {
        match self {
            Transition::Connect => TransitionRule {
                ignore: &[Connected, Configured, Open, Running],
                from: &[Disconnected],
                end: Connected,
            },
            Transition::Disconnect => TransitionRule {
                ignore: &[],
                from: &[Disconnected, Connected, Configured],
                end: Disconnected,
            },
            Transition::Configure => TransitionRule {
                ignore: &[],
                from: &[Connected, Configured],
                end: Configured,
            },
            Transition::Begin => TransitionRule {
                ignore: &[],
                from: &[Configured, Open],
                end: Running,
            },
            Transition::Stop => TransitionRule {
                ignore: &[Disconnected, Connected, Configured, Open],
                from: &[Running],
                end: Open,
            },
            Transition::EndRun => TransitionRule {
                ignore: &[Disconnected, Connected, Configured],
                from: &[Open, Running],
                end: Configured,
            },
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a transition that was not refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// State changed to the transition's end state
    Applied,
    /// Transition was a no-op in the current state
    Ignored,
}

impl TransitionOutcome {
    /// True when the transition changed state.
    pub fn applied(self) -> bool {
        self == TransitionOutcome::Applied
    }
}

/// Current state plus the transition table.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: ControllerState,
}

impl StateMachine {
    /// New machine in `Disconnected`.
    pub fn new() -> Self {
        Self {
            state: ControllerState::Disconnected,
        }
    }

    /// Current state.
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Apply `transition` against the current state.
    pub fn apply(&mut self, transition: Transition) -> DaqResult<TransitionOutcome> {
        let rule = transition.rule();
        let outcome = if rule.ignore.contains(&self.state) {
            TransitionOutcome::Ignored
        } else if rule.from.contains(&self.state) {
            self.state = rule.end;
            TransitionOutcome::Applied
        } else {
            return Err(DaqError::InvalidTransition {
                transition,
                state: self.state,
            });
        };
        debug!(%transition, state = %self.state, ?outcome, "Controller transition");
        Ok(outcome)
    }

    /// Overwrite the state without consulting the table.
    ///
    /// Only simulators use this, to model a controller that changed state on
    /// its own (crash, operator action at the DAQ console).
    pub fn force(&mut self, state: ControllerState) {
        self.state = state;
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partitions_are_disjoint_and_cover_end() {
        for transition in Transition::ALL {
            let rule = transition.rule();
            for state in rule.ignore {
                assert!(
                    !rule.from.contains(state),
                    "{} lists {} as both ignored and legal",
                    transition,
                    state
                );
            }
        }
    }

    #[test]
    fn test_index_round_trip() {
        for state in ControllerState::ALL {
            assert_eq!(ControllerState::from_index(state.index()), Some(state));
        }
        assert_eq!(ControllerState::from_index(5), None);
        assert_eq!(ControllerState::Running.index(), 4);
    }

    #[test]
    fn test_parse_state_name() {
        assert_eq!("open".parse::<ControllerState>().ok(), Some(Open));
        assert!("Paused".parse::<ControllerState>().is_err());
    }

    #[test]
    fn test_ignore_does_not_change_state() {
        let mut machine = StateMachine::new();
        assert_eq!(
            machine.apply(Transition::Stop).ok(),
            Some(TransitionOutcome::Ignored)
        );
        assert_eq!(machine.state(), Disconnected);
    }

    #[test]
    fn test_refusal_keeps_state() {
        let mut machine = StateMachine::new();
        let err = machine.apply(Transition::Begin).unwrap_err();
        assert!(matches!(
            err,
            DaqError::InvalidTransition {
                transition: Transition::Begin,
                state: Disconnected
            }
        ));
        assert_eq!(machine.state(), Disconnected);
    }
}
