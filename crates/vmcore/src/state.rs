//! VM lifecycle state machine.
//!
//! `VmState` is the single source of truth for where a VM is in its
//! lifecycle. Every change goes through [`VmState::apply`], which encodes the
//! full transition table; anything not in the table is rejected.

use std::fmt;

use chrono::{DateTime, Local};
use serde::Serialize;

/// Lifecycle state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum VmState {
    /// Process alive, console not bound to it.
    Running,
    /// Process alive, console bound to it.
    Attached,
    /// Terminal. Process gone, resources released.
    Stopped,
}

/// Events that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The console was bound to the VM.
    Attach,
    /// The console was released from the VM.
    Detach,
    /// The operator stopped the VM.
    Stop,
    /// The runtime reported the process has exited.
    ProcessExited,
}

/// A transition that is not in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    AlreadyAttached,
    NotAttached,
    NotRunning,
}

impl VmState {
    /// Applies `event` and returns the next state.
    pub fn apply(self, event: Transition) -> Result<VmState, TransitionError> {
        use Transition::*;
        use VmState::*;

        match (self, event) {
            (Running, Attach) => Ok(Attached),
            (Attached, Attach) => Err(TransitionError::AlreadyAttached),

            (Attached, Detach) => Ok(Running),
            (Running, Detach) => Err(TransitionError::NotAttached),

            (Running | Attached, Stop | ProcessExited) => Ok(Stopped),

            (Stopped, _) => Err(TransitionError::NotRunning),
        }
    }

    /// Whether the process behind the VM is (believed to be) alive.
    pub fn is_live(self) -> bool {
        !matches!(self, VmState::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VmState::Running => "Running",
            VmState::Attached => "Attached",
            VmState::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a VM reached `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// Stopped by an explicit operator command (or tool shutdown).
    Operator,
    /// The process exited without being asked to.
    Crashed { exit_code: Option<i32> },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Operator => f.write_str("stopped by operator"),
            StopReason::Crashed {
                exit_code: Some(code),
            } => write!(f, "crashed (exit code {code})"),
            StopReason::Crashed { exit_code: None } => f.write_str("crashed"),
        }
    }
}

/// Tombstone data recorded when a VM stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopInfo {
    #[serde(flatten)]
    pub reason: StopReason,
    pub at: DateTime<Local>,
}

impl StopInfo {
    pub fn now(reason: StopReason) -> Self {
        Self {
            reason,
            at: Local::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [VmState; 3] = [VmState::Running, VmState::Attached, VmState::Stopped];
    const ALL_EVENTS: [Transition; 4] = [
        Transition::Attach,
        Transition::Detach,
        Transition::Stop,
        Transition::ProcessExited,
    ];

    #[test]
    fn test_attach_detach_cycle() {
        let attached = VmState::Running.apply(Transition::Attach).unwrap();
        assert_eq!(attached, VmState::Attached);
        let detached = attached.apply(Transition::Detach).unwrap();
        assert_eq!(detached, VmState::Running);
    }

    #[test]
    fn test_attach_twice_rejected() {
        assert_eq!(
            VmState::Attached.apply(Transition::Attach),
            Err(TransitionError::AlreadyAttached)
        );
    }

    #[test]
    fn test_detach_when_running_rejected() {
        assert_eq!(
            VmState::Running.apply(Transition::Detach),
            Err(TransitionError::NotAttached)
        );
    }

    #[test]
    fn test_stop_from_live_states() {
        for state in [VmState::Running, VmState::Attached] {
            assert_eq!(state.apply(Transition::Stop), Ok(VmState::Stopped));
            assert_eq!(state.apply(Transition::ProcessExited), Ok(VmState::Stopped));
        }
    }

    #[test]
    fn test_stopped_is_terminal() {
        for event in ALL_EVENTS {
            assert_eq!(
                VmState::Stopped.apply(event),
                Err(TransitionError::NotRunning),
                "{event:?} must not leave Stopped"
            );
        }
    }

    #[test]
    fn test_no_transition_produces_attached_except_attach() {
        for state in ALL_STATES {
            for event in ALL_EVENTS {
                if let Ok(VmState::Attached) = state.apply(event) {
                    assert_eq!(event, Transition::Attach);
                    assert_eq!(state, VmState::Running);
                }
            }
        }
    }

    #[test]
    fn test_is_live() {
        assert!(VmState::Running.is_live());
        assert!(VmState::Attached.is_live());
        assert!(!VmState::Stopped.is_live());
    }

    #[test]
    fn test_stop_reason_display() {
        assert_eq!(StopReason::Operator.to_string(), "stopped by operator");
        assert_eq!(
            StopReason::Crashed { exit_code: Some(1) }.to_string(),
            "crashed (exit code 1)"
        );
        assert_eq!(StopReason::Crashed { exit_code: None }.to_string(), "crashed");
    }
}
