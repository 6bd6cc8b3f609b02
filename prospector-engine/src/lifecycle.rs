//! Campaign phase/status state machine
//!
//! All lifecycle mutations funnel through [`transition`], which is the single
//! authority on which `(phase, status)` moves are legal. A command that would
//! land in the state the campaign is already in succeeds as a no-op; the
//! caller detects this by comparing the returned pair against the current one
//! and skipping the write.

use crate::error::{Error, Result};
use crate::model::{Phase, PhaseStatus};

/// Lifecycle command applied to a campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Store phase configuration; advances `(prev, completed)` into the next phase
    Configure(Phase),
    /// Begin dispatching work for the phase
    Start(Phase),
    Pause,
    Resume,
    Cancel,
    /// Move a failed phase back to `configured`, preserving written results
    Retry,
    /// Worker-driven: final batch committed
    Complete,
    /// Worker-driven: fatal error during execution
    Fail,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configure(p) => write!(f, "configure({p})"),
            Self::Start(p) => write!(f, "start({p})"),
            Self::Pause => f.write_str("pause"),
            Self::Resume => f.write_str("resume"),
            Self::Cancel => f.write_str("cancel"),
            Self::Retry => f.write_str("retry"),
            Self::Complete => f.write_str("complete"),
            Self::Fail => f.write_str("fail"),
        }
    }
}

fn rejected(command: Command, phase: Phase, status: PhaseStatus) -> Error {
    Error::invalid_state(command, format_args!("({phase}, {status})"))
}

/// Compute the state a command moves the campaign into
///
/// Returns the destination pair, which may equal the input pair for no-op
/// commands, or `InvalidState` when the move is not in the legal set.
pub fn transition(phase: Phase, status: PhaseStatus, command: Command) -> Result<(Phase, PhaseStatus)> {
    use PhaseStatus::*;

    match command {
        Command::Configure(target) => {
            if target == phase && matches!(status, NotStarted | Ready | Configured) {
                Ok((target, Configured))
            } else if status == Completed && phase.next() == Some(target) {
                // Auto-advance: completing a phase leaves the next one ready;
                // configuring it lands directly in (next, configured).
                Ok((target, Configured))
            } else {
                Err(rejected(command, phase, status))
            }
        }
        Command::Start(target) => {
            if target != phase {
                return Err(rejected(command, phase, status));
            }
            match status {
                Configured => Ok((phase, InProgress)),
                InProgress => Ok((phase, InProgress)),
                _ => Err(rejected(command, phase, status)),
            }
        }
        Command::Pause => match status {
            InProgress => Ok((phase, Paused)),
            Paused => Ok((phase, Paused)),
            _ => Err(rejected(command, phase, status)),
        },
        Command::Resume => match status {
            Paused => Ok((phase, InProgress)),
            InProgress => Ok((phase, InProgress)),
            _ => Err(rejected(command, phase, status)),
        },
        Command::Cancel => match status {
            Configured | InProgress | Paused => Ok((phase, Cancelled)),
            // Terminal pairs observe their state; re-cancel is a no-op.
            Completed | Cancelled | Failed => Ok((phase, status)),
            NotStarted | Ready => Err(rejected(command, phase, status)),
        },
        Command::Retry => match status {
            Failed => Ok((phase, Configured)),
            _ => Err(rejected(command, phase, status)),
        },
        Command::Complete => match status {
            InProgress => Ok((phase, Completed)),
            Completed => Ok((phase, Completed)),
            _ => Err(rejected(command, phase, status)),
        },
        Command::Fail => match status {
            InProgress => Ok((phase, Failed)),
            Failed => Ok((phase, Failed)),
            _ => Err(rejected(command, phase, status)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Phase::*;
    use PhaseStatus::*;

    fn ok(phase: Phase, status: PhaseStatus, cmd: Command) -> (Phase, PhaseStatus) {
        transition(phase, status, cmd).expect("transition should be legal")
    }

    fn denied(phase: Phase, status: PhaseStatus, cmd: Command) {
        assert!(
            matches!(transition(phase, status, cmd), Err(Error::InvalidState(_))),
            "expected InvalidState for {cmd} in ({phase}, {status})"
        );
    }

    #[test]
    fn test_generation_happy_path() {
        assert_eq!(
            ok(Generation, NotStarted, Command::Configure(Generation)),
            (Generation, Configured)
        );
        assert_eq!(
            ok(Generation, Configured, Command::Start(Generation)),
            (Generation, InProgress)
        );
        assert_eq!(ok(Generation, InProgress, Command::Complete), (Generation, Completed));
    }

    #[test]
    fn test_auto_advance_on_configure_next_phase() {
        assert_eq!(
            ok(Generation, Completed, Command::Configure(DnsValidation)),
            (DnsValidation, Configured)
        );
        assert_eq!(
            ok(DnsValidation, Completed, Command::Configure(HttpKeywordValidation)),
            (HttpKeywordValidation, Configured)
        );
        assert_eq!(
            ok(HttpKeywordValidation, Completed, Command::Configure(Analysis)),
            (Analysis, Configured)
        );
    }

    #[test]
    fn test_cannot_skip_phases() {
        denied(Generation, Completed, Command::Configure(HttpKeywordValidation));
        denied(Generation, Completed, Command::Configure(Analysis));
        denied(Generation, InProgress, Command::Configure(DnsValidation));
        denied(Analysis, Completed, Command::Configure(Analysis));
    }

    #[test]
    fn test_pause_resume() {
        assert_eq!(ok(DnsValidation, InProgress, Command::Pause), (DnsValidation, Paused));
        assert_eq!(ok(DnsValidation, Paused, Command::Resume), (DnsValidation, InProgress));
        denied(DnsValidation, Configured, Command::Pause);
        denied(DnsValidation, Completed, Command::Resume);
    }

    #[test]
    fn test_cancel_from_active_states() {
        for status in [Configured, InProgress, Paused] {
            assert_eq!(
                ok(HttpKeywordValidation, status, Command::Cancel),
                (HttpKeywordValidation, Cancelled)
            );
        }
    }

    #[test]
    fn test_cancel_rejected_before_configuration() {
        denied(Generation, NotStarted, Command::Cancel);
        denied(DnsValidation, Ready, Command::Cancel);
    }

    #[test]
    fn test_cancel_is_noop_on_terminal() {
        assert_eq!(ok(Generation, Completed, Command::Cancel), (Generation, Completed));
        assert_eq!(ok(Generation, Cancelled, Command::Cancel), (Generation, Cancelled));
        assert_eq!(ok(Generation, Failed, Command::Cancel), (Generation, Failed));
    }

    #[test]
    fn test_retry_only_from_failed() {
        assert_eq!(ok(DnsValidation, Failed, Command::Retry), (DnsValidation, Configured));
        denied(DnsValidation, Completed, Command::Retry);
        denied(DnsValidation, Cancelled, Command::Retry);
        denied(DnsValidation, InProgress, Command::Retry);
    }

    #[test]
    fn test_fail_only_from_in_progress() {
        assert_eq!(ok(Analysis, InProgress, Command::Fail), (Analysis, Failed));
        denied(Analysis, Configured, Command::Fail);
        denied(Analysis, Paused, Command::Fail);
    }

    #[test]
    fn test_same_state_commands_are_noops() {
        assert_eq!(
            ok(Generation, InProgress, Command::Start(Generation)),
            (Generation, InProgress)
        );
        assert_eq!(ok(Generation, Paused, Command::Pause), (Generation, Paused));
        assert_eq!(ok(Generation, InProgress, Command::Resume), (Generation, InProgress));
        assert_eq!(ok(Generation, Completed, Command::Complete), (Generation, Completed));
    }

    #[test]
    fn test_start_wrong_phase_rejected() {
        denied(Generation, Configured, Command::Start(DnsValidation));
        denied(DnsValidation, Configured, Command::Start(Generation));
    }

    #[test]
    fn test_terminal_states_reject_work_commands() {
        for status in [Completed, Cancelled] {
            denied(Generation, status, Command::Start(Generation));
            denied(Generation, status, Command::Pause);
            denied(Generation, status, Command::Resume);
        }
        denied(Generation, Cancelled, Command::Configure(Generation));
    }
}
