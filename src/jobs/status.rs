//! Job status state machine.

use serde::{Deserialize, Serialize};

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting for a runner to pick it up.
    Queued,
    /// A runner is actively executing the job.
    Running,
    /// Paused on a human approval gate.
    PausedForApproval,
    /// Paused awaiting an external consent decision.
    PausedForConsent,
    /// Job work finished successfully.
    Completed,
    /// Job failed and cannot be completed.
    Failed,
    /// Job was canceled.
    Canceled,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// Terminal statuses allow nothing; cancellation is reachable from any
    /// non-terminal status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        if self.is_terminal() {
            return false;
        }
        if target == Canceled {
            return true;
        }

        matches!(
            (self, target),
            // From Queued
            (Queued, Running) |
            // From Running
            (Running, PausedForApproval) | (Running, PausedForConsent) |
            (Running, Completed) | (Running, Failed) |
            // Paused states resume or end
            (PausedForApproval, Running) | (PausedForApproval, Failed) |
            (PausedForConsent, Running) | (PausedForConsent, Failed)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Check if the job is paused on a human gate.
    pub fn is_paused(&self) -> bool {
        matches!(self, Self::PausedForApproval | Self::PausedForConsent)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::PausedForApproval => "paused_for_approval",
            Self::PausedForConsent => "paused_for_consent",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_valid() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::PausedForApproval));
        assert!(JobStatus::PausedForApproval.can_transition_to(JobStatus::Running));
        assert!(JobStatus::PausedForConsent.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn cancel_from_any_non_terminal() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Canceled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Canceled));
        assert!(JobStatus::PausedForApproval.can_transition_to(JobStatus::Canceled));
        assert!(JobStatus::PausedForConsent.can_transition_to(JobStatus::Canceled));
    }

    #[test]
    fn terminal_is_immutable() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Canceled] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(JobStatus::Running));
            assert!(!terminal.can_transition_to(JobStatus::Queued));
            assert!(!terminal.can_transition_to(JobStatus::Canceled));
        }
    }

    #[test]
    fn paused_means_gated_not_terminal() {
        assert!(JobStatus::PausedForApproval.is_paused());
        assert!(JobStatus::PausedForConsent.is_paused());
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Canceled,
        ] {
            assert!(!status.is_paused());
        }
    }

    #[test]
    fn display_matches_wire_form() {
        assert_eq!(JobStatus::PausedForApproval.to_string(), "paused_for_approval");
        assert_eq!(JobStatus::Canceled.to_string(), "canceled");
    }

    #[test]
    fn serde_roundtrip() {
        let json = serde_json::to_string(&JobStatus::PausedForConsent).unwrap();
        assert_eq!(json, "\"paused_for_consent\"");
        let parsed: JobStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, JobStatus::PausedForConsent);
    }
}
