use sha2::{Digest, Sha256};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// Durable queue states. Exactly one worker holds a job in `Running`;
/// `Completed`, `Cancelled` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Retryable,
    Snoozed,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// A job popped from the queue, in `Running` state with its attempt already
/// incremented.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub kind: String,
    pub queue_name: String,
    pub args: serde_json::Value,
    pub attempt: i32,
    pub max_attempts: i32,
    pub args_bytes: i64,
}

/// Stable identity for unique-by-args enqueues. sha2 rather than the std
/// hasher: the fingerprint lives in the database and must agree across
/// processes and releases.
pub fn args_fingerprint(kind: &str, unique_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(b":");
    hasher.update(unique_key.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    #[test]
    fn fingerprint_is_stable() {
        let a = args_fingerprint("analysis:analyze", "octocat/Hello-World@abc");
        let b = args_fingerprint("analysis:analyze", "octocat/Hello-World@abc");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fingerprint_varies_by_kind_and_key() {
        let base = args_fingerprint("analysis:analyze", "octocat/Hello-World@abc");
        assert_ne!(base, args_fingerprint("specview:generate", "octocat/Hello-World@abc"));
        assert_ne!(base, args_fingerprint("analysis:analyze", "octocat/Hello-World@def"));
    }

    #[rstest]
    #[case(JobState::Pending, false)]
    #[case(JobState::Running, false)]
    #[case(JobState::Retryable, false)]
    #[case(JobState::Snoozed, false)]
    #[case(JobState::Completed, true)]
    #[case(JobState::Cancelled, true)]
    #[case(JobState::Failed, true)]
    fn terminal_states(#[case] state: JobState, #[case] terminal: bool) {
        assert_eq!(state.is_terminal(), terminal);
    }

    #[test]
    fn states_round_trip_through_text() {
        for state in [
            JobState::Pending,
            JobState::Running,
            JobState::Retryable,
            JobState::Snoozed,
            JobState::Completed,
            JobState::Cancelled,
            JobState::Failed,
        ] {
            assert_eq!(JobState::from_str(&state.to_string()).unwrap(), state);
        }
    }
}
