use serde::{Deserialize, Serialize};

/// Lifecycle phase of a job.
///
/// The fixed variants are driven by the worker itself. `Custom` carries a
/// free-text progress label reported by a running algorithm (for example
/// `"refreshing labels"`); it behaves like `Running` for transition purposes
/// and is never terminal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum JobState {
    New,
    Scheduled,
    Initializing,
    Parsing,
    Running,
    CalculatingMetrics,
    Success,
    Aborted,
    Cancelled,
    Failed,
    Cancelling,
    Custom(String),
}

static FIXED_STATES: [JobState; 11] = [
    JobState::New,
    JobState::Scheduled,
    JobState::Initializing,
    JobState::Parsing,
    JobState::Running,
    JobState::CalculatingMetrics,
    JobState::Success,
    JobState::Aborted,
    JobState::Cancelled,
    JobState::Failed,
    JobState::Cancelling,
];

impl JobState {
    /// All variants of the closed enumeration, in lifecycle order.
    pub fn fixed() -> &'static [JobState] {
        &FIXED_STATES
    }

    /// Parses a wire label. Fixed state names match case-insensitively,
    /// anything else becomes a custom state.
    pub fn from_label(label: &str) -> Self {
        FIXED_STATES
            .iter()
            .find(|state| state.label().eq_ignore_ascii_case(label))
            .cloned()
            .unwrap_or_else(|| JobState::Custom(label.to_string()))
    }

    pub fn label(&self) -> &str {
        match self {
            JobState::New => "NEW",
            JobState::Scheduled => "SCHEDULED",
            JobState::Initializing => "INITIALIZING",
            JobState::Parsing => "PARSING",
            JobState::Running => "RUNNING",
            JobState::CalculatingMetrics => "CALCULATING_METRICS",
            JobState::Success => "SUCCESS",
            JobState::Aborted => "ABORTED",
            JobState::Cancelled => "CANCELLED",
            JobState::Failed => "FAILED",
            JobState::Cancelling => "CANCELLING",
            JobState::Custom(label) => label,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Aborted | JobState::Cancelled | JobState::Failed
        )
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, JobState::Custom(_))
    }

    /// Returns true if a job in this state may move to `next`.
    pub fn can_transition_to(&self, next: &JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if self == next {
            return true;
        }
        if matches!(
            next,
            JobState::Aborted | JobState::Failed | JobState::Cancelling
        ) {
            return true;
        }

        match self {
            JobState::New => *next == JobState::Scheduled,
            JobState::Scheduled => matches!(next, JobState::Initializing | JobState::New),
            JobState::Initializing => *next == JobState::Parsing,
            JobState::Parsing => *next == JobState::Running,
            JobState::Running => {
                next.is_terminal() || next.is_custom() || *next == JobState::CalculatingMetrics
            }
            JobState::Custom(_) => JobState::Running.can_transition_to(next),
            JobState::CalculatingMetrics => next.is_terminal(),
            JobState::Cancelling => *next == JobState::Cancelled,
            JobState::Success | JobState::Aborted | JobState::Cancelled | JobState::Failed => {
                false
            }
        }
    }
}

/// Transition check used by everything that changes a job's phase.
pub fn transition(current: &JobState, requested: &JobState) -> bool {
    current.can_transition_to(requested)
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl From<JobState> for String {
    fn from(state: JobState) -> Self {
        state.label().to_string()
    }
}

impl From<String> for JobState {
    fn from(label: String) -> Self {
        JobState::from_label(&label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom(label: &str) -> JobState {
        JobState::Custom(label.to_string())
    }

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = JobState::fixed()
            .iter()
            .filter(|s| s.is_terminal())
            .cloned()
            .collect();
        assert_eq!(
            terminal,
            vec![
                JobState::Success,
                JobState::Aborted,
                JobState::Cancelled,
                JobState::Failed
            ]
        );
        assert!(!custom("refreshing labels").is_terminal());
    }

    #[test]
    fn labels_round_trip_through_from_label() {
        for state in JobState::fixed() {
            assert_eq!(&JobState::from_label(state.label()), state);
        }
        assert_eq!(JobState::from_label("running"), JobState::Running);
        assert_eq!(
            JobState::from_label("refreshing labels"),
            custom("refreshing labels")
        );
    }

    #[test]
    fn custom_state_behaves_like_running() {
        let running = JobState::Running;
        let phase = custom("phase 1");
        let mut targets: Vec<JobState> = JobState::fixed().to_vec();
        targets.push(custom("phase 2"));
        for target in &targets {
            assert_eq!(
                phase.can_transition_to(target),
                running.can_transition_to(target),
                "custom -> {target}"
            );
        }
    }

    #[test]
    fn running_accepts_custom_progress() {
        assert!(JobState::Running.can_transition_to(&custom("phase 1")));
        assert!(custom("phase 1").can_transition_to(&custom("phase 2")));
        assert!(!JobState::Parsing.can_transition_to(&custom("phase 1")));
        assert!(!JobState::CalculatingMetrics.can_transition_to(&custom("phase 1")));
    }

    #[test]
    fn serializes_as_label() {
        let json = serde_json::to_string(&JobState::CalculatingMetrics).unwrap();
        assert_eq!(json, "\"CALCULATING_METRICS\"");
        let state: JobState = serde_json::from_str("\"refreshing labels\"").unwrap();
        assert_eq!(state, custom("refreshing labels"));
    }
}
