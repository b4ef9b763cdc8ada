use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Result, WorkerError};
use crate::events::{EventSender, WorkerEvent};
use crate::job::spec::{JobSpec, ParameterMap};
use crate::job::state::JobState;

/// Files a job materializes on the worker. Removed once the job is terminal.
#[derive(Debug, Default)]
struct Artifacts {
    input_file: Option<PathBuf>,
    parsed_input: Option<PathBuf>,
}

/// One unit of work received from the control server.
///
/// The state is read by the session while the execution context changes it,
/// so it sits behind a mutex. Every accepted change is announced on the event
/// channel; reaching a terminal state removes the job's local files.
#[derive(Debug)]
pub struct Job {
    spec: JobSpec,
    state: Mutex<JobState>,
    artifacts: Mutex<Artifacts>,
    events: Option<EventSender>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Job {
    /// Creates a job in state `NEW` that reports its transitions to `events`.
    pub fn new(spec: JobSpec, events: EventSender) -> Self {
        Self {
            spec,
            state: Mutex::new(JobState::New),
            artifacts: Mutex::new(Artifacts::default()),
            events: Some(events),
        }
    }

    /// Creates a job nobody observes.
    pub fn detached(spec: JobSpec) -> Self {
        Self {
            spec,
            state: Mutex::new(JobState::New),
            artifacts: Mutex::new(Artifacts::default()),
            events: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn state(&self) -> JobState {
        lock(&self.state).clone()
    }

    /// The single way to change a job's phase.
    ///
    /// Setting the current state again is a no-op. Illegal transitions fail
    /// with [`WorkerError::IllegalTransition`] and leave the job untouched.
    pub fn set_state(&self, next: JobState) -> Result<()> {
        let terminal = {
            let mut state = lock(&self.state);
            if *state == next {
                return Ok(());
            }
            if !state.can_transition_to(&next) {
                return Err(WorkerError::IllegalTransition {
                    from: state.clone(),
                    to: next,
                });
            }
            *state = next.clone();
            tracing::debug!(target: "job", job_id = %self.spec.id, state = %next, "Job changed state");

            // Sent under the lock so observers see transitions in order.
            if let Some(events) = &self.events {
                let _ = events.send(WorkerEvent::StateChanged {
                    job_id: self.spec.id.clone(),
                    state: next.clone(),
                });
            }
            next.is_terminal()
        };

        if terminal {
            self.clean();
        }
        Ok(())
    }

    /// Reports a free-text progress label. Only valid while running.
    pub fn set_progress(&self, label: &str) -> Result<()> {
        self.set_state(JobState::from_label(label))
    }

    pub fn algorithm_parameters(&self) -> ParameterMap {
        self.spec.algorithm_parameters()
    }

    pub fn parser_parameters(&self) -> ParameterMap {
        self.spec.parser_parameters()
    }

    pub fn input_file(&self) -> Option<PathBuf> {
        lock(&self.artifacts).input_file.clone()
    }

    pub fn set_input_file(&self, path: PathBuf) {
        lock(&self.artifacts).input_file = Some(path);
    }

    /// Reference to the artifact the parser produced.
    pub fn parsed_input(&self) -> Option<PathBuf> {
        lock(&self.artifacts).parsed_input.clone()
    }

    pub fn set_parsed_input(&self, path: PathBuf) {
        lock(&self.artifacts).parsed_input = Some(path);
    }

    fn clean(&self) {
        let mut artifacts = lock(&self.artifacts);
        for path in [
            artifacts.input_file.take(),
            artifacts.parsed_input.take(),
        ]
        .into_iter()
        .flatten()
        {
            remove_artifact(&self.spec.id, &path);
        }
    }
}

fn remove_artifact(job_id: &str, path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(job_id, path = %path.display(), "Removed job artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(job_id, path = %path.display(), error = %e, "Failed to remove job artifact")
        }
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Job-{}({})", self.spec.id, self.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;

    fn spec() -> JobSpec {
        JobSpec::new("42", "tsp#1.0", "dimacs#2.0", "g1")
    }

    #[test]
    fn new_job_starts_in_new() {
        let job = Job::detached(spec());
        assert_eq!(job.state(), JobState::New);
        assert_eq!(job.to_string(), "Job-42(NEW)");
    }

    #[test]
    fn accepted_transition_notifies_observer() {
        let (tx, mut rx) = events::channel();
        let job = Job::new(spec(), tx);

        job.set_state(JobState::Scheduled).unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            WorkerEvent::StateChanged {
                job_id: "42".to_string(),
                state: JobState::Scheduled
            }
        );
    }

    #[test]
    fn repeated_state_is_silent() {
        let (tx, mut rx) = events::channel();
        let job = Job::new(spec(), tx);
        job.set_state(JobState::Scheduled).unwrap();
        let _ = rx.try_recv();

        job.set_state(JobState::Scheduled).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn illegal_transition_carries_both_labels() {
        let job = Job::detached(spec());
        let err = job.set_state(JobState::Running).unwrap_err();
        assert_eq!(err.to_string(), "illegal transition from state NEW to RUNNING");
        assert_eq!(job.state(), JobState::New);
    }

    #[test]
    fn terminal_state_removes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.graph");
        let parsed = dir.path().join("input.parsed");
        std::fs::write(&input, "graph").unwrap();
        std::fs::write(&parsed, "parsed").unwrap();

        let job = Job::detached(spec());
        job.set_input_file(input.clone());
        job.set_parsed_input(parsed.clone());
        job.set_state(JobState::Failed).unwrap();

        assert!(!input.exists());
        assert!(!parsed.exists());
        assert!(job.input_file().is_none());
    }

    #[test]
    fn progress_labels_require_running() {
        let job = Job::detached(spec());
        assert!(job.set_progress("refreshing labels").is_err());

        for state in [
            JobState::Scheduled,
            JobState::Initializing,
            JobState::Parsing,
            JobState::Running,
        ] {
            job.set_state(state).unwrap();
        }
        job.set_progress("refreshing labels").unwrap();
        assert_eq!(
            job.state(),
            JobState::Custom("refreshing labels".to_string())
        );
    }
}
