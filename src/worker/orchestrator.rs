use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, WorkerError};
use crate::events::{EventSender, WorkerEvent};
use crate::job::{Job, JobState};
use crate::worker::runner::{JobRunner, RunOutcome};

struct ActiveJob {
    job: Arc<Job>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    runner: JobRunner,
    events: EventSender,
    active: Mutex<Option<ActiveJob>>,
}

/// Runs at most one job at a time.
///
/// Admission, cancellation and release all go through the active-job slot;
/// the job itself executes on its own task.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(runner: JobRunner, events: EventSender) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                events,
                active: Mutex::new(None),
            }),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        self.inner.active()
    }

    pub fn is_busy(&self) -> bool {
        self.active().is_some()
    }

    pub fn active_job(&self) -> Option<Arc<Job>> {
        self.active().as_ref().map(|a| a.job.clone())
    }

    /// Admits `job` and launches its execution.
    ///
    /// Fails with [`WorkerError::Busy`] while another job is active; that job
    /// is not affected.
    pub fn start_job(&self, job: Arc<Job>) -> Result<()> {
        let mut active = self.active();
        if let Some(current) = active.as_ref() {
            return Err(WorkerError::Busy(current.job.id().to_string()));
        }

        job.set_state(JobState::Initializing)?;
        let cancel = CancellationToken::new();
        *active = Some(ActiveJob {
            job: job.clone(),
            cancel: cancel.clone(),
            handle: None,
        });
        let _ = self.inner.events.send(WorkerEvent::JobStarted {
            job_id: job.id().to_string(),
        });
        tracing::info!(job_id = %job.id(), algorithm = %job.spec().algorithm, "Job started");

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let outcome = inner.runner.run(&job, &cancel).await;
            inner.experiment_finished(&job, outcome).await;
        });
        if let Some(slot) = active.as_mut() {
            slot.handle = Some(handle);
        }
        Ok(())
    }

    /// Cancels the active job, if any. The job ends `CANCELLED` once its
    /// plugin process is gone.
    pub fn kill_job(&self) {
        let active = self.active();
        let Some(current) = active.as_ref() else {
            tracing::debug!("No active job to cancel");
            return;
        };
        if current.job.state().is_terminal() {
            return;
        }
        if let Err(e) = current.job.set_state(JobState::Cancelling) {
            tracing::warn!(job_id = %current.job.id(), error = %e, "Could not mark job as cancelling");
        }
        tracing::info!(job_id = %current.job.id(), "Cancelling job");
        current.cancel.cancel();
    }

    /// Waits until the active job, if any, has been released.
    pub async fn wait_idle(&self) {
        let handle = self.active().as_mut().and_then(|a| a.handle.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Job task ended abnormally");
            }
        }
    }
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Releases `job`: frees the slot, stops all plugins, applies the final
    /// state and reports the end of the job.
    async fn experiment_finished(&self, job: &Arc<Job>, outcome: RunOutcome) {
        {
            let mut active = self.active();
            match active.as_ref() {
                Some(current) if Arc::ptr_eq(&current.job, job) => {
                    *active = None;
                }
                _ => {
                    tracing::error!(job_id = %job.id(), "Finished job is not the active job");
                    return;
                }
            }
        }

        self.runner.directory().reset_all().await;

        let final_state = outcome.final_state();
        if let Err(e) = job.set_state(final_state.clone()) {
            tracing::warn!(job_id = %job.id(), error = %e, "Could not apply final state");
            if job.state() == JobState::Cancelling {
                let _ = job.set_state(JobState::Cancelled);
            }
        }

        let state = job.state();
        tracing::info!(job_id = %job.id(), state = %state, "Job finished");
        let _ = self.events.send(WorkerEvent::JobFinished {
            job_id: job.id().to_string(),
            state,
        });
        if outcome == RunOutcome::ResourceExhausted {
            let _ = self.events.send(WorkerEvent::ResourceExhausted {
                job_id: job.id().to_string(),
            });
        }
    }
}
