//! Lifecycle notifications flowing from jobs and the orchestrator to the
//! control-plane session.
//!
//! Every producer holds a clone of the same [`EventSender`]; the session owns
//! the single receiver and forwards events to the wire in the order they were
//! sent.

use tokio::sync::mpsc;

use crate::job::JobState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// A job accepted a state change.
    StateChanged { job_id: String, state: JobState },
    /// The orchestrator admitted a job and launched its execution context.
    JobStarted { job_id: String },
    /// The orchestrator released a job; `state` is its final state.
    JobFinished { job_id: String, state: JobState },
    /// The execution context hit stack or memory exhaustion. The worker
    /// process must exit once everything before this event is reported.
    ResourceExhausted { job_id: String },
}

pub type EventSender = mpsc::UnboundedSender<WorkerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<WorkerEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
