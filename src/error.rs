use thiserror::Error;

use crate::job::JobState;
use crate::plugin::PluginError;
use crate::plugin::store::StoreError;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker is busy with job {0}")]
    Busy(String),

    #[error("illegal transition from state {from} to {to}")]
    IllegalTransition { from: JobState, to: JobState },

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("Artifact store error: {0}")]
    Store(#[from] StoreError),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
