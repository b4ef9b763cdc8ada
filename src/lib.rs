pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod plugin;
pub mod session;
pub mod shutdown;
pub mod worker;

pub use error::{Result, WorkerError};
