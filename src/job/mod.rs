mod lifecycle;
pub mod spec;
mod state;

pub use lifecycle::Job;
pub use spec::{JobSpec, ParameterMap};
pub use state::{JobState, transition};
