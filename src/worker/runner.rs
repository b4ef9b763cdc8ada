use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::WorkerError;
use crate::job::{Job, JobState};
use crate::plugin::process::{self, ParseRequest, PluginEvent, ProcessOutcome, RunRequest};
use crate::plugin::store::ArtifactStore;
use crate::plugin::{Capability, PluginDirectory, PluginError};
use crate::worker::RESOURCE_EXHAUSTED_EXIT_CODE;
use crate::worker::measurement::{EXCEPTION, EXCEPTION_STACKTRACE, MeasurementSink, Meter};
use crate::worker::metrics;

/// Key of the hypervolume measured after a run that produced a Pareto front.
pub const S_METRIC: &str = "SMetric";

#[cfg(unix)]
mod signals {
    pub const SIGBUS: i32 = 7;
    pub const SIGKILL: i32 = 9;
    pub const SIGSEGV: i32 = 11;
}

/// How a job's execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failed,
    Cancelled,
    /// The plugin ran out of memory or stack. The job failed and the worker
    /// has to exit.
    ResourceExhausted,
}

impl RunOutcome {
    pub fn final_state(self) -> JobState {
        match self {
            RunOutcome::Success => JobState::Success,
            RunOutcome::Failed | RunOutcome::ResourceExhausted => JobState::Failed,
            RunOutcome::Cancelled => JobState::Cancelled,
        }
    }
}

enum Completion {
    Finished,
    Cancelled,
}

struct Failure {
    error: WorkerError,
    exhausted: bool,
}

impl Failure {
    fn exhausted(message: String) -> Self {
        Self {
            error: WorkerError::Execution(message),
            exhausted: true,
        }
    }
}

impl From<WorkerError> for Failure {
    fn from(error: WorkerError) -> Self {
        Self {
            error,
            exhausted: false,
        }
    }
}

impl From<PluginError> for Failure {
    fn from(error: PluginError) -> Self {
        WorkerError::from(error).into()
    }
}

/// Drives one job through resolve, download, parse and run.
pub struct JobRunner {
    directory: Arc<PluginDirectory>,
    store: Arc<dyn ArtifactStore>,
    sink: Arc<dyn MeasurementSink>,
    scratch_dir: PathBuf,
}

impl JobRunner {
    pub fn new(
        directory: Arc<PluginDirectory>,
        store: Arc<dyn ArtifactStore>,
        sink: Arc<dyn MeasurementSink>,
    ) -> Self {
        Self {
            directory,
            store,
            sink,
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Directory input graphs are downloaded to.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn directory(&self) -> &Arc<PluginDirectory> {
        &self.directory
    }

    pub async fn run(&self, job: &Job, cancel: &CancellationToken) -> RunOutcome {
        let mut meter = Meter::new(job.id(), self.sink.clone());

        let outcome = match self.execute(job, cancel, &mut meter).await {
            Ok(Completion::Finished) if job.state() == JobState::Cancelling => {
                RunOutcome::Cancelled
            }
            Ok(Completion::Finished) => RunOutcome::Success,
            Ok(Completion::Cancelled) => {
                tracing::info!(target: "job", job_id = %job.id(), "Job cancelled by control server");
                RunOutcome::Cancelled
            }
            Err(_) if cancel.is_cancelled() && job.state() == JobState::Cancelling => {
                tracing::info!(target: "job", job_id = %job.id(), "Job cancelled by control server");
                RunOutcome::Cancelled
            }
            Err(failure) => {
                if failure.exhausted {
                    meter.release_front();
                }
                record_failure(job, &mut meter, &failure.error);
                if failure.exhausted {
                    RunOutcome::ResourceExhausted
                } else {
                    RunOutcome::Failed
                }
            }
        };
        meter.end_experiment();

        if outcome == RunOutcome::Success {
            if let Err(e) = meter.send() {
                tracing::error!(job_id = %job.id(), error = %e, "Failed to commit measurements");
            }
        }
        outcome
    }

    async fn execute(
        &self,
        job: &Job,
        cancel: &CancellationToken,
        meter: &mut Meter,
    ) -> Result<Completion, Failure> {
        let spec = job.spec();
        let algorithm = self
            .directory
            .resolve(&spec.algorithm, Capability::Algorithm)
            .await?;
        let parser = self
            .directory
            .resolve(&spec.parser, Capability::Parser)
            .await?;
        if cancel.is_cancelled() {
            return Ok(Completion::Cancelled);
        }

        let input = self.download_input(job).await?;
        if cancel.is_cancelled() {
            return Ok(Completion::Cancelled);
        }

        job.set_state(JobState::Parsing)?;
        let parsed = input.with_extension("parsed");
        job.set_parsed_input(parsed.clone());
        let parser_parameters = job.parser_parameters();
        let request = ParseRequest {
            job_id: job.id(),
            input: &input,
            output: &parsed,
            parameters: &parser_parameters,
        };
        match parser.parse(&request, cancel).await? {
            ProcessOutcome::Cancelled => return Ok(Completion::Cancelled),
            ProcessOutcome::Exited(status) => check_exit("parser", status, None)?,
        }
        if !tokio::fs::try_exists(&parsed).await.unwrap_or(false) {
            return Err(WorkerError::Execution(format!(
                "parser {} produced no output",
                parser.descriptor()
            ))
            .into());
        }

        job.set_state(JobState::Running)?;
        meter.start_experiment();
        let algorithm_parameters = job.algorithm_parameters();
        let request = RunRequest {
            job_id: job.id(),
            input: &parsed,
            parameters: &algorithm_parameters,
        };
        let mut fatal = None;
        let outcome = {
            let mut on_event = |event: PluginEvent| handle_event(job, meter, &mut fatal, event);
            algorithm.run(&request, cancel, &mut on_event).await?
        };
        meter.end_experiment();
        match outcome {
            ProcessOutcome::Cancelled => return Ok(Completion::Cancelled),
            ProcessOutcome::Exited(status) => check_exit("algorithm", status, fatal)?,
        }

        if !meter.pareto_front().is_empty() && job.state() != JobState::Cancelling {
            job.set_state(JobState::CalculatingMetrics)?;
            let value = metrics::s_metric(meter.pareto_front());
            meter.measure(S_METRIC, serde_json::json!(value));
        }
        Ok(Completion::Finished)
    }

    async fn download_input(&self, job: &Job) -> Result<PathBuf, Failure> {
        let graph = &job.spec().graph;
        let bytes = self
            .store
            .fetch_input(graph)
            .await
            .map_err(WorkerError::from)?;
        let path = input_path(&self.scratch_dir, job.id());
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(WorkerError::from)?;
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(WorkerError::from)?;
        job.set_input_file(path.clone());
        tracing::debug!(target: "job", job_id = %job.id(), graph = %graph, path = %path.display(), "Input graph downloaded");
        Ok(path)
    }
}

/// Local file an input graph is downloaded to.
pub fn input_path(scratch_dir: &Path, job_id: &str) -> PathBuf {
    scratch_dir.join(format!("monet-input-graph-{}.graph", job_id.replace('/', "-")))
}

fn handle_event(job: &Job, meter: &mut Meter, fatal: &mut Option<String>, event: PluginEvent) {
    match event {
        PluginEvent::State { label } => {
            let state = JobState::from_label(&label);
            if !state.is_custom() && state != JobState::Running {
                tracing::warn!(job_id = %job.id(), label = %label, "Ignoring reserved state from plugin");
                return;
            }
            if let Err(e) = job.set_state(state) {
                tracing::warn!(job_id = %job.id(), error = %e, "Ignoring plugin progress");
            }
        }
        PluginEvent::Measure { key, value } => meter.measure(&key, value),
        PluginEvent::Pareto { point } => meter.measure_pareto(point),
        PluginEvent::Log { level, message } => process::log_plugin_line(job.id(), &level, &message),
        PluginEvent::Fatal { message } => {
            tracing::error!(target: "job", job_id = %job.id(), message = %message, "Plugin reported resource exhaustion");
            *fatal = Some(message);
        }
    }
}

fn check_exit(role: &str, status: ExitStatus, fatal: Option<String>) -> Result<(), Failure> {
    if let Some(message) = fatal {
        return Err(Failure::exhausted(format!("{role} ran out of resources: {message}")));
    }
    if is_resource_exhaustion(&status) {
        return Err(Failure::exhausted(format!(
            "{role} ran out of resources ({status})"
        )));
    }
    if !status.success() {
        return Err(WorkerError::Execution(format!("{role} exited with {status}")).into());
    }
    Ok(())
}

/// Stack overflow, memory exhaustion or an OOM kill the worker did not ask for.
pub fn is_resource_exhaustion(status: &ExitStatus) -> bool {
    if status.code() == Some(RESOURCE_EXHAUSTED_EXIT_CODE) {
        return true;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return matches!(
                signal,
                signals::SIGSEGV | signals::SIGBUS | signals::SIGKILL
            );
        }
    }
    false
}

fn record_failure(job: &Job, meter: &mut Meter, error: &WorkerError) {
    meter.measure(EXCEPTION, serde_json::json!(error.to_string()));
    meter.measure(EXCEPTION_STACKTRACE, serde_json::json!(error_chain(error)));
    tracing::error!(target: "job", job_id = %job.id(), error = %error, "Job ends with error");
}

/// The error and every source below it, one per line.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut chain = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        chain.push_str("\ncaused by: ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn status(raw: i32) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(raw)
    }

    #[cfg(unix)]
    #[test]
    fn classifies_exhaustion() {
        assert!(is_resource_exhaustion(&status(12 << 8)));
        assert!(is_resource_exhaustion(&status(11)));
        assert!(is_resource_exhaustion(&status(9)));
        assert!(!is_resource_exhaustion(&status(0)));
        assert!(!is_resource_exhaustion(&status(1 << 8)));
        assert!(!is_resource_exhaustion(&status(15)));
    }

    #[test]
    fn input_path_flattens_job_id() {
        assert_eq!(
            input_path(Path::new("/tmp"), "exp/7"),
            PathBuf::from("/tmp/monet-input-graph-exp-7.graph")
        );
    }

    #[test]
    fn outcome_final_states() {
        assert_eq!(RunOutcome::Success.final_state(), JobState::Success);
        assert_eq!(RunOutcome::ResourceExhausted.final_state(), JobState::Failed);
        assert_eq!(RunOutcome::Cancelled.final_state(), JobState::Cancelled);
    }

    #[test]
    fn error_chain_lists_sources() {
        let error = WorkerError::from(PluginError::io(
            "tsp#1.0",
            std::io::Error::other("disk on fire"),
        ));
        let chain = error_chain(&error);
        assert!(chain.starts_with("plugin tsp#1.0 I/O error"));
        assert!(chain.contains("caused by: disk on fire"));
    }
}
