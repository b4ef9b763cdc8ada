//! Process protocol between the worker and a plugin executable.
//!
//! `describe` prints one JSON object with the plugin's capabilities.
//! `parse` and `run` read a single JSON request line on stdin. While running,
//! a plugin reports progress as JSON lines on stdout ([`PluginEvent`]);
//! anything written to stderr is forwarded to the job log. A zero exit status
//! means success.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::{Capability, PluginDescriptor, PluginError, PluginInstance, PluginResult};
use crate::job::ParameterMap;

/// Environment variable pointing plugins at the directory their installed
/// dependencies live in.
pub const PLUGIN_PATH_ENV: &str = "MONET_PLUGIN_PATH";

const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct Description {
    capabilities: Vec<Capability>,
}

/// Asks a plugin executable which capabilities it offers.
pub(crate) async fn describe(
    program: &Path,
    plugin: &PluginDescriptor,
) -> PluginResult<Vec<Capability>> {
    let output = Command::new(program)
        .arg("describe")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(DESCRIBE_TIMEOUT, output)
        .await
        .map_err(|_| PluginError::Protocol {
            plugin: plugin.to_string(),
            message: format!("describe timed out after {}s", DESCRIBE_TIMEOUT.as_secs()),
        })?
        .map_err(|e| PluginError::Spawn {
            plugin: plugin.to_string(),
            source: Arc::new(e),
        })?;

    if !output.status.success() {
        return Err(PluginError::Exit {
            plugin: plugin.to_string(),
            status: output.status.to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| PluginError::Protocol {
            plugin: plugin.to_string(),
            message: "describe produced no output".to_string(),
        })?;
    let description: Description =
        serde_json::from_str(line).map_err(|e| PluginError::Protocol {
            plugin: plugin.to_string(),
            message: format!("invalid describe output: {e}"),
        })?;
    Ok(description.capabilities)
}

#[derive(Debug, Serialize)]
pub struct ParseRequest<'a> {
    pub job_id: &'a str,
    pub input: &'a Path,
    pub output: &'a Path,
    pub parameters: &'a ParameterMap,
}

#[derive(Debug, Serialize)]
pub struct RunRequest<'a> {
    pub job_id: &'a str,
    pub input: &'a Path,
    pub parameters: &'a ParameterMap,
}

fn default_level() -> String {
    "info".to_string()
}

/// One line of a running plugin's stdout.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum PluginEvent {
    /// Free-text progress label; becomes a custom job state.
    State { label: String },
    Measure { key: String, value: serde_json::Value },
    /// One point of the Pareto front found so far.
    Pareto { point: Vec<f64> },
    Log {
        #[serde(default = "default_level")]
        level: String,
        message: String,
    },
    /// The plugin ran out of memory or stack and cannot continue.
    Fatal { message: String },
}

/// How a plugin process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited(ExitStatus),
    /// The worker cancelled the job and killed the process.
    Cancelled,
}

impl PluginInstance {
    /// Runs `<artifact> parse`, which must write the parsed input to
    /// `request.output`.
    pub async fn parse(
        &self,
        request: &ParseRequest<'_>,
        cancel: &CancellationToken,
    ) -> PluginResult<ProcessOutcome> {
        self.execute("parse", request, request.job_id, cancel, &mut |event| {
            if let PluginEvent::Log { level, message } = event {
                log_plugin_line(request.job_id, &level, &message);
            }
        })
        .await
    }

    /// Runs `<artifact> run`, handing every stdout event to `on_event`.
    pub async fn run(
        &self,
        request: &RunRequest<'_>,
        cancel: &CancellationToken,
        on_event: &mut (dyn FnMut(PluginEvent) + Send),
    ) -> PluginResult<ProcessOutcome> {
        self.execute("run", request, request.job_id, cancel, on_event)
            .await
    }

    async fn execute<R: Serialize>(
        &self,
        subcommand: &str,
        request: &R,
        job_id: &str,
        cancel: &CancellationToken,
        on_event: &mut (dyn FnMut(PluginEvent) + Send),
    ) -> PluginResult<ProcessOutcome> {
        let plugin = self.descriptor().to_string();
        tracing::debug!(job_id, plugin = %plugin, subcommand, "Spawning plugin process");

        let mut child = Command::new(self.program())
            .arg(subcommand)
            .env(PLUGIN_PATH_ENV, self.plugin_path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PluginError::Spawn {
                plugin: plugin.clone(),
                source: Arc::new(e),
            })?;

        write_request(&plugin, &mut child, request).await?;
        let stderr_task = drain_stderr(&plugin, job_id, &mut child);

        let stdout = child.stdout.take().ok_or_else(|| PluginError::Protocol {
            plugin: plugin.clone(),
            message: "failed to capture stdout".to_string(),
        })?;
        let mut stdout = BufReader::new(stdout);
        let mut line = Vec::new();
        let mut stdout_open = true;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(job_id, plugin = %plugin, "Killing plugin process");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(job_id, plugin = %plugin, error = %e, "Failed to kill plugin process");
                    }
                    break ProcessOutcome::Cancelled;
                }
                // Partial reads stay in `line` until the newline arrives.
                read = stdout.read_until(b'\n', &mut line), if stdout_open => match read {
                    Ok(0) => stdout_open = false,
                    Ok(_) => {
                        handle_line(&plugin, job_id, &decode_line(&line), on_event);
                        line.clear();
                    }
                    Err(e) => return Err(PluginError::io(&plugin, e)),
                },
                status = child.wait(), if !stdout_open => {
                    let status = status.map_err(|e| PluginError::io(&plugin, e))?;
                    tracing::debug!(job_id, plugin = %plugin, %status, "Plugin process exited");
                    break ProcessOutcome::Exited(status);
                }
            }
        };

        if let Some(task) = stderr_task {
            // A killed plugin's children may still hold stderr open.
            if outcome == ProcessOutcome::Cancelled {
                task.abort();
            }
            let _ = task.await;
        }
        Ok(outcome)
    }
}

async fn write_request<R: Serialize>(
    plugin: &str,
    child: &mut Child,
    request: &R,
) -> PluginResult<()> {
    let mut line = serde_json::to_vec(request).map_err(|e| PluginError::Protocol {
        plugin: plugin.to_string(),
        message: format!("failed to encode request: {e}"),
    })?;
    line.push(b'\n');

    let mut stdin = child.stdin.take().ok_or_else(|| PluginError::Protocol {
        plugin: plugin.to_string(),
        message: "failed to capture stdin".to_string(),
    })?;
    // A plugin that exits without reading its request shows up in the exit
    // status, not here.
    match stdin.write_all(&line).await {
        Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(PluginError::io(plugin, e)),
        // Dropping stdin closes the pipe.
        _ => Ok(()),
    }
}

fn drain_stderr(
    plugin: &str,
    job_id: &str,
    child: &mut Child,
) -> Option<tokio::task::JoinHandle<()>> {
    let stderr = child.stderr.take()?;
    let plugin = plugin.to_string();
    let job_id = job_id.to_string();
    Some(tokio::spawn(async move {
        let mut stderr = BufReader::new(stderr);
        let mut line = Vec::new();
        loop {
            match stderr.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = decode_line(&line);
                    if !text.trim().is_empty() {
                        tracing::info!(target: "job", job_id = %job_id, plugin = %plugin, "{text}");
                    }
                    line.clear();
                }
                Err(e) => {
                    tracing::debug!(job_id = %job_id, plugin = %plugin, error = %e, "Plugin stderr closed");
                    break;
                }
            }
        }
    }))
}

/// Plugin output is not required to be UTF-8.
fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

fn handle_line(
    plugin: &str,
    job_id: &str,
    line: &str,
    on_event: &mut (dyn FnMut(PluginEvent) + Send),
) {
    if line.trim().is_empty() {
        return;
    }
    match serde_json::from_str::<PluginEvent>(line) {
        Ok(event) => on_event(event),
        Err(e) => {
            tracing::debug!(job_id, plugin, error = %e, line, "Ignoring unparseable plugin output");
        }
    }
}

/// Logs a plugin's `log` event on the job channel at the level it asked for.
pub fn log_plugin_line(job_id: &str, level: &str, message: &str) {
    match level.to_ascii_lowercase().as_str() {
        "error" | "fatal" => tracing::error!(target: "job", job_id, "{message}"),
        "warn" | "warning" => tracing::warn!(target: "job", job_id, "{message}"),
        "debug" => tracing::debug!(target: "job", job_id, "{message}"),
        "trace" => tracing::trace!(target: "job", job_id, "{message}"),
        _ => tracing::info!(target: "job", job_id, "{message}"),
    }
}
