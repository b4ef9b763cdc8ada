//! Forwarding of log events to the control server.
//!
//! [`RemoteLogLayer`] is a `tracing` layer that turns events with target
//! `job` or `worker` into [`LogRecord`]s and hands them to a
//! [`LogForwarder`]. The session attaches the forwarder when it connects and
//! detaches it when the connection goes away; while detached, records are
//! dropped.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use crate::session::protocol::{KEY_SEPARATOR, LOGGING};

/// Target of events about a single job; forwarded on channel `job-<id>`.
pub const JOB_TARGET: &str = "job";
/// Target of worker lifecycle events; forwarded on channel `worker`.
pub const WORKER_TARGET: &str = "worker";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogError {
    pub name: String,
    pub message: String,
    pub stacktrace: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub channel: String,
    pub thread_name: String,
    /// Milliseconds since the Unix epoch.
    pub time: i64,
    pub level: Option<String>,
    pub logger: String,
    pub message: String,
    pub error: Option<LogError>,
}

impl LogRecord {
    pub fn lines(&self) -> Vec<String> {
        let field = |key: &str, value: &str| format!("{key}{KEY_SEPARATOR}{value}");
        let mut lines = vec![
            LOGGING.to_string(),
            field("Channel", &self.channel),
            field("Threadname", &self.thread_name),
            field("Time", &self.time.to_string()),
        ];
        if let Some(level) = &self.level {
            lines.push(field("Level", level));
        }
        lines.push(field("Logger", &self.logger));
        lines.push(field("Logmessage", &self.message));
        if let Some(error) = &self.error {
            lines.push(field("errorName", &error.name));
            lines.push(field("errorMessage", &error.message));
            lines.push(field("errorStacktrace", &error.stacktrace));
        }
        lines
    }
}

/// Handle through which log records reach the live connection.
#[derive(Debug, Clone, Default)]
pub struct LogForwarder {
    sink: Arc<Mutex<Option<mpsc::UnboundedSender<LogRecord>>>>,
}

impl LogForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes records to a new receiver, replacing any previous one.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<LogRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    pub fn detach(&self) {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_attached(&self) -> bool {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Returns false when no connection takes the record.
    pub fn forward(&self, record: LogRecord) -> bool {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        match sink.as_ref() {
            Some(tx) => tx.send(record).is_ok(),
            None => false,
        }
    }
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    job_id: Option<String>,
    error: Option<String>,
    extra: Vec<String>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "job_id" => self.job_id = Some(value.to_string()),
            "error" => self.error = Some(value.to_string()),
            name => self.extra.push(format!("{name}={value}")),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            "job_id" => self.job_id = Some(format!("{value:?}")),
            "error" => self.error = Some(format!("{value:?}")),
            name => self.extra.push(format!("{name}={value:?}")),
        }
    }
}

/// Layer feeding job and worker events into a [`LogForwarder`].
#[derive(Debug, Clone)]
pub struct RemoteLogLayer {
    forwarder: LogForwarder,
}

impl RemoteLogLayer {
    pub fn new(forwarder: LogForwarder) -> Self {
        Self { forwarder }
    }
}

impl<S: tracing::Subscriber> Layer<S> for RemoteLogLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if target != JOB_TARGET && target != WORKER_TARGET {
            return;
        }
        if !self.forwarder.is_attached() {
            return;
        }

        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let channel = match (target, &fields.job_id) {
            (JOB_TARGET, Some(id)) => format!("job-{id}"),
            _ => WORKER_TARGET.to_string(),
        };
        let mut message = fields.message;
        if !fields.extra.is_empty() {
            message = format!("{message} {}", fields.extra.join(" "));
        }
        let error = fields.error.map(|e| LogError {
            name: "Error".to_string(),
            message: e.clone(),
            stacktrace: e,
        });

        self.forwarder.forward(LogRecord {
            channel,
            thread_name: std::thread::current()
                .name()
                .unwrap_or("worker")
                .to_string(),
            time: chrono::Utc::now().timestamp_millis(),
            level: Some(metadata.level().to_string()),
            logger: metadata.module_path().unwrap_or(target).to_string(),
            message,
            error,
        });
    }
}
