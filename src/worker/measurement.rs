//! Measurements recorded while a job runs.
//!
//! A [`Meter`] is opened when a job's execution starts and streams every
//! measurement to a [`MeasurementSink`]. Only a successful job commits its
//! measurements; a failed or cancelled one leaves them uncommitted so the
//! diagnostics stay available without counting as a result.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Key of the algorithm wall-clock time in nanoseconds.
pub const RUNTIME: &str = "RUNTIME";
pub const EXCEPTION: &str = "EXCEPTION";
pub const EXCEPTION_STACKTRACE: &str = "EXCEPTION-STACKTRACE";
pub const PARETO_POINTS: &str = "paretoFront/points/#/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub time: DateTime<Utc>,
    pub key: String,
    pub value: serde_json::Value,
}

pub trait MeasurementSink: Send + Sync {
    fn record(&self, job_id: &str, measurement: &Measurement) -> std::io::Result<()>;

    /// Marks the job's measurements as a final result.
    fn commit(&self, job_id: &str) -> std::io::Result<()>;

    /// Flushes and releases whatever the sink keeps open for the job.
    fn close(&self, _job_id: &str) -> std::io::Result<()> {
        Ok(())
    }
}

/// Writes one JSON line per measurement to `<dir>/<job>.jsonl.partial` and
/// renames the file to `<job>.jsonl` on commit.
///
/// Each job keeps a buffered file open until it is committed or closed, so
/// recording is a memory copy most of the time. The occasional flush blocks
/// the calling task; plugins report at a rate where that does not matter.
#[derive(Debug)]
pub struct JsonlMeasurementSink {
    dir: PathBuf,
    writers: Mutex<HashMap<String, BufWriter<File>>>,
}

impl JsonlMeasurementSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writers: Mutex::new(HashMap::new()),
        }
    }

    fn open_partial(&self, job_id: &str) -> std::io::Result<BufWriter<File>> {
        std::fs::create_dir_all(&self.dir)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.partial_path(job_id))?;
        Ok(BufWriter::new(file))
    }

    fn file_stem(job_id: &str) -> String {
        job_id.replace('/', "-")
    }

    pub fn partial_path(&self, job_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.jsonl.partial", Self::file_stem(job_id)))
    }

    pub fn committed_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", Self::file_stem(job_id)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl MeasurementSink for JsonlMeasurementSink {
    fn record(&self, job_id: &str, measurement: &Measurement) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(measurement).map_err(std::io::Error::other)?;
        line.push(b'\n');

        let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = match writers.entry(job_id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.open_partial(job_id)?),
        };
        writer.write_all(&line)
    }

    fn commit(&self, job_id: &str) -> std::io::Result<()> {
        let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut writer) = writers.remove(job_id) {
            writer.flush()?;
        }
        let partial = self.partial_path(job_id);
        if !partial.exists() {
            std::fs::create_dir_all(&self.dir)?;
            std::fs::File::create(&partial)?;
        }
        std::fs::rename(partial, self.committed_path(job_id))
    }

    fn close(&self, job_id: &str) -> std::io::Result<()> {
        let writer = self
            .writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id);
        match writer {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordedJob {
    pub measurements: Vec<Measurement>,
    pub committed: bool,
}

impl RecordedJob {
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.measurements
            .iter()
            .find(|m| m.key == key)
            .map(|m| &m.value)
    }
}

/// Keeps measurements in memory; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryMeasurementSink {
    jobs: Mutex<HashMap<String, RecordedJob>>,
}

impl MemoryMeasurementSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(&self, job_id: &str) -> Option<RecordedJob> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
    }
}

impl MeasurementSink for MemoryMeasurementSink {
    fn record(&self, job_id: &str, measurement: &Measurement) -> std::io::Result<()> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(job_id.to_string())
            .or_default()
            .measurements
            .push(measurement.clone());
        Ok(())
    }

    fn commit(&self, job_id: &str) -> std::io::Result<()> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(job_id.to_string())
            .or_default()
            .committed = true;
        Ok(())
    }
}

/// Per-job measurement handle.
pub struct Meter {
    job_id: String,
    sink: Arc<dyn MeasurementSink>,
    pareto_front: Vec<Vec<f64>>,
    started: Option<Instant>,
}

impl Meter {
    pub fn new(job_id: impl Into<String>, sink: Arc<dyn MeasurementSink>) -> Self {
        Self {
            job_id: job_id.into(),
            sink,
            pareto_front: Vec::new(),
            started: None,
        }
    }

    /// Starts the runtime clock.
    pub fn start_experiment(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Stops the runtime clock and records `RUNTIME`. Further calls do nothing.
    pub fn end_experiment(&mut self) {
        if let Some(started) = self.started.take() {
            let nanos = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
            self.measure(RUNTIME, nanos.into());
        }
    }

    pub fn measure(&mut self, key: &str, value: serde_json::Value) {
        let measurement = Measurement {
            time: Utc::now(),
            key: key.to_string(),
            value,
        };
        if let Err(e) = self.sink.record(&self.job_id, &measurement) {
            tracing::warn!(job_id = %self.job_id, key, error = %e, "Failed to record measurement");
        }
    }

    pub fn measure_pareto(&mut self, point: Vec<f64>) {
        self.measure(PARETO_POINTS, serde_json::json!(point));
        self.pareto_front.push(point);
    }

    pub fn pareto_front(&self) -> &[Vec<f64>] {
        &self.pareto_front
    }

    /// Drops the in-memory Pareto front.
    pub fn release_front(&mut self) {
        self.pareto_front = Vec::new();
    }

    /// Commits everything measured as the job's result.
    pub fn send(&mut self) -> std::io::Result<()> {
        self.sink.commit(&self.job_id)
    }
}

impl Drop for Meter {
    fn drop(&mut self) {
        if let Err(e) = self.sink.close(&self.job_id) {
            tracing::warn!(job_id = %self.job_id, error = %e, "Failed to flush measurements");
        }
    }
}

impl std::fmt::Debug for Meter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Meter")
            .field("job_id", &self.job_id)
            .field("pareto_points", &self.pareto_front.len())
            .field("running", &self.started.is_some())
            .finish()
    }
}
