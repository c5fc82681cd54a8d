//! Shared test utilities for outplug integration tests.
//!
//! - [`RecordingOutput`]: an in-memory plugin endpoint that records every
//!   call and can be told to fail.
//! - [`RecordingSink`]: a log sink that keeps every bridged record.
//! - Builders for harness metrics, samples and batches.
//! - Helpers for reading the fixture plugin's call recording.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use outplug_core::harness::{HarnessMetric, HarnessSample, SampleContainer};
use outplug_core::logbridge::{LogRecord, LogSink};
use outplug_core::protocol::{Info, Metric, Output, Params, PluginError, Sample};

// -----------------------------------------------------------------------
// Plugin double
// -----------------------------------------------------------------------

/// One call received by a [`RecordingOutput`].
#[derive(Debug, Clone, PartialEq)]
pub enum OutputCall {
    Init(Params),
    Start,
    Stop,
    AddMetrics(Vec<Metric>),
    AddSamples(Vec<Sample>),
}

/// Plugin endpoint that records calls instead of delivering anything.
#[derive(Debug, Default)]
pub struct RecordingOutput {
    info: Info,
    calls: Mutex<Vec<OutputCall>>,
    fail_init: bool,
    fail_add_metrics: bool,
    fail_add_samples: bool,
}

impl RecordingOutput {
    pub fn new(description: &str, buffering: u32) -> Self {
        Self {
            info: Info {
                description: description.to_string(),
                buffering,
            },
            ..Self::default()
        }
    }

    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn failing_add_metrics(mut self) -> Self {
        self.fail_add_metrics = true;
        self
    }

    pub fn failing_add_samples(mut self) -> Self {
        self.fail_add_samples = true;
        self
    }

    pub fn calls(&self) -> Vec<OutputCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Names from every `add_metrics` call, in order.
    pub fn announced_metrics(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                OutputCall::AddMetrics(metrics) => Some(metrics),
                _ => None,
            })
            .flatten()
            .map(|m| m.name)
            .collect()
    }

    /// Every sample delivered so far.
    pub fn delivered_samples(&self) -> Vec<Sample> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                OutputCall::AddSamples(samples) => Some(samples),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Number of `add_metrics` plus `add_samples` calls.
    pub fn add_call_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, OutputCall::AddMetrics(_) | OutputCall::AddSamples(_)))
            .count()
    }

    fn push(&self, call: OutputCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Output for RecordingOutput {
    async fn init(&self, _ctx: &CancellationToken, params: Params) -> Result<Info, PluginError> {
        self.push(OutputCall::Init(params));
        if self.fail_init {
            return Err(PluginError::failed("init failed"));
        }
        Ok(self.info.clone())
    }

    async fn start(&self, _ctx: &CancellationToken) -> Result<(), PluginError> {
        self.push(OutputCall::Start);
        Ok(())
    }

    async fn stop(&self, _ctx: &CancellationToken) -> Result<(), PluginError> {
        self.push(OutputCall::Stop);
        Ok(())
    }

    async fn add_metrics(
        &self,
        _ctx: &CancellationToken,
        metrics: Vec<Metric>,
    ) -> Result<(), PluginError> {
        self.push(OutputCall::AddMetrics(metrics));
        if self.fail_add_metrics {
            return Err(PluginError::failed("add_metrics failed"));
        }
        Ok(())
    }

    async fn add_samples(
        &self,
        _ctx: &CancellationToken,
        samples: Vec<Sample>,
    ) -> Result<(), PluginError> {
        self.push(OutputCall::AddSamples(samples));
        if self.fail_add_samples {
            return Err(PluginError::failed("add_samples failed"));
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------
// Log sink double
// -----------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<LogRecord>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn find(&self, message: &str) -> Option<LogRecord> {
        self.records().into_iter().find(|r| r.message == message)
    }
}

impl LogSink for RecordingSink {
    fn emit(&self, record: &LogRecord) {
        self.records.lock().unwrap().push(record.clone());
    }
}

// -----------------------------------------------------------------------
// Harness builders
// -----------------------------------------------------------------------

/// Harness metric with the given kind ordinals.
pub fn metric(name: &str, metric_type: i32, contains: i32) -> Arc<HarnessMetric> {
    Arc::new(HarnessMetric::new(name, metric_type, contains))
}

pub fn sample_at(metric: &Arc<HarnessMetric>, time: DateTime<Utc>, value: f64) -> HarnessSample {
    HarnessSample {
        metric: Arc::clone(metric),
        time,
        value,
        tags: None,
        metadata: None,
    }
}

pub fn sample(metric: &Arc<HarnessMetric>, value: f64) -> HarnessSample {
    sample_at(metric, Utc::now(), value)
}

pub fn tagged(mut sample: HarnessSample, tags: &[(&str, &str)]) -> HarnessSample {
    sample.tags = Some(
        tags.iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect::<BTreeMap<_, _>>(),
    );
    sample
}

/// One container holding a sample per value.
pub fn batch(metric: &Arc<HarnessMetric>, values: &[f64]) -> SampleContainer {
    values.iter().map(|v| sample(metric, *v)).collect()
}

// -----------------------------------------------------------------------
// Fixture plugin helpers
// -----------------------------------------------------------------------

/// Calls recorded by the fixture plugin's `--record` file.
pub fn read_recording(path: &Path) -> Vec<Value> {
    match std::fs::read_to_string(path) {
        Ok(contents) => contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => panic!("failed to read recording {}: {e}", path.display()),
    }
}

/// The `call` tag of every recorded call.
pub fn recorded_calls(path: &Path) -> Vec<String> {
    read_recording(path)
        .iter()
        .filter_map(|v| v["call"].as_str().map(str::to_string))
        .collect()
}

/// Quote `s` for a shell-style plugin command line.
pub fn shell_quote(s: &str) -> String {
    shlex::try_quote(s)
        .expect("paths used in tests contain no NUL bytes")
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_paths_split_back_to_one_word() {
        let path = "/tmp/it's a dir/plugin";
        let line = format!("{} --record out.jsonl", shell_quote(path));
        assert_eq!(
            shlex::split(&line).unwrap(),
            vec![path, "--record", "out.jsonl"]
        );
    }
}
