//! The `HarnessOutput` trait -- what the harness drives during a run.
//!
//! The trait is object-safe so outputs can be produced by an
//! [`super::OutputFactory`] and stored as `Box<dyn HarnessOutput>`.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use super::types::{SampleContainer, Thresholds};

/// An output receiving telemetry from the harness.
///
/// Call order: construction, [`set_thresholds`](Self::set_thresholds),
/// [`start`](Self::start), any number of
/// [`add_metric_samples`](Self::add_metric_samples), then
/// [`stop`](Self::stop).
#[async_trait]
pub trait HarnessOutput: Send + Sync {
    /// One-line description shown by the harness at startup.
    fn description(&self) -> String;

    /// Snapshot of the threshold configuration, keyed by metric name.
    fn set_thresholds(&self, thresholds: HashMap<String, Thresholds>);

    /// Begin accepting telemetry.
    async fn start(&mut self) -> Result<()>;

    /// Hand over sample batches. Must not block on plugin I/O.
    fn add_metric_samples(&self, samples: Vec<SampleContainer>);

    /// Stop delivery and release resources. Terminal.
    async fn stop(&mut self) -> Result<()>;
}

// Compile-time assertion: HarnessOutput must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn HarnessOutput) {}
};
