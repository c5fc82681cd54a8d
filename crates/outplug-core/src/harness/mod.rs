//! The harness-facing side of the bridge.
//!
//! Defines the telemetry types the harness produces, the
//! [`HarnessOutput`] trait it drives, and the [`OutputRegistry`] it looks
//! outputs up in.
//!
//! ```text
//! bootstrap(&mut registry)
//!     |
//!     v
//! OutputRegistry --create("plugin", params)--> Box<dyn HarnessOutput>
//!                                                   |
//!                      set_thresholds / start / add_metric_samples / stop
//! ```

pub mod registry;
pub mod trait_def;
pub mod types;

pub use registry::{OutputFactory, OutputRegistry};
pub use trait_def::HarnessOutput;
pub use types::{
    HarnessMetric, HarnessSample, HarnessSubmetric, KindCardinality, OutputParams, SampleContainer,
    Threshold, Thresholds,
};

use crate::extension::PluginOutputFactory;

/// Register every output this crate provides.
///
/// Called once by the application's startup routine; the registry's
/// lifetime is that routine's scope.
pub fn bootstrap(registry: &mut OutputRegistry) {
    registry.register(PluginOutputFactory);
}
