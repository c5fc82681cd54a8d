//! Host-side bridge that delivers harness telemetry to an out-of-process
//! output plugin.
//!
//! ```text
//! harness --add_metric_samples--> Extension --> SampleBuffer
//!                                     |
//!                          PeriodicFlusher tick
//!                                     |
//!                    MetricRegistry (dedup) + mapping
//!                                     |
//!             Output::add_metrics / Output::add_samples (JSON-RPC)
//!                                     |
//!                     plugin subprocess (PluginHandle)
//!                                     |
//!                       stderr --> LogBridge --> tracing
//! ```

pub mod buffer;
pub mod config;
pub mod dedup;
pub mod extension;
pub mod flusher;
pub mod harness;
pub mod launcher;
pub mod logbridge;
pub mod protocol;
pub mod transport;

pub use config::ExtensionConfig;
pub use extension::{Extension, ExtensionError, PluginOutputFactory};
pub use harness::{HarnessOutput, OutputRegistry, bootstrap};
pub use launcher::{LaunchError, LaunchOptions, PluginHandle, launch};
pub use logbridge::{LogBridge, LogRecord, LogSink, TracingSink};
pub use protocol::{Output, PluginError};
