//! Wire contract between the host and an output plugin.
//!
//! The types here are what crosses the process boundary. Enumerations are
//! transmitted by symbolic name (`"COUNTER"`, `"TIME"`), never by ordinal.

pub mod mapping;
pub mod output;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

pub use output::{Output, PluginError};

/// Service name requested from the plugin after the handshake.
pub const SERVICE_NAME: &str = "output";

pub const METHOD_DISPENSE: &str = "Plugin.Dispense";
pub const METHOD_INIT: &str = "Output.Init";
pub const METHOD_START: &str = "Output.Start";
pub const METHOD_STOP: &str = "Output.Stop";
pub const METHOD_ADD_METRICS: &str = "Output.AddMetrics";
pub const METHOD_ADD_SAMPLES: &str = "Output.AddSamples";

/// Every method a plugin must advertise to satisfy [`Output`].
pub const OUTPUT_METHODS: [&str; 5] = [
    METHOD_INIT,
    METHOD_START,
    METHOD_STOP,
    METHOD_ADD_METRICS,
    METHOD_ADD_SAMPLES,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricType {
    #[default]
    MetricTypeUnspecified,
    Counter,
    Gauge,
    Trend,
    Rate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    #[default]
    ValueTypeUnspecified,
    Default,
    Time,
    Data,
}

/// A metric definition, announced to the plugin once per metric name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub contains: ValueType,
    #[serde(default)]
    pub tainted: bool,
    /// Threshold source expressions, in configuration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thresholds: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub submetrics: Vec<Submetric>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Submetric {
    pub name: String,
    pub suffix: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub metric: Box<Metric>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Name of the metric this sample belongs to.
    pub metric: String,
    /// Milliseconds since the Unix epoch, UTC.
    pub time: i64,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Input of [`Output::init`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// Output of [`Output::init`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    #[serde(default)]
    pub description: String,
    /// Requested flush period in milliseconds; `0` selects the default.
    #[serde(default)]
    pub buffering: u32,
}

/// Argument of `Plugin.Dispense`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispenseRequest {
    pub name: String,
}

/// Result of `Plugin.Dispense`: the methods the service implements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispenseResponse {
    #[serde(default)]
    pub methods: Vec<String>,
}
