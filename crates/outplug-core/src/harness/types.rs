//! Telemetry types as the harness hands them to an output.
//!
//! Metric and value kinds are carried as the harness's declaration
//! ordinals; [`crate::protocol::mapping`] turns them into wire enums.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::logbridge::{LogSink, TracingSink};

/// A metric as declared by the harness.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessMetric {
    /// Unique metric name.
    pub name: String,
    /// Ordinal of the harness metric type (counter, gauge, trend, rate).
    pub metric_type: i32,
    /// Ordinal of the harness value type (default, time, data).
    pub contains: i32,
    /// Set once a threshold on this metric has been crossed; `None` while
    /// thresholds have not been evaluated yet.
    pub tainted: Option<bool>,
    /// Tag-filtered views of this metric.
    pub submetrics: Vec<HarnessSubmetric>,
}

impl HarnessMetric {
    pub fn new(name: impl Into<String>, metric_type: i32, contains: i32) -> Self {
        Self {
            name: name.into(),
            metric_type,
            contains,
            tainted: None,
            submetrics: Vec::new(),
        }
    }
}

/// A tag-filtered view of a parent metric.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessSubmetric {
    pub name: String,
    pub suffix: String,
    pub tags: BTreeMap<String, String>,
    pub metric: Arc<HarnessMetric>,
}

/// A single measured value.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessSample {
    pub metric: Arc<HarnessMetric>,
    pub time: DateTime<Utc>,
    pub value: f64,
    pub tags: Option<BTreeMap<String, String>>,
    pub metadata: Option<BTreeMap<String, String>>,
}

/// One batch of samples pushed by the harness in a single call.
pub type SampleContainer = Vec<HarnessSample>;

/// A single threshold expression, e.g. `p(95)<100`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Threshold {
    pub source: String,
}

/// All thresholds configured for one metric.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Thresholds {
    pub thresholds: Vec<Threshold>,
}

impl Thresholds {
    pub fn from_sources<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            thresholds: sources
                .into_iter()
                .map(|s| Threshold { source: s.into() })
                .collect(),
        }
    }
}

/// Number of variants the harness declares for its kind enumerations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindCardinality {
    pub metric_types: usize,
    pub value_types: usize,
}

impl Default for KindCardinality {
    fn default() -> Self {
        Self {
            metric_types: 4,
            value_types: 3,
        }
    }
}

/// Everything the harness passes when constructing an output.
#[derive(Clone)]
pub struct OutputParams {
    /// The argument given after the output name, e.g. `./foo --flag`.
    pub config_argument: String,
    /// Environment captured at harness startup.
    pub environment: HashMap<String, String>,
    /// Destination for host and plugin diagnostics.
    pub logger: Arc<dyn LogSink>,
    /// Cardinality of the harness's metric/value kind enumerations.
    pub kind_cardinality: KindCardinality,
}

impl OutputParams {
    pub fn new(config_argument: impl Into<String>, environment: HashMap<String, String>) -> Self {
        Self {
            config_argument: config_argument.into(),
            environment,
            logger: Arc::new(TracingSink),
            kind_cardinality: KindCardinality::default(),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn LogSink>) -> Self {
        self.logger = logger;
        self
    }
}

impl fmt::Debug for OutputParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputParams")
            .field("config_argument", &self.config_argument)
            .field("environment", &self.environment.keys().collect::<Vec<_>>())
            .field("kind_cardinality", &self.kind_cardinality)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_from_sources_keeps_order() {
        let t = Thresholds::from_sources(["rate<0.01", "p(95)<100"]);
        let sources: Vec<&str> = t.thresholds.iter().map(|t| t.source.as_str()).collect();
        assert_eq!(sources, vec!["rate<0.01", "p(95)<100"]);
    }

    #[test]
    fn params_debug_hides_environment_values() {
        let env = HashMap::from([("SECRET".to_string(), "hunter2".to_string())]);
        let params = OutputParams::new("foo", env);
        let debug = format!("{params:?}");
        assert!(debug.contains("SECRET"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn default_cardinality_matches_harness_enums() {
        let c = KindCardinality::default();
        assert_eq!(c.metric_types, 4);
        assert_eq!(c.value_types, 3);
    }
}
