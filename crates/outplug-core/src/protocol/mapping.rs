//! Translation of harness metrics and samples into wire types.
//!
//! The harness identifies metric and value kinds by declaration ordinal.
//! The tables below pin that order; [`verify_kind_cardinality`] is run at
//! construction so a harness that grows or shrinks an enumeration fails
//! loudly instead of silently mapping to the unspecified variant.

use super::{Metric, MetricType, Sample, Submetric, ValueType};
use crate::harness::{HarnessMetric, HarnessSample, KindCardinality, Thresholds};

/// Bumped whenever either table below changes.
pub const KIND_TABLE_VERSION: u32 = 1;

/// Harness metric type ordinal -> wire type.
const METRIC_TYPES: [MetricType; 4] = [
    MetricType::Counter,
    MetricType::Gauge,
    MetricType::Trend,
    MetricType::Rate,
];

/// Harness value type ordinal -> wire type.
const VALUE_TYPES: [ValueType; 3] = [ValueType::Default, ValueType::Time, ValueType::Data];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MappingError {
    #[error(
        "harness declares {declared} {kind} kinds but mapping table v{version} has {expected}"
    )]
    CardinalityMismatch {
        kind: &'static str,
        declared: usize,
        expected: usize,
        version: u32,
    },
}

/// Check the harness's enumeration sizes against the mapping tables.
pub fn verify_kind_cardinality(cardinality: KindCardinality) -> Result<(), MappingError> {
    if cardinality.metric_types != METRIC_TYPES.len() {
        return Err(MappingError::CardinalityMismatch {
            kind: "metric",
            declared: cardinality.metric_types,
            expected: METRIC_TYPES.len(),
            version: KIND_TABLE_VERSION,
        });
    }
    if cardinality.value_types != VALUE_TYPES.len() {
        return Err(MappingError::CardinalityMismatch {
            kind: "value",
            declared: cardinality.value_types,
            expected: VALUE_TYPES.len(),
            version: KIND_TABLE_VERSION,
        });
    }
    Ok(())
}

pub fn map_metric_type(ordinal: i32) -> MetricType {
    usize::try_from(ordinal)
        .ok()
        .and_then(|idx| METRIC_TYPES.get(idx).copied())
        .unwrap_or(MetricType::MetricTypeUnspecified)
}

pub fn map_value_type(ordinal: i32) -> ValueType {
    usize::try_from(ordinal)
        .ok()
        .and_then(|idx| VALUE_TYPES.get(idx).copied())
        .unwrap_or(ValueType::ValueTypeUnspecified)
}

/// Build the wire definition of `metric`.
///
/// Submetrics are mapped recursively and carry the parent's thresholds.
pub fn map_metric(metric: &HarnessMetric, thresholds: Option<&Thresholds>) -> Metric {
    let submetrics = metric
        .submetrics
        .iter()
        .map(|sub| Submetric {
            name: sub.name.clone(),
            suffix: sub.suffix.clone(),
            tags: sub.tags.clone(),
            metric: Box::new(map_metric(&sub.metric, thresholds)),
        })
        .collect();

    Metric {
        name: metric.name.clone(),
        metric_type: map_metric_type(metric.metric_type),
        contains: map_value_type(metric.contains),
        tainted: metric.tainted.unwrap_or(false),
        thresholds: thresholds
            .map(|t| t.thresholds.iter().map(|t| t.source.clone()).collect())
            .unwrap_or_default(),
        submetrics,
    }
}

pub fn map_sample(sample: &HarnessSample) -> Sample {
    Sample {
        metric: sample.metric.name.clone(),
        time: sample.time.timestamp_millis(),
        value: sample.value,
        tags: sample.tags.clone(),
        metadata: sample.metadata.clone(),
    }
}
