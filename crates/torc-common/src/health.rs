//! Pipeline health metrics

use std::fmt;

use serde::{Deserialize, Serialize};

/// Metric taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Completed sagas over terminal sagas
    SuccessRate,
    /// Outstanding retry entries
    RetryCount,
    /// Dead-letter queue depth
    DlqSize,
    /// Mean seconds from saga creation to completion
    AvgProcessingTime,
    /// Sagas stuck in processing/compensating
    StuckTransactions,
    /// Compensated sagas over terminal sagas
    CompensationRate,
    /// Failed sagas over terminal sagas
    ErrorRate,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricType::SuccessRate => "success_rate",
            MetricType::RetryCount => "retry_count",
            MetricType::DlqSize => "dlq_size",
            MetricType::AvgProcessingTime => "avg_processing_time",
            MetricType::StuckTransactions => "stuck_transactions",
            MetricType::CompensationRate => "compensation_rate",
            MetricType::ErrorRate => "error_rate",
        };
        write!(f, "{s}")
    }
}

/// Append-only metric sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetric {
    /// Taxonomy entry
    pub metric_type: MetricType,
    /// Sample label (e.g. the sampling worker)
    pub metric_name: String,
    /// Sample value
    pub metric_value: f64,
    /// Sample time (unix seconds)
    pub recorded_at: u64,
    /// Opaque annotations
    pub metadata: serde_json::Value,
}

/// On-demand aggregate view of the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineHealth {
    /// Completed sagas over terminal sagas, in `[0, 1]`
    pub success_rate: f64,
    /// Failed + DLQ sagas over terminal sagas, in `[0, 1]`
    pub error_rate: f64,
    /// Compensated sagas over terminal sagas, in `[0, 1]`
    pub compensation_rate: f64,
    /// Outstanding retry entries
    pub pending_retries: u64,
    /// Dead-letter queue depth
    pub dlq_size: u64,
    /// Sagas stuck past the staleness threshold
    pub stuck_sagas: u64,
    /// Mean seconds from creation to completion over recent sagas
    pub avg_processing_time_secs: f64,
    /// Snapshot time (unix seconds)
    pub recorded_at: u64,
}
