//! Metric recording on top of the batching machinery.
//!
//! A [`MetricRecorder`] buffers [`MetricRecord`]s and hands them to a
//! [`MetricSink`] in batches under the `metric` topic, at least once per
//! flush interval. Recording never waits on the sink.

use crate::adapter::BackendAdapter;
use crate::batch::{BatchConfig, BatchSink, BatchingAdapter};
use crate::error::AdapterError;
use crate::level::Level;
use crate::record::LogEvent;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Topic every metric batch is written under.
pub const METRIC_TOPIC: &str = "metric";

const METRIC_MARKER: &str = "metric";

/// One measurement: a named value with labels, stamped when created.
///
/// Serializes as `{"timestamp": <epoch ms>, "labels": {..},
/// "metric_name": "..", "value": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,
    pub metric_name: String,
    pub value: f64,
}

impl MetricRecord {
    pub fn new(metric_name: impl Into<String>, value: f64) -> Self {
        MetricRecord {
            timestamp: Utc::now(),
            labels: BTreeMap::new(),
            metric_name: metric_name.into(),
            value,
        }
    }

    pub fn label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    fn to_event(&self) -> Result<LogEvent, AdapterError> {
        if !self.value.is_finite() {
            return Err(format!("metric {} has non-finite value {}", self.metric_name, self.value).into());
        }
        Ok(LogEvent::builder(Level::Info, METRIC_TOPIC)
            .message(self.metric_name.clone())
            .arg(self.value)
            .arg(self.timestamp.timestamp_millis())
            .tags(self.labels.clone())
            .classify(METRIC_MARKER)
            .build()?)
    }

    fn from_event(event: &LogEvent) -> Option<MetricRecord> {
        if !event.classification().iter().any(|m| m == METRIC_MARKER) {
            return None;
        }
        let value = event.arguments().first()?.as_f64()?;
        let timestamp = event
            .arguments()
            .get(1)
            .and_then(|v| v.as_i64())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(|| event.timestamp());
        Some(MetricRecord {
            timestamp,
            labels: event.context_tags().clone(),
            metric_name: event.message().to_string(),
            value,
        })
    }
}

/// Destination of metric batches.
#[async_trait]
pub trait MetricSink: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn write_metrics(&self, topic: &str, batch: &[MetricRecord]) -> Result<(), AdapterError>;
}

struct MetricBatches<M>(M);

#[async_trait]
impl<M: MetricSink> BatchSink for MetricBatches<M> {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn write_batch(&self, topic: &str, batch: &[LogEvent]) -> Result<(), AdapterError> {
        let records: Vec<MetricRecord> = batch.iter().filter_map(MetricRecord::from_event).collect();
        if records.is_empty() {
            return Ok(());
        }
        self.0.write_metrics(topic, &records).await
    }
}

/// Buffers metric records and writes them to a [`MetricSink`] in batches.
pub struct MetricRecorder<M> {
    batches: BatchingAdapter<MetricBatches<M>>,
}

impl<M: MetricSink> MetricRecorder<M> {
    /// Recorder with a 1000 record buffer, flushed every second.
    pub fn new(sink: M) -> Self {
        MetricRecorder::with_config(
            sink,
            BatchConfig {
                buffer: 1000,
                batch_size: 1000,
                flush_interval: Duration::from_secs(1),
                ..BatchConfig::default()
            },
        )
    }

    pub fn with_config(sink: M, config: BatchConfig) -> Self {
        MetricRecorder {
            batches: BatchingAdapter::new(MetricBatches(sink), config),
        }
    }

    pub fn sink(&self) -> &M {
        &self.batches.sink().0
    }

    /// Records lost because their batch kept failing.
    pub fn lost_records(&self) -> u64 {
        self.batches.lost_events()
    }

    pub async fn start(&self) -> Result<(), AdapterError> {
        self.batches.start().await
    }

    /// Buffer `record`. Fails if the buffer is full, the recorder is not
    /// running, or the value is NaN or infinite.
    pub async fn record(&self, record: MetricRecord) -> Result<(), AdapterError> {
        let event = record.to_event()?;
        self.batches.forward(&event).await
    }

    /// Write everything buffered and wait for the sink.
    pub async fn flush(&self) -> Result<(), AdapterError> {
        self.batches.flush().await
    }

    /// Write what is buffered and stop the writer task.
    pub async fn stop(&self) -> Result<(), AdapterError> {
        self.batches.stop().await
    }
}
