//! Metrics collection and reporting for loads.
//!
//! A [`MetricsCollector`] is a cheap, cloneable handle to a shared set of
//! named metrics. Attach one to a [`LoadOrchestrator`] or a
//! [`BulkLoader`] and it receives the run's counters when the run ends;
//! register your own [`Metric`]s alongside them.
//!
//! ```no_run
//! use ironload::metrics::MetricsCollector;
//!
//! # fn main() -> ironload::Result<()> {
//! let metrics = MetricsCollector::new();
//! metrics.increment_counter("files_scanned", 3);
//! metrics.print();
//! metrics.save_to_file("metrics.json")?;
//! # Ok(())
//! # }
//! ```
//!
//! [`LoadOrchestrator`]: crate::orchestrator::LoadOrchestrator
//! [`BulkLoader`]: crate::chunk_retry::BulkLoader

use crate::chunk_retry::BulkLoadSummary;
use crate::error::Result;
use crate::orchestrator::LoadReport;
use serde_json::{Value, json};
use std::any::Any;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// A named value reported with the load summary.
pub trait Metric: Send + Sync + Any {
    fn name(&self) -> &str;

    /// Current value as JSON.
    fn value(&self) -> Value;

    fn description(&self) -> Option<&str> {
        None
    }

    /// Cast to Any for downcasting.
    fn as_any(&self) -> &dyn Any;
}

/// Thread-safe container of metrics.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsCollectorInner>>,
}

#[derive(Default)]
struct MetricsCollectorInner {
    metrics: BTreeMap<String, Box<dyn Metric>>,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MetricsCollectorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a metric, replacing one with the same name.
    pub fn register(&self, metric: Box<dyn Metric>) {
        self.lock().metrics.insert(metric.name().to_string(), metric);
    }

    pub fn record_start(&self) {
        self.lock().start_time = Some(Instant::now());
    }

    pub fn record_end(&self) {
        self.lock().end_time = Some(Instant::now());
    }

    /// Time between [`record_start`](Self::record_start) and
    /// [`record_end`](Self::record_end).
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        let inner = self.lock();
        match (inner.start_time, inner.end_time) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }

    /// Add `value` to a counter, creating it when missing. A non-counter
    /// metric with that name is replaced.
    pub fn increment_counter(&self, name: &str, value: u64) {
        let mut inner = self.lock();
        if let Some(counter) = inner
            .metrics
            .get(name)
            .and_then(|m| m.as_any().downcast_ref::<CounterMetric>())
        {
            counter.add(value);
            return;
        }
        inner.metrics.insert(
            name.to_string(),
            Box::new(CounterMetric::with_value(name, value)),
        );
    }

    /// Set a gauge, creating or replacing it.
    pub fn set_gauge(&self, name: &str, value: f64) {
        self.register(Box::new(GaugeMetric::new(name, value)));
    }

    /// Value of a counter, if one with that name exists.
    #[must_use]
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.lock()
            .metrics
            .get(name)
            .and_then(|m| m.as_any().downcast_ref::<CounterMetric>())
            .map(CounterMetric::get)
    }

    /// Counters of a finished parallel load.
    pub fn record_load(&self, report: &LoadReport) {
        self.increment_counter("rows_loaded", report.rows_loaded);
        for (node, rows) in &report.rows_per_node {
            self.increment_counter(&format!("rows_{node}"), *rows);
        }
        self.increment_counter("loads_committed", u64::from(report.committed));
        self.increment_counter("loads_cancelled", u64::from(report.cancelled));
    }

    /// Counters of a finished client bulk load.
    pub fn record_bulk_load(&self, summary: &BulkLoadSummary) {
        self.increment_counter("rows_sent", summary.rows_sent);
        self.increment_counter("rows_loaded", summary.rows_loaded);
        self.increment_counter("rows_rejected", summary.rejected_rows);
        self.increment_counter("chunks", summary.chunks);
        self.increment_counter("chunk_submissions", summary.submissions);
        self.increment_counter("chunks_rejected", summary.rejected_chunks);
    }

    /// Current value of every metric by name.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.lock()
            .metrics
            .iter()
            .map(|(name, metric)| (name.clone(), metric.value()))
            .collect()
    }

    /// All metrics as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let inner = self.lock();
        let mut metrics_json = serde_json::Map::new();
        for (name, metric) in &inner.metrics {
            let mut metric_obj = serde_json::Map::new();
            metric_obj.insert("value".to_string(), metric.value());
            if let Some(desc) = metric.description() {
                metric_obj.insert("description".to_string(), json!(desc));
            }
            metrics_json.insert(name.clone(), Value::Object(metric_obj));
        }
        if let (Some(start), Some(end)) = (inner.start_time, inner.end_time) {
            metrics_json.insert(
                "execution_time_ms".to_string(),
                json!({
                    "value": end.duration_since(start).as_millis() as u64,
                    "description": "Total load time in milliseconds",
                }),
            );
        }
        Value::Object(metrics_json)
    }

    /// Print all metrics to stdout.
    pub fn print(&self) {
        println!("\n========== Load Metrics ==========");
        if let Some(elapsed) = self.elapsed() {
            println!(
                "Execution Time: {:.3}s ({} ms)",
                elapsed.as_secs_f64(),
                elapsed.as_millis()
            );
            println!("----------------------------------");
        }
        let inner = self.lock();
        for (name, metric) in &inner.metrics {
            match metric.description() {
                Some(desc) => println!("{name}: {} ({desc})", metric.value()),
                None => println!("{name}: {}", metric.value()),
            }
        }
        drop(inner);
        println!("==================================\n");
    }

    /// Write all metrics to `path` as pretty JSON.
    ///
    /// # Errors
    /// The file cannot be created or written.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let formatted = serde_json::to_string_pretty(&self.to_json())?;
        let mut file = File::create(path)?;
        file.write_all(formatted.as_bytes())?;
        Ok(())
    }
}

/// Monotonic counter.
pub struct CounterMetric {
    name: String,
    count: AtomicU64,
}

impl CounterMetric {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_value(name, 0)
    }

    pub fn with_value(name: impl Into<String>, count: u64) -> Self {
        Self {
            name: name.into(),
            count: AtomicU64::new(count),
        }
    }

    pub fn add(&self, value: u64) {
        self.count.fetch_add(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Metric for CounterMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.get())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A single numeric value.
pub struct GaugeMetric {
    name: String,
    value: f64,
    description: Option<String>,
}

impl GaugeMetric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl Metric for GaugeMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.value)
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeId;

    #[test]
    fn counters_accumulate() {
        let m = MetricsCollector::new();
        m.increment_counter("rows", 2);
        m.increment_counter("rows", 3);
        assert_eq!(m.counter("rows"), Some(5));
        m.set_gauge("rows", 1.5);
        assert_eq!(m.counter("rows"), None);
        m.increment_counter("rows", 1);
        assert_eq!(m.counter("rows"), Some(1));
    }

    #[test]
    fn load_reports_become_counters() {
        let m = MetricsCollector::new();
        let report = LoadReport {
            rows_loaded: 5,
            rows_per_node: BTreeMap::from([(NodeId::new(1), 3), (NodeId::new(2), 2)]),
            committed: true,
            ..Default::default()
        };
        m.record_load(&report);
        assert_eq!(m.counter("rows_loaded"), Some(5));
        assert_eq!(m.counter("rows_node2"), Some(2));
        assert_eq!(m.counter("loads_committed"), Some(1));
    }

    #[test]
    fn json_snapshot_round_trips_to_file() {
        let m = MetricsCollector::new();
        m.register(Box::new(GaugeMetric::new("ratio", 0.5).with_description("share")));
        m.record_start();
        m.record_end();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        m.save_to_file(&path).unwrap();
        let v: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(v["ratio"]["value"], json!(0.5));
        assert_eq!(v["ratio"]["description"], json!("share"));
        assert!(v.get("execution_time_ms").is_some());
    }
}
