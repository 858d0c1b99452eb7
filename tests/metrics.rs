//! Tests for the metrics module.

use ironload::metrics::{CounterMetric, GaugeMetric, Metric, MetricsCollector};
use ironload::orchestrator::{LoadOrchestrator, WorkerPool};
use ironload::readers::RawStreamReader;
use ironload::testing::*;
use ironload::writers::MemoryWriterFactory;
use serde_json::json;
use std::io::Cursor;
use std::sync::Arc;
use std::thread;

#[test]
fn test_counter_metric() {
    let collector = MetricsCollector::new();
    collector.register(Box::new(CounterMetric::with_value("test_counter", 5)));

    let snapshot = collector.snapshot();
    assert_eq!(snapshot.get("test_counter").unwrap(), &json!(5));
}

#[test]
fn test_gauge_metric() {
    let collector = MetricsCollector::new();
    collector.register(Box::new(
        GaugeMetric::new("test_gauge", 42.5).with_description("Test gauge"),
    ));

    let snapshot = collector.snapshot();
    assert_eq!(snapshot.get("test_gauge").unwrap(), &json!(42.5));
    assert_eq!(
        collector.to_json()["test_gauge"]["description"],
        json!("Test gauge")
    );
}

#[test]
fn test_custom_metric() {
    struct Constant;
    impl Metric for Constant {
        fn name(&self) -> &str {
            "answer"
        }
        fn value(&self) -> serde_json::Value {
            json!(42)
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    let collector = MetricsCollector::new();
    collector.register(Box::new(Constant));
    assert_eq!(collector.snapshot()["answer"], json!(42));
    // Not a counter, so it is replaced.
    collector.increment_counter("answer", 1);
    assert_eq!(collector.counter("answer"), Some(1));
}

#[test]
fn test_counters_from_many_threads() {
    let collector = MetricsCollector::new();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let c = collector.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    c.increment_counter("rows", 1);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(collector.counter("rows"), Some(800));
}

#[test]
fn test_load_records_metrics() -> anyhow::Result<()> {
    let pool = WorkerPool::for_processors(2)?;
    let factory = Arc::new(MemoryWriterFactory::new());
    let metrics = MetricsCollector::new();
    LoadOrchestrator::new(&pool, two_node_config(2), two_node_map(), factory)?
        .with_metrics(metrics.clone())
        .run(RawStreamReader::new(Cursor::new(five_rows().join("\n"))))?;

    assert_eq!(metrics.counter("rows_loaded"), Some(5));
    assert_eq!(metrics.counter("rows_node1"), Some(3));
    assert_eq!(metrics.counter("rows_node2"), Some(2));
    assert_eq!(metrics.counter("loads_committed"), Some(1));
    assert_eq!(metrics.counter("loads_cancelled"), Some(0));
    assert!(metrics.elapsed().is_some());

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("metrics.json");
    metrics.save_to_file(&path)?;
    let saved: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    assert_eq!(saved["rows_loaded"]["value"], json!(5));
    assert!(saved["execution_time_ms"]["value"].is_u64());
    Ok(())
}
