//! Load orchestration: one reader, M processors, one writer per node per
//! processor, and an all-or-nothing finish.
//!
//! ```text
//!            +------------+      +-----------+     +------------------+
//!  source -->| RowReader  |----->| RowBuffer |---->| RowProcessor x M |--> WriterSet x M
//!            +------------+      +-----------+     +------------------+
//! ```
//!
//! The reader and processors run as tasks on an explicitly owned
//! [`WorkerPool`]. When every task is done, [`finish_load`] finishes all
//! writers and then either commits all of them or rolls all of them back.

use crate::NodeId;
use crate::config::LoadConfig;
use crate::error::{LoadError, Result};
use crate::generated::{DefaultEvaluator, GeneratedValueProvider, Generators};
use crate::metrics::MetricsCollector;
use crate::processor::{ColumnPlan, ParserKind, ProcessorReport, RowProcessor};
use crate::readers::{RowReader, run_reader};
use crate::routing::{PartitionMap, Router, distinct_nodes};
use crate::row::Row;
use crate::row_buffer::RowBuffer;
use crate::writers::{SinkTarget, WriterFactory, WriterSet};
use chrono::Local;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Threads for readers and processors.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
}

impl WorkerPool {
    /// A pool of exactly `threads` workers.
    ///
    /// # Errors
    /// Zero threads or a pool that cannot be built.
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(LoadError::Capacity("worker pool needs at least one thread".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("ironload-worker-{i}"))
            .build()
            .map_err(|e| LoadError::Capacity(format!("cannot build worker pool: {e}")))?;
        Ok(Self { pool })
    }

    /// A pool sized for `processors` processors plus the reader.
    ///
    /// # Errors
    /// See [`WorkerPool::new`].
    pub fn for_processors(processors: usize) -> Result<Self> {
        Self::new(processors + 1)
    }

    #[must_use]
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

/// Stops a running load from another thread.
#[derive(Clone)]
pub struct CancelHandle {
    requested: Arc<AtomicBool>,
    buffer: Arc<RowBuffer<Row>>,
}

impl CancelHandle {
    /// Cancel the load. Queued rows are dropped and every writer is rolled
    /// back; the load still returns a report.
    pub fn cancel(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.buffer.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Outcome of a load that did not fail.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub rows_loaded: u64,
    pub rows_per_node: BTreeMap<NodeId, u64>,
    pub max_serial: Option<i64>,
    pub max_row_id: Option<i64>,
    pub committed: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// Runs one load.
pub struct LoadOrchestrator<'p> {
    pool: &'p WorkerPool,
    config: LoadConfig,
    partition_map: Arc<dyn PartitionMap>,
    writer_factory: Arc<dyn WriterFactory>,
    generators: Generators,
    metrics: Option<MetricsCollector>,
    buffer: Arc<RowBuffer<Row>>,
    cancel: CancelHandle,
}

impl<'p> LoadOrchestrator<'p> {
    /// # Errors
    /// An invalid configuration.
    pub fn new(
        pool: &'p WorkerPool,
        config: LoadConfig,
        partition_map: Arc<dyn PartitionMap>,
        writer_factory: Arc<dyn WriterFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let buffer = Arc::new(RowBuffer::new(config.buffer_capacity)?);
        let cancel = CancelHandle {
            requested: Arc::new(AtomicBool::new(false)),
            buffer: Arc::clone(&buffer),
        };
        Ok(Self {
            pool,
            config,
            partition_map,
            writer_factory,
            generators: Generators::default(),
            metrics: None,
            buffer,
            cancel,
        })
    }

    #[must_use]
    pub fn with_serial(mut self, provider: Arc<dyn GeneratedValueProvider>) -> Self {
        self.generators.serial = Some(provider);
        self
    }

    #[must_use]
    pub fn with_row_id(mut self, provider: Arc<dyn GeneratedValueProvider>) -> Self {
        self.generators.row_id = Some(provider);
        self
    }

    #[must_use]
    pub fn with_default_evaluator(mut self, evaluator: Arc<dyn DefaultEvaluator>) -> Self {
        self.generators.evaluator = Some(evaluator);
        self
    }

    /// Record load counters into `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Handle for cancelling this load from another thread.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run the load to completion.
    ///
    /// # Errors
    /// Setup failures, the first reader/processor/writer error (after every
    /// writer was rolled back), or a failure to commit.
    pub fn run<R: RowReader>(self, mut reader: R) -> Result<LoadReport> {
        let started = Instant::now();
        if let Some(m) = &self.metrics {
            m.record_start();
        }

        let kind = ParserKind::select(reader.row_kind(), &self.config.format);
        let mut processors = self.config.processors;
        if kind == ParserKind::Csv && processors > 1 {
            warn!(processors, "CSV records may span rows; using a single processor");
            processors = 1;
        }
        if self.pool.threads() < processors + 1 {
            return Err(LoadError::Capacity(format!(
                "{processors} processors need {} worker threads, pool has {}",
                processors + 1,
                self.pool.threads()
            )));
        }

        let plan = ColumnPlan::build(&self.config, &self.generators, Local::now())?;
        let router = Router::new(
            &self.config.partitioning,
            &self.config.layout,
            Arc::clone(&self.partition_map),
        )?;
        let nodes = self.partition_map.nodes();
        distinct_nodes(&nodes)?;
        let target = SinkTarget::new(
            self.config.layout.table.clone(),
            plan.output_columns().to_vec(),
            self.config.format.clone(),
        );

        let mut sets: Vec<WriterSet> = Vec::with_capacity(processors);
        for p in 0..processors {
            match WriterSet::build(&nodes, p, &target, self.writer_factory.as_ref()) {
                Ok(set) => sets.push(set),
                Err(e) => {
                    sets.iter_mut().for_each(WriterSet::close_all);
                    return Err(e);
                }
            }
        }
        if let Err(e) = sets.iter_mut().try_for_each(WriterSet::start_all) {
            error!(error = %e, "writer start failed");
            let _ = finish_load(&mut sets, false);
            return Err(e);
        }
        info!(
            table = %self.config.layout.table,
            nodes = nodes.len(),
            processors,
            "load started"
        );

        let buffer = self.buffer.as_ref();
        let mut reader_result: Option<Result<u64>> = None;
        let mut results: Vec<Option<Result<ProcessorReport>>> =
            (0..processors).map(|_| None).collect();
        let (plan, router, format) = (&plan, &router, &self.config.format);
        let progress = self.config.progress_interval;

        self.pool.pool.scope(|s| {
            let reader = &mut reader;
            let slot = &mut reader_result;
            s.spawn(move |_| {
                let r = run_reader(reader, buffer);
                if let Err(e) = &r
                    && !e.is_cancelled()
                {
                    buffer.cancel();
                }
                *slot = Some(r);
            });
            for (index, (set, slot)) in sets.iter_mut().zip(results.iter_mut()).enumerate() {
                s.spawn(move |_| {
                    let mut consumer = buffer.consumer();
                    let mut processor = RowProcessor::new(index, kind, format, plan, router)
                        .with_progress_interval(progress);
                    let r = processor.load_data(&mut consumer, set);
                    if let Err(e) = &r {
                        error!(processor = index, error = %e, "processor failed");
                        buffer.cancel();
                    }
                    *slot = Some(r);
                });
            }
        });

        let mut failure: Option<LoadError> = None;
        let mut total = ProcessorReport::default();
        match reader_result {
            Some(Err(e)) if !e.is_cancelled() => failure = Some(e),
            None => failure = Some(LoadError::Cancelled),
            _ => {}
        }
        for r in results.into_iter().flatten() {
            match r {
                Ok(report) => total.merge(&report),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        let cancelled = self.cancel.is_cancelled();
        let success = failure.is_none() && !cancelled;

        let finished = finish_load(&mut sets, success);
        if let Some(e) = failure {
            if let Err(fe) = finished {
                warn!(error = %fe, "rollback after failure also failed");
            }
            return Err(e);
        }
        let committed = finished?;

        if committed {
            if let (Some(p), Some(max)) = (&self.generators.serial, total.max_serial) {
                p.observe_max(max);
            }
            if let (Some(p), Some(max)) = (&self.generators.row_id, total.max_row_id) {
                p.observe_max(max);
            }
        }
        let report = LoadReport {
            rows_loaded: if committed { total.rows } else { 0 },
            rows_per_node: total.rows_per_node,
            max_serial: total.max_serial,
            max_row_id: total.max_row_id,
            committed,
            cancelled,
            elapsed: started.elapsed(),
        };
        if let Some(m) = &self.metrics {
            m.record_end();
            m.record_load(&report);
        }
        info!(
            rows = report.rows_loaded,
            committed,
            cancelled,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "load finished"
        );
        Ok(report)
    }
}

/// Finish every writer, then commit all of them if everything succeeded or
/// roll all of them back otherwise. Every writer is closed either way.
///
/// Returns whether the load was committed.
///
/// # Errors
/// The first finish, commit or rollback failure.
pub fn finish_load(sets: &mut [WriterSet], success: bool) -> Result<bool> {
    let mut first: Option<LoadError> = None;
    for set in sets.iter_mut() {
        if let Err(e) = set.finish_all(success) {
            first.get_or_insert(e);
        }
    }
    let commit = success && first.is_none();
    if commit {
        for set in sets.iter_mut() {
            if let Err(e) = set.commit_all() {
                first.get_or_insert(e);
            }
        }
    }
    if !commit || first.is_some() {
        for set in sets.iter_mut() {
            if let Err(e) = set.rollback_all() {
                warn!(error = %e, "rollback failed");
                first.get_or_insert(e);
            }
        }
    }
    for set in sets.iter_mut() {
        set.close_all();
    }
    match first {
        Some(e) => Err(e),
        None => Ok(commit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CopyFormat, Partitioning};
    use crate::routing::StaticPartitionMap;
    use crate::row::{ColumnDescriptor, TableLayout};
    use crate::testing::VecResultSet;
    use crate::readers::ResultSetReader;
    use crate::writers::{FailPoint, MemoryWriterFactory, WriterState};

    const N1: NodeId = NodeId::new(1);
    const N2: NodeId = NodeId::new(2);

    fn config(processors: usize) -> LoadConfig {
        LoadConfig::new(
            TableLayout::new("t", vec![ColumnDescriptor::new("k"), ColumnDescriptor::new("v")]),
            CopyFormat::text('|'),
            Partitioning::Column { name: "k".into() },
        )
        .with_processors(processors)
        .with_buffer_capacity(2)
    }

    fn map() -> Arc<dyn PartitionMap> {
        Arc::new(StaticPartitionMap::new([N1, N2]).assign(["a"], N1).assign(["b"], N2))
    }

    fn rows(n: usize) -> VecResultSet {
        VecResultSet::new(
            (0..n)
                .map(|i| vec![Some(if i % 2 == 0 { "a" } else { "b" }.into()), Some(i.to_string())])
                .collect(),
        )
    }

    #[test]
    fn pool_must_cover_processors_and_reader() {
        let pool = WorkerPool::new(2).unwrap();
        let factory = Arc::new(MemoryWriterFactory::new());
        let orch = LoadOrchestrator::new(&pool, config(2), map(), factory).unwrap();
        let err = orch.run(ResultSetReader::new(rows(1))).unwrap_err();
        assert!(matches!(err, LoadError::Capacity(_)));
    }

    #[test]
    fn rows_spread_over_processors_and_commit() {
        let pool = WorkerPool::for_processors(3).unwrap();
        let factory = Arc::new(MemoryWriterFactory::new());
        let orch = LoadOrchestrator::new(&pool, config(3), map(), factory.clone()).unwrap();
        let report = orch.run(ResultSetReader::new(rows(100))).unwrap();
        assert!(report.committed);
        assert_eq!(report.rows_loaded, 100);
        assert_eq!(report.rows_per_node[&N1], 50);
        assert_eq!(factory.record(N1).committed.len(), 50);
        assert_eq!(factory.record(N2).writers, 3);
        assert_eq!(factory.record(N2).closes, 3);
    }

    #[test]
    fn write_failure_rolls_back_every_node() {
        let pool = WorkerPool::for_processors(2).unwrap();
        let factory = Arc::new(MemoryWriterFactory::new().fail_on(N2, FailPoint::Write { after: 3 }));
        let orch = LoadOrchestrator::new(&pool, config(2), map(), factory.clone()).unwrap();
        let err = orch.run(ResultSetReader::new(rows(200))).unwrap_err();
        assert!(matches!(err, LoadError::Sink { node, .. } if node == N2));
        for node in [N1, N2] {
            let rec = factory.record(node);
            assert!(rec.committed.is_empty());
            assert_eq!(rec.rollbacks, 2);
            assert_eq!(rec.closes, 2);
        }
    }

    #[test]
    fn finish_load_rolls_back_on_finish_failure() {
        let factory = MemoryWriterFactory::new().fail_on(N2, FailPoint::Finish);
        let target = SinkTarget::new("t", vec!["k".into()], CopyFormat::default());
        let mut sets = vec![WriterSet::build(&[N1, N2], 0, &target, &factory).unwrap()];
        sets[0].start_all().unwrap();
        sets[0].write(N1, b"a").unwrap();
        assert!(finish_load(&mut sets, true).is_err());
        assert!(factory.record(N1).committed.is_empty());
        assert_eq!(sets[0].states()[&N1], WriterState::Closed);
    }

    #[test]
    fn failed_rollback_is_reported() {
        let factory = MemoryWriterFactory::new().fail_on(N2, FailPoint::Rollback);
        let target = SinkTarget::new("t", vec!["k".into()], CopyFormat::default());
        let mut sets = vec![WriterSet::build(&[N1, N2], 0, &target, &factory).unwrap()];
        sets[0].start_all().unwrap();
        sets[0].write(N2, b"a").unwrap();
        let err = finish_load(&mut sets, false).unwrap_err();
        assert!(matches!(err, LoadError::Sink { node, .. } if node == N2));
        assert_eq!(factory.record(N1).rollbacks, 1);
        assert_eq!(sets[0].states()[&N2], WriterState::Closed);
    }

    #[test]
    fn cancel_before_run_reports_cancelled() {
        let pool = WorkerPool::for_processors(1).unwrap();
        let factory = Arc::new(MemoryWriterFactory::new());
        let orch = LoadOrchestrator::new(&pool, config(1), map(), factory.clone()).unwrap();
        orch.cancel_handle().cancel();
        let report = orch.run(ResultSetReader::new(rows(10))).unwrap();
        assert!(report.cancelled);
        assert!(!report.committed);
        assert_eq!(factory.record(N1).rollbacks, 1);
    }
}
