//! Node writers: one destination sink per node per processor.
//!
//! Every writer follows the same lifecycle, enforced by [`Lifecycle`]:
//!
//! ```text
//! Created -> Started -> Finished -> Committed -> Closed
//!                 \          \---> RolledBack -> Closed
//!                  \-> Failed ---> RolledBack -> Closed
//! ```
//!
//! A failing operation moves the writer to `Failed`; from there only
//! `finish(false)`, `rollback` and `close` are accepted.
//!
//! Implementations:
//! - [`ExternalProcessWriter`] pipes rows into a spawned loader process.
//! - [`NativeCopyWriter`] streams rows over a COPY connection.
//! - [`MemoryWriter`] records rows in memory for tests and dry runs.

pub mod copy;
pub mod memory;
pub mod process;

pub use copy::{ConnectionProvider, CopyConnection, NativeCopyFactory, NativeCopyWriter};
pub use memory::{FailPoint, MemoryWriter, MemoryWriterFactory, NodeRecord};
pub use process::{
    CommandTemplate, ExternalProcessWriter, NodeConnectionInfo, ProcessWriterConfig,
    ProcessWriterFactory,
};

use crate::NodeId;
use crate::config::CopyFormat;
use crate::error::{LoadError, Result};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Lifecycle state of a writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriterState {
    Created,
    Started,
    Finished,
    Committed,
    RolledBack,
    Closed,
    Failed,
}

impl WriterState {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            WriterState::Created => "created",
            WriterState::Started => "started",
            WriterState::Finished => "finished",
            WriterState::Committed => "committed",
            WriterState::RolledBack => "rolled back",
            WriterState::Closed => "closed",
            WriterState::Failed => "failed",
        }
    }
}

/// State machine shared by all writer implementations.
#[derive(Debug)]
pub struct Lifecycle {
    node: NodeId,
    state: WriterState,
}

impl Lifecycle {
    #[must_use]
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            state: WriterState::Created,
        }
    }

    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    #[must_use]
    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Fail with [`LoadError::InvalidState`] unless the current state is one
    /// of `allowed`.
    ///
    /// # Errors
    /// The operation is not legal in the current state.
    pub fn expect(&self, op: &'static str, allowed: &[WriterState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(LoadError::InvalidState {
                node: self.node,
                op,
                state: self.state.name(),
            })
        }
    }

    pub fn advance(&mut self, to: WriterState) {
        self.state = to;
    }

    /// Pass `result` through, moving to `Failed` on error.
    ///
    /// # Errors
    /// Whatever `result` holds.
    pub fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.state = WriterState::Failed;
        }
        result
    }

    pub(crate) fn check_start(&self) -> Result<()> {
        self.expect("start", &[WriterState::Created])
    }

    pub(crate) fn check_write(&self) -> Result<()> {
        self.expect("write", &[WriterState::Started])
    }

    pub(crate) fn check_finish(&self) -> Result<()> {
        self.expect("finish", &[WriterState::Started, WriterState::Failed])
    }

    pub(crate) fn check_commit(&self) -> Result<()> {
        self.expect("commit", &[WriterState::Finished])
    }

    pub(crate) fn check_rollback(&self) -> Result<()> {
        self.expect(
            "rollback",
            &[
                WriterState::Created,
                WriterState::Started,
                WriterState::Finished,
                WriterState::Failed,
            ],
        )
    }

    /// State to enter after `finish`: `Failed` stays `Failed`.
    pub(crate) fn finished(&mut self) {
        if self.state != WriterState::Failed {
            self.state = WriterState::Finished;
        }
    }
}

/// A sink for the rows of one node.
pub trait NodeWriter: Send {
    fn node(&self) -> NodeId;

    fn state(&self) -> WriterState;

    /// Open the sink. Called once before any row flows.
    ///
    /// # Errors
    /// The sink could not be opened.
    fn start(&mut self) -> Result<()>;

    /// Write one encoded row, without terminator.
    ///
    /// # Errors
    /// The sink rejected the row or went away.
    fn write_row(&mut self, row: &[u8]) -> Result<()>;

    /// End the stream. `success = false` abandons whatever was sent.
    ///
    /// # Errors
    /// The sink reported a failure while completing.
    fn finish(&mut self, success: bool) -> Result<()>;

    /// Make the written rows durable.
    ///
    /// # Errors
    /// The sink failed to commit, or the writer is not finished.
    fn commit(&mut self) -> Result<()>;

    /// Discard the written rows.
    ///
    /// # Errors
    /// The sink failed to roll back.
    fn rollback(&mut self) -> Result<()>;

    /// Release every resource. Never fails; safe to call twice.
    fn close(&mut self);

    fn rows_written(&self) -> u64;
}

/// What writers write into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SinkTarget {
    pub table: String,
    /// Output columns in row order.
    pub columns: Vec<String>,
    pub format: CopyFormat,
}

impl SinkTarget {
    pub fn new(table: impl Into<String>, columns: Vec<String>, format: CopyFormat) -> Self {
        Self {
            table: table.into(),
            columns,
            format,
        }
    }

    /// Column list as `a, b, c`.
    #[must_use]
    pub fn column_list(&self) -> String {
        self.columns.join(", ")
    }

    /// `COPY` statement reading this target's rows from stdin.
    #[must_use]
    pub fn copy_statement(&self) -> String {
        let quote_literal = |s: &str| format!("'{}'", s.replace('\'', "''"));
        let mut options = vec![
            format!(
                "FORMAT {}",
                if self.format.is_csv() { "csv" } else { "text" }
            ),
            format!("DELIMITER {}", quote_literal(&self.format.delimiter.to_string())),
            format!("NULL {}", quote_literal(&self.format.null_marker)),
        ];
        if let Some(csv) = &self.format.csv {
            options.push(format!("QUOTE {}", quote_literal(&csv.quote.to_string())));
            options.push(format!("ESCAPE {}", quote_literal(&csv.escape.to_string())));
        }
        format!(
            "COPY {} ({}) FROM STDIN WITH ({})",
            self.table,
            self.column_list(),
            options.join(", ")
        )
    }
}

/// Builds writers for a load.
pub trait WriterFactory: Send + Sync {
    /// A fresh writer for `node`, used by processor `processor`.
    ///
    /// # Errors
    /// The node is unknown to the factory or its settings are invalid.
    fn create(
        &self,
        node: NodeId,
        processor: usize,
        target: &SinkTarget,
    ) -> Result<Box<dyn NodeWriter>>;
}

/// The writers owned by one processor, keyed by node.
pub struct WriterSet {
    writers: BTreeMap<NodeId, Box<dyn NodeWriter>>,
}

impl WriterSet {
    /// One writer per node.
    ///
    /// # Errors
    /// [`LoadError::DuplicateNode`] when `nodes` repeats an id, or any error
    /// from the factory. Writers built so far are closed.
    pub fn build(
        nodes: &[NodeId],
        processor: usize,
        target: &SinkTarget,
        factory: &dyn WriterFactory,
    ) -> Result<Self> {
        let mut set = Self {
            writers: BTreeMap::new(),
        };
        for &node in nodes {
            if set.writers.contains_key(&node) {
                set.close_all();
                return Err(LoadError::DuplicateNode(node));
            }
            match factory.create(node, processor, target) {
                Ok(w) => {
                    set.writers.insert(node, w);
                }
                Err(e) => {
                    set.close_all();
                    return Err(e);
                }
            }
        }
        Ok(set)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.writers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }

    /// Start every writer, stopping at the first failure.
    ///
    /// # Errors
    /// The first writer that failed to start.
    pub fn start_all(&mut self) -> Result<()> {
        for (node, w) in &mut self.writers {
            debug!(node = %node, "starting writer");
            w.start()?;
        }
        Ok(())
    }

    /// Write one row to `node`'s writer.
    ///
    /// # Errors
    /// [`LoadError::UnknownNode`] when no writer exists for `node`, or the
    /// writer's own failure.
    pub fn write(&mut self, node: NodeId, row: &[u8]) -> Result<()> {
        self.writers
            .get_mut(&node)
            .ok_or(LoadError::UnknownNode(node))?
            .write_row(row)
    }

    /// Finish every writer, even after a failure. Returns the first error.
    ///
    /// # Errors
    /// The first writer that failed to finish.
    pub fn finish_all(&mut self, success: bool) -> Result<()> {
        self.each("finish", |w| w.finish(success))
    }

    /// # Errors
    /// The first writer that failed to commit.
    pub fn commit_all(&mut self) -> Result<()> {
        self.each("commit", |w| w.commit())
    }

    /// # Errors
    /// The first writer that failed to roll back.
    pub fn rollback_all(&mut self) -> Result<()> {
        self.each("rollback", |w| w.rollback())
    }

    pub fn close_all(&mut self) {
        for w in self.writers.values_mut() {
            w.close();
        }
    }

    fn each(
        &mut self,
        op: &str,
        mut f: impl FnMut(&mut dyn NodeWriter) -> Result<()>,
    ) -> Result<()> {
        let mut first = None;
        for (node, w) in &mut self.writers {
            if let Err(e) = f(w.as_mut()) {
                warn!(node = %node, error = %e, "{op} failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Rows written per node by this set.
    #[must_use]
    pub fn rows_per_node(&self) -> BTreeMap<NodeId, u64> {
        self.writers
            .iter()
            .map(|(node, w)| (*node, w.rows_written()))
            .collect()
    }

    /// Current state of every writer.
    #[must_use]
    pub fn states(&self) -> BTreeMap<NodeId, WriterState> {
        self.writers
            .iter()
            .map(|(node, w)| (*node, w.state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const N1: NodeId = NodeId::new(1);
    const N2: NodeId = NodeId::new(2);

    fn target() -> SinkTarget {
        SinkTarget::new("t", vec!["a".into(), "b".into()], CopyFormat::text('|'))
    }

    #[test]
    fn lifecycle_rejects_illegal_transitions() {
        let mut l = Lifecycle::new(N1);
        assert!(l.check_write().is_err());
        l.check_start().unwrap();
        l.advance(WriterState::Started);
        assert!(l.check_commit().is_err());
        let r: Result<()> = l.track(Err(LoadError::sink(N1, "boom")));
        assert!(r.is_err());
        assert_eq!(l.state(), WriterState::Failed);
        l.finished();
        assert_eq!(l.state(), WriterState::Failed);
        assert!(matches!(
            l.check_commit(),
            Err(LoadError::InvalidState { op: "commit", state: "failed", .. })
        ));
        l.check_rollback().unwrap();
    }

    #[test]
    fn duplicate_nodes_fail_construction() {
        let factory = MemoryWriterFactory::new();
        let err = WriterSet::build(&[N1, N2, N1], 0, &target(), &factory);
        assert!(matches!(err, Err(LoadError::DuplicateNode(n)) if n == N1));
    }

    #[test]
    fn unknown_node_is_reported() {
        let factory = MemoryWriterFactory::new();
        let mut set = WriterSet::build(&[N1], 0, &target(), &factory).unwrap();
        set.start_all().unwrap();
        assert!(matches!(
            set.write(N2, b"x"),
            Err(LoadError::UnknownNode(n)) if n == N2
        ));
        set.write(N1, b"x").unwrap();
        assert_eq!(set.rows_per_node()[&N1], 1);
    }

    #[test]
    fn finish_visits_every_writer() {
        let factory = MemoryWriterFactory::new().fail_on(N1, FailPoint::Finish);
        let mut set = WriterSet::build(&[N1, N2], 0, &target(), &factory).unwrap();
        set.start_all().unwrap();
        assert!(set.finish_all(true).is_err());
        assert_eq!(set.states()[&N2], WriterState::Finished);
        set.rollback_all().unwrap();
        set.close_all();
        assert_eq!(factory.record(N2).rollbacks, 1);
    }

    #[test]
    fn copy_statement_quotes_options() {
        let t = SinkTarget::new("t", vec!["a".into()], CopyFormat::csv(',').with_null_marker("'"));
        assert_eq!(
            t.copy_statement(),
            "COPY t (a) FROM STDIN WITH (FORMAT csv, DELIMITER ',', NULL '''', QUOTE '\"', ESCAPE '\"')"
        );
    }
}
