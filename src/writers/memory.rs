//! In-memory writers for tests and dry runs.

use super::{Lifecycle, NodeWriter, SinkTarget, WriterFactory, WriterState};
use crate::NodeId;
use crate::error::{LoadError, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Where an injected failure fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailPoint {
    Start,
    /// Fail the write after this many rows were accepted.
    Write { after: u64 },
    Finish,
    Commit,
    Rollback,
}

/// Everything the writers of one node did, across processors.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeRecord {
    /// Rows made durable by a commit, in commit order.
    pub committed: Vec<Vec<u8>>,
    pub writers: u32,
    pub starts: u32,
    pub commits: u32,
    pub rollbacks: u32,
    pub closes: u32,
}

impl NodeRecord {
    /// Committed rows as UTF-8 strings.
    #[must_use]
    pub fn committed_strings(&self) -> Vec<String> {
        self.committed
            .iter()
            .map(|r| String::from_utf8_lossy(r).into_owned())
            .collect()
    }
}

type Shared = Arc<Mutex<BTreeMap<NodeId, NodeRecord>>>;

fn lock(shared: &Shared) -> MutexGuard<'_, BTreeMap<NodeId, NodeRecord>> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds [`MemoryWriter`]s that report into one shared record per node.
#[derive(Clone, Default)]
pub struct MemoryWriterFactory {
    records: Shared,
    failures: BTreeMap<NodeId, FailPoint>,
}

impl MemoryWriterFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every writer for `node` fail at `point`.
    #[must_use]
    pub fn fail_on(mut self, node: NodeId, point: FailPoint) -> Self {
        self.failures.insert(node, point);
        self
    }

    /// Snapshot of what happened on `node`.
    #[must_use]
    pub fn record(&self, node: NodeId) -> NodeRecord {
        lock(&self.records).get(&node).cloned().unwrap_or_default()
    }

    /// Committed rows of every node, sorted within each node.
    #[must_use]
    pub fn committed_sorted(&self) -> BTreeMap<NodeId, Vec<String>> {
        lock(&self.records)
            .iter()
            .map(|(node, rec)| {
                let mut rows = rec.committed_strings();
                rows.sort();
                (*node, rows)
            })
            .collect()
    }
}

impl WriterFactory for MemoryWriterFactory {
    fn create(
        &self,
        node: NodeId,
        _processor: usize,
        _target: &SinkTarget,
    ) -> Result<Box<dyn NodeWriter>> {
        lock(&self.records).entry(node).or_default().writers += 1;
        Ok(Box::new(MemoryWriter {
            lifecycle: Lifecycle::new(node),
            pending: Vec::new(),
            rows: 0,
            fail: self.failures.get(&node).copied(),
            records: Arc::clone(&self.records),
        }))
    }
}

/// Writer that keeps rows in memory until commit.
pub struct MemoryWriter {
    lifecycle: Lifecycle,
    pending: Vec<Vec<u8>>,
    rows: u64,
    fail: Option<FailPoint>,
    records: Shared,
}

impl MemoryWriter {
    fn injected(&self, what: &str) -> LoadError {
        LoadError::sink(self.lifecycle.node(), format!("injected {what} failure"))
    }

    fn update(&self, f: impl FnOnce(&mut NodeRecord)) {
        f(lock(&self.records).entry(self.lifecycle.node()).or_default());
    }
}

impl NodeWriter for MemoryWriter {
    fn node(&self) -> NodeId {
        self.lifecycle.node()
    }

    fn state(&self) -> WriterState {
        self.lifecycle.state()
    }

    fn start(&mut self) -> Result<()> {
        self.lifecycle.check_start()?;
        self.update(|r| r.starts += 1);
        if self.fail == Some(FailPoint::Start) {
            let err = self.injected("start");
            return self.lifecycle.track(Err(err));
        }
        self.lifecycle.advance(WriterState::Started);
        Ok(())
    }

    fn write_row(&mut self, row: &[u8]) -> Result<()> {
        self.lifecycle.check_write()?;
        if let Some(FailPoint::Write { after }) = self.fail
            && self.rows >= after
        {
            let err = self.injected("write");
            return self.lifecycle.track(Err(err));
        }
        self.pending.push(row.to_vec());
        self.rows += 1;
        Ok(())
    }

    fn finish(&mut self, success: bool) -> Result<()> {
        self.lifecycle.check_finish()?;
        if success && self.fail == Some(FailPoint::Finish) {
            let err = self.injected("finish");
            return self.lifecycle.track(Err(err));
        }
        self.lifecycle.finished();
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.lifecycle.check_commit()?;
        if self.fail == Some(FailPoint::Commit) {
            let err = self.injected("commit");
            return self.lifecycle.track(Err(err));
        }
        let rows = std::mem::take(&mut self.pending);
        self.update(|r| {
            r.committed.extend(rows);
            r.commits += 1;
        });
        self.lifecycle.advance(WriterState::Committed);
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.lifecycle.check_rollback()?;
        if self.fail == Some(FailPoint::Rollback) {
            let err = self.injected("rollback");
            return self.lifecycle.track(Err(err));
        }
        self.pending.clear();
        self.update(|r| r.rollbacks += 1);
        self.lifecycle.advance(WriterState::RolledBack);
        Ok(())
    }

    fn close(&mut self) {
        if self.lifecycle.state() != WriterState::Closed {
            self.update(|r| r.closes += 1);
            self.lifecycle.advance(WriterState::Closed);
        }
    }

    fn rows_written(&self) -> u64 {
        self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CopyFormat;

    const N1: NodeId = NodeId::new(1);

    fn writer(factory: &MemoryWriterFactory) -> Box<dyn NodeWriter> {
        let target = SinkTarget::new("t", vec!["a".into()], CopyFormat::default());
        factory.create(N1, 0, &target).unwrap()
    }

    #[test]
    fn commit_publishes_rows() {
        let factory = MemoryWriterFactory::new();
        let mut w = writer(&factory);
        w.start().unwrap();
        w.write_row(b"r1").unwrap();
        w.write_row(b"r2").unwrap();
        assert!(factory.record(N1).committed.is_empty());
        w.finish(true).unwrap();
        w.commit().unwrap();
        w.close();
        w.close();
        let rec = factory.record(N1);
        assert_eq!(rec.committed_strings(), vec!["r1", "r2"]);
        assert_eq!((rec.commits, rec.closes), (1, 1));
    }

    #[test]
    fn rollback_discards_rows() {
        let factory = MemoryWriterFactory::new();
        let mut w = writer(&factory);
        w.start().unwrap();
        w.write_row(b"r1").unwrap();
        w.finish(false).unwrap();
        w.rollback().unwrap();
        assert!(factory.record(N1).committed.is_empty());
        assert_eq!(w.state(), WriterState::RolledBack);
    }

    #[test]
    fn write_failure_after_n_rows() {
        let factory = MemoryWriterFactory::new().fail_on(N1, FailPoint::Write { after: 1 });
        let mut w = writer(&factory);
        w.start().unwrap();
        w.write_row(b"ok").unwrap();
        assert!(w.write_row(b"boom").is_err());
        assert_eq!(w.state(), WriterState::Failed);
        assert!(w.write_row(b"again").is_err());
        w.finish(false).unwrap();
        w.rollback().unwrap();
    }
}
