//! Test doubles and fixtures for loads.
//!
//! Everything here runs in memory so pipelines can be exercised end to end
//! without a database:
//!
//! - **Sources**: [`VecResultSet`] and [`VecCopyStream`] feed readers from
//!   vectors, optionally failing after the last row.
//! - **Fixtures**: the two-node `orders` table of [`two_node_config`] with
//!   [`two_node_map`] and [`five_rows`].
//! - **Submitters**: [`ScriptedSubmitter`] accepts or rejects chunks by
//!   content and records what it loaded.
//! - **Assertions**: compare what [`MemoryWriterFactory`] committed.
//!
//! # Quick Start
//!
//! ```no_run
//! use ironload::orchestrator::{LoadOrchestrator, WorkerPool};
//! use ironload::readers::RawStreamReader;
//! use ironload::testing::*;
//! use ironload::writers::MemoryWriterFactory;
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let pool = WorkerPool::for_processors(1)?;
//! let factory = Arc::new(MemoryWriterFactory::new());
//! let orch = LoadOrchestrator::new(&pool, two_node_config(1), two_node_map(), factory.clone())?;
//! let input = std::io::Cursor::new(five_rows().join("\n"));
//! let report = orch.run(RawStreamReader::new(input))?;
//! assert_eq!(report.rows_loaded, 5);
//! # Ok(())
//! # }
//! ```
//!
//! [`MemoryWriterFactory`]: crate::writers::MemoryWriterFactory

pub mod assertions;
pub mod fixtures;

pub use assertions::*;
pub use fixtures::*;

use crate::chunk_retry::{ChunkSubmitter, SubmitOutcome};
use crate::error::Result;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type RowPredicate = Box<dyn Fn(&[u8]) -> bool + Send>;

/// Chunk submitter that rejects any chunk holding a row matching a
/// predicate and otherwise loads every row.
pub struct ScriptedSubmitter {
    reject: RowPredicate,
    accepted: Vec<Vec<u8>>,
    submissions: u64,
}

impl ScriptedSubmitter {
    #[must_use]
    pub fn accept_all() -> Self {
        Self::rejecting(|_| false)
    }

    pub fn rejecting(predicate: impl Fn(&[u8]) -> bool + Send + 'static) -> Self {
        Self {
            reject: Box::new(predicate),
            accepted: Vec::new(),
            submissions: 0,
        }
    }

    /// Reject rows starting with `prefix`.
    #[must_use]
    pub fn rejecting_prefix(prefix: &str) -> Self {
        let prefix = prefix.as_bytes().to_vec();
        Self::rejecting(move |row| row.starts_with(&prefix))
    }

    /// Loaded rows in load order.
    #[must_use]
    pub fn accepted(&self) -> Vec<String> {
        self.accepted
            .iter()
            .map(|r| String::from_utf8_lossy(r).into_owned())
            .collect()
    }

    #[must_use]
    pub fn accepted_rows(&self) -> usize {
        self.accepted.len()
    }

    #[must_use]
    pub fn submissions(&self) -> u64 {
        self.submissions
    }
}

impl ChunkSubmitter for ScriptedSubmitter {
    fn submit(&mut self, rows: &[&[u8]]) -> Result<SubmitOutcome> {
        self.submissions += 1;
        if let Some(bad) = rows.iter().find(|r| (self.reject)(r)) {
            return Ok(SubmitOutcome::Rejected(format!(
                "bad row: {}",
                String::from_utf8_lossy(bad)
            )));
        }
        self.accepted.extend(rows.iter().map(|r| r.to_vec()));
        Ok(SubmitOutcome::Accepted)
    }
}

/// In-memory [`Write`] target whose clones share one buffer, for capturing
/// reject files.
#[derive(Clone, Debug, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Everything written so far, as UTF-8.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_submitter_rejects_whole_chunk() {
        let mut s = ScriptedSubmitter::rejecting_prefix("x");
        let outcome = s.submit(&[b"a".as_slice(), b"xb".as_slice()]).unwrap();
        assert_eq!(outcome, SubmitOutcome::Rejected("bad row: xb".into()));
        assert_eq!(s.accepted_rows(), 0);
        assert_eq!(s.submit(&[b"a".as_slice()]).unwrap(), SubmitOutcome::Accepted);
        assert_eq!(s.accepted(), vec!["a"]);
        assert_eq!(s.submissions(), 2);
    }

    #[test]
    fn shared_buffer_clones_share_bytes() {
        let buf = SharedBuffer::default();
        let mut w = buf.clone();
        writeln!(w, "one").unwrap();
        assert_eq!(buf.contents(), "one\n");
    }
}
