//! Writer streaming rows over a native COPY connection.

use super::{Lifecycle, NodeWriter, SinkTarget, WriterFactory, WriterState};
use crate::NodeId;
use crate::error::{LoadError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Wire-level COPY session on one node's connection.
pub trait CopyConnection: Send {
    /// Enter COPY-in mode with `statement`.
    ///
    /// # Errors
    /// The server refused the statement.
    fn begin_copy(&mut self, statement: &str) -> Result<()>;

    /// Send a chunk of framed rows.
    ///
    /// # Errors
    /// The connection failed or the server rejected the data.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Complete the COPY, returning the row count the server reports.
    ///
    /// # Errors
    /// The server rejected the data.
    fn end_copy(&mut self) -> Result<u64>;

    /// Abandon the COPY.
    ///
    /// # Errors
    /// The connection failed.
    fn abort_copy(&mut self, reason: &str) -> Result<()>;

    /// # Errors
    /// The transaction could not be committed.
    fn commit(&mut self) -> Result<()>;

    /// # Errors
    /// The transaction could not be rolled back.
    fn rollback(&mut self) -> Result<()>;

    /// Return the connection to its pool.
    fn release(&mut self);
}

/// Pool of connections, keyed by node.
pub trait ConnectionProvider: Send + Sync {
    /// # Errors
    /// No connection to `node` could be obtained.
    fn connect(&self, node: NodeId) -> Result<Box<dyn CopyConnection>>;
}

/// Default size of a send batch.
pub const DEFAULT_BATCH_BYTES: usize = 64 * 1024;

/// Builds [`NativeCopyWriter`]s over a shared [`ConnectionProvider`].
#[derive(Clone)]
pub struct NativeCopyFactory {
    provider: Arc<dyn ConnectionProvider>,
    row_delimiter: Vec<u8>,
    batch_bytes: usize,
}

impl NativeCopyFactory {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            provider,
            row_delimiter: b"\n".to_vec(),
            batch_bytes: DEFAULT_BATCH_BYTES,
        }
    }

    #[must_use]
    pub fn with_row_delimiter(mut self, delimiter: impl Into<Vec<u8>>) -> Self {
        self.row_delimiter = delimiter.into();
        self
    }

    #[must_use]
    pub fn with_batch_bytes(mut self, bytes: usize) -> Self {
        self.batch_bytes = bytes.max(1);
        self
    }
}

impl WriterFactory for NativeCopyFactory {
    fn create(
        &self,
        node: NodeId,
        _processor: usize,
        target: &SinkTarget,
    ) -> Result<Box<dyn NodeWriter>> {
        Ok(Box::new(NativeCopyWriter {
            lifecycle: Lifecycle::new(node),
            provider: Arc::clone(&self.provider),
            conn: None,
            statement: target.copy_statement(),
            row_delimiter: self.row_delimiter.clone(),
            batch: Vec::with_capacity(self.batch_bytes),
            batch_bytes: self.batch_bytes,
            rows: 0,
        }))
    }
}

pub struct NativeCopyWriter {
    lifecycle: Lifecycle,
    provider: Arc<dyn ConnectionProvider>,
    conn: Option<Box<dyn CopyConnection>>,
    statement: String,
    row_delimiter: Vec<u8>,
    batch: Vec<u8>,
    batch_bytes: usize,
    rows: u64,
}

impl NativeCopyWriter {
    fn conn(&mut self) -> Result<&mut Box<dyn CopyConnection>> {
        let node = self.lifecycle.node();
        self.conn
            .as_mut()
            .ok_or_else(|| LoadError::sink(node, "no connection"))
    }

    fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        let sent = self.conn()?.send(&batch);
        self.batch = batch;
        self.batch.clear();
        sent
    }
}

impl NodeWriter for NativeCopyWriter {
    fn node(&self) -> NodeId {
        self.lifecycle.node()
    }

    fn state(&self) -> WriterState {
        self.lifecycle.state()
    }

    fn start(&mut self) -> Result<()> {
        self.lifecycle.check_start()?;
        let node = self.lifecycle.node();
        let opened = self.provider.connect(node).and_then(|mut conn| {
            conn.begin_copy(&self.statement)?;
            Ok(conn)
        });
        let conn = self.lifecycle.track(opened)?;
        debug!(node = %node, statement = %self.statement, "copy started");
        self.conn = Some(conn);
        self.lifecycle.advance(WriterState::Started);
        Ok(())
    }

    fn write_row(&mut self, row: &[u8]) -> Result<()> {
        self.lifecycle.check_write()?;
        self.batch.extend_from_slice(row);
        self.batch.extend_from_slice(&self.row_delimiter);
        self.rows += 1;
        if self.batch.len() >= self.batch_bytes {
            let flushed = self.flush();
            self.lifecycle.track(flushed)?;
        }
        Ok(())
    }

    fn finish(&mut self, success: bool) -> Result<()> {
        self.lifecycle.check_finish()?;
        let node = self.lifecycle.node();
        let result = if success && self.lifecycle.state() != WriterState::Failed {
            self.flush().and_then(|()| {
                let reported = self.conn()?.end_copy()?;
                if reported != self.rows {
                    warn!(node = %node, sent = self.rows, reported, "row count mismatch");
                }
                Ok(())
            })
        } else {
            self.batch.clear();
            match self.conn.as_mut() {
                Some(conn) => conn.abort_copy("load failed"),
                None => Ok(()),
            }
        };
        self.lifecycle.track(result)?;
        self.lifecycle.finished();
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.lifecycle.check_commit()?;
        let committed = self.conn().and_then(|c| c.commit());
        self.lifecycle.track(committed)?;
        self.lifecycle.advance(WriterState::Committed);
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.lifecycle.check_rollback()?;
        if let Some(conn) = self.conn.as_mut() {
            conn.rollback()?;
        }
        self.lifecycle.advance(WriterState::RolledBack);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.release();
        }
        self.lifecycle.advance(WriterState::Closed);
    }

    fn rows_written(&self) -> u64 {
        self.rows
    }
}
