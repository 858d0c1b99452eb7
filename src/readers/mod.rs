//! Row readers: the single producer feeding a load's [`RowBuffer`].
//!
//! - [`ResultSetReader`] - decoded columns from a query, with optional
//!   group-by hash columns.
//! - [`ServerCopyReader`] - rows of a server-side `COPY ... TO STDOUT`.
//! - [`RawStreamReader`] - delimited or CSV lines from files or any
//!   [`std::io::Read`].

mod raw_stream;

pub use raw_stream::{LineEnd, RawStreamReader};
pub(crate) use raw_stream::read_line_into;

use crate::error::Result;
use crate::processor::RowKind;
use crate::row::Row;
use crate::row_buffer::{FinishGuard, RowBuffer};
use tracing::{debug, warn};

/// Producer side of a load.
pub trait RowReader: Send {
    /// Push every row into `buffer`, returning how many were pushed.
    ///
    /// # Errors
    /// Source failures, malformed input, or [`LoadError::Cancelled`] when
    /// the buffer was finished underneath the reader.
    ///
    /// [`LoadError::Cancelled`]: crate::LoadError::Cancelled
    fn read_into(&mut self, buffer: &RowBuffer<Row>) -> Result<u64>;

    /// Shape of the rows this reader produces.
    fn row_kind(&self) -> RowKind {
        RowKind::Bytes
    }
}

/// Run `reader` to completion and mark the buffer finished on every exit
/// path, including unwinding.
///
/// # Errors
/// Whatever the reader returned.
pub fn run_reader<R: RowReader + ?Sized>(reader: &mut R, buffer: &RowBuffer<Row>) -> Result<u64> {
    let _guard = FinishGuard::new(buffer);
    let result = reader.read_into(buffer);
    match &result {
        Ok(rows) => debug!(rows, "reader finished"),
        Err(e) if e.is_cancelled() => debug!("reader stopped by cancellation"),
        Err(e) => warn!(error = %e, "reader failed"),
    }
    result
}

/// Source of decoded rows, e.g. a database cursor.
pub trait ResultSetSource: Send {
    /// Next row, `None` at the end. `None` columns are SQL NULL.
    ///
    /// # Errors
    /// The source failed.
    fn next_row(&mut self) -> Result<Option<Vec<Option<String>>>>;
}

/// Reads rows from a [`ResultSetSource`].
pub struct ResultSetReader<S> {
    source: S,
    hash_columns: Vec<usize>,
}

impl<S: ResultSetSource> ResultSetReader<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            hash_columns: Vec::new(),
        }
    }

    /// Compute a group hash from these columns for every row.
    #[must_use]
    pub fn with_hash_columns(mut self, columns: Vec<usize>) -> Self {
        self.hash_columns = columns;
        self
    }

    fn group_hash(&self, row: &[Option<String>]) -> Option<String> {
        if self.hash_columns.is_empty() {
            return None;
        }
        let mut hash = String::new();
        for &i in &self.hash_columns {
            if let Some(Some(v)) = row.get(i) {
                hash.push_str(v);
            }
        }
        Some(hash)
    }
}

impl<S: ResultSetSource> RowReader for ResultSetReader<S> {
    fn read_into(&mut self, buffer: &RowBuffer<Row>) -> Result<u64> {
        let mut rows = 0;
        while let Some(row) = self.source.next_row()? {
            let hash = self.group_hash(&row);
            buffer.put(Row::Columns(row), hash)?;
            rows += 1;
        }
        Ok(rows)
    }

    fn row_kind(&self) -> RowKind {
        RowKind::Columns
    }
}

/// Server side of a `COPY ... TO STDOUT`, one row per call.
pub trait CopyStream: Send {
    /// Next raw row, `None` at the end.
    ///
    /// # Errors
    /// The connection failed.
    fn read_row(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Reads rows from a [`CopyStream`], stripping their terminators.
pub struct ServerCopyReader<S> {
    stream: S,
}

impl<S: CopyStream> ServerCopyReader<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

impl<S: CopyStream> RowReader for ServerCopyReader<S> {
    fn read_into(&mut self, buffer: &RowBuffer<Row>) -> Result<u64> {
        let mut rows = 0;
        while let Some(mut row) = self.stream.read_row()? {
            while matches!(row.last(), Some(b'\n' | b'\r')) {
                row.pop();
            }
            buffer.put(Row::Bytes(row), None)?;
            rows += 1;
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoadError;
    use crate::testing::{VecCopyStream, VecResultSet};

    fn drain(buffer: &RowBuffer<Row>) -> Vec<(Row, Option<String>)> {
        std::iter::from_fn(|| buffer.get()).collect()
    }

    #[test]
    fn result_set_rows_carry_group_hash() {
        let source = VecResultSet::new(vec![
            vec![Some("a".into()), None, Some("1".into())],
            vec![Some("b".into()), Some("x".into()), Some("2".into())],
        ]);
        let mut reader = ResultSetReader::new(source).with_hash_columns(vec![0, 1]);
        let buffer = RowBuffer::new(4).unwrap();
        assert_eq!(run_reader(&mut reader, &buffer).unwrap(), 2);
        assert!(buffer.is_finished());
        let rows = drain(&buffer);
        assert_eq!(rows[0].1.as_deref(), Some("a"));
        assert_eq!(rows[1].1.as_deref(), Some("bx"));
        assert_eq!(reader.row_kind(), RowKind::Columns);
    }

    #[test]
    fn server_copy_rows_lose_terminators() {
        let stream = VecCopyStream::new(["1|a\n", "2|b\r\n", "3|c"]);
        let mut reader = ServerCopyReader::new(stream);
        let buffer = RowBuffer::new(4).unwrap();
        run_reader(&mut reader, &buffer).unwrap();
        let rows: Vec<Row> = drain(&buffer).into_iter().map(|(r, _)| r).collect();
        assert_eq!(rows, vec![Row::from("1|a"), Row::from("2|b"), Row::from("3|c")]);
    }

    #[test]
    fn reader_errors_still_finish_the_buffer() {
        let mut reader = ServerCopyReader::new(VecCopyStream::failing_after(["1|a"], "connection reset"));
        let buffer = RowBuffer::new(4).unwrap();
        let err = run_reader(&mut reader, &buffer).unwrap_err();
        assert!(matches!(err, LoadError::Io(_)));
        assert!(buffer.is_finished());
        assert_eq!(drain(&buffer).len(), 1);
    }
}
