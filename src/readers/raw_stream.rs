//! Line reader over raw byte streams and input files.

use super::RowReader;
use crate::config::CopyFormat;
use crate::error::{LoadError, Result};
use crate::io::{expand_inputs, open_input};
use crate::row::Row;
use crate::row_buffer::RowBuffer;
use std::io::{BufRead, BufReader, Read};
use tracing::debug;

/// Line terminator style.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineEnd {
    Lf,
    CrLf,
    Cr,
}

impl LineEnd {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            LineEnd::Lf => "LF",
            LineEnd::CrLf => "CRLF",
            LineEnd::Cr => "CR",
        }
    }

    fn len(self) -> usize {
        match self {
            LineEnd::CrLf => 2,
            LineEnd::Lf | LineEnd::Cr => 1,
        }
    }
}

/// Splits a byte stream into rows on CR, LF or CRLF.
///
/// In text mode the first terminator style seen is the only one allowed and
/// terminators are stripped. In CSV mode terminators stay on the row so the
/// CSV parser can restore them inside quoted fields. A line holding exactly
/// `\.` ends the data.
pub struct RawStreamReader {
    input: Box<dyn BufRead + Send>,
    csv: bool,
    skip_lines: u64,
    style: Option<LineEnd>,
    last_end: Option<LineEnd>,
    line: u64,
}

impl RawStreamReader {
    pub fn new<R: Read + Send + 'static>(input: R) -> Self {
        Self {
            input: Box::new(BufReader::with_capacity(64 * 1024, input)),
            csv: false,
            skip_lines: 0,
            style: None,
            last_end: None,
            line: 0,
        }
    }

    /// Open `inputs` (paths or glob patterns) as one stream, decompressing
    /// each file by extension or magic bytes.
    ///
    /// # Errors
    /// Missing files, unmatched patterns, or unreadable inputs.
    pub fn open<S: AsRef<str>>(inputs: &[S]) -> Result<Self> {
        let files = expand_inputs(inputs)?;
        let mut chained: Box<dyn Read + Send> = Box::new(std::io::empty());
        for path in &files {
            debug!(path = %path.display(), "opening input");
            chained = Box::new(chained.chain(open_input(path)?));
        }
        Ok(Self::new(chained))
    }

    /// Switch to CSV mode when `format` is CSV.
    #[must_use]
    pub fn for_format(mut self, format: &CopyFormat) -> Self {
        self.csv = format.is_csv();
        self
    }

    #[must_use]
    pub fn with_csv(mut self, csv: bool) -> Self {
        self.csv = csv;
        self
    }

    /// Skip this many leading lines (headers).
    #[must_use]
    pub fn with_skip_lines(mut self, lines: u64) -> Self {
        self.skip_lines = lines;
        self
    }

    /// Lines read so far, skipped ones included.
    #[must_use]
    pub fn lines_read(&self) -> u64 {
        self.line
    }

    /// Read one line including its terminator into `out`. `false` at EOF.
    fn read_line(&mut self, out: &mut Vec<u8>) -> Result<bool> {
        out.clear();
        let (read, end) = read_line_into(&mut *self.input, out)?;
        self.last_end = end;
        Ok(read > 0)
    }
}

/// Append one line ending in CR, LF or CRLF, terminator included, to `out`.
///
/// Returns the number of bytes appended (0 at EOF) and the terminator seen,
/// which is `None` for a last line with no terminator.
pub(crate) fn read_line_into<R: BufRead + ?Sized>(
    input: &mut R,
    out: &mut Vec<u8>,
) -> std::io::Result<(usize, Option<LineEnd>)> {
    let before = out.len();
    loop {
        let available = input.fill_buf()?;
        if available.is_empty() {
            return Ok((out.len() - before, None));
        }
        let Some(p) = available.iter().position(|&b| b == b'\n' || b == b'\r') else {
            let n = available.len();
            out.extend_from_slice(available);
            input.consume(n);
            continue;
        };
        let term = available[p];
        out.extend_from_slice(&available[..=p]);
        input.consume(p + 1);
        let end = if term == b'\n' {
            LineEnd::Lf
        } else if input.fill_buf()?.first() == Some(&b'\n') {
            input.consume(1);
            out.push(b'\n');
            LineEnd::CrLf
        } else {
            LineEnd::Cr
        };
        return Ok((out.len() - before, Some(end)));
    }
}

impl RowReader for RawStreamReader {
    fn read_into(&mut self, buffer: &RowBuffer<Row>) -> Result<u64> {
        let mut rows = 0;
        let mut line = Vec::new();
        while self.read_line(&mut line)? {
            self.line += 1;
            let end = self.last_end;
            let content_len = line.len() - end.map_or(0, LineEnd::len);
            if !self.csv
                && let Some(found) = end
            {
                match self.style {
                    None => self.style = Some(found),
                    Some(expected) if expected != found => {
                        return Err(LoadError::MixedLineEnds {
                            line: self.line,
                            expected: expected.name(),
                            found: found.name(),
                        });
                    }
                    Some(_) => {}
                }
            }
            if self.line <= self.skip_lines {
                continue;
            }
            if &line[..content_len] == b"\\." {
                debug!(line = self.line, "end-of-data marker");
                break;
            }
            let mut row = std::mem::take(&mut line);
            if !self.csv {
                row.truncate(content_len);
            }
            buffer.put(Row::Bytes(row), None)?;
            rows += 1;
        }
        Ok(rows)
    }
}
