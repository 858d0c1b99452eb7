//! Row bytes plus column boundaries, shared by the text and CSV parsers.

use std::ops::Range;

/// One delimited row held as bytes with the end offset of every column.
///
/// Column `i` spans `start(i)..ends[i]`, where `start(0) == 0` and
/// `start(i) == ends[i - 1] + 1` (one delimiter byte in between).
#[derive(Debug, Default)]
pub(crate) struct DelimitedLine {
    pub(crate) buf: Vec<u8>,
    pub(crate) ends: Vec<usize>,
    delimiter: u8,
}

impl DelimitedLine {
    pub(crate) fn new(delimiter: u8) -> Self {
        Self {
            buf: Vec::new(),
            ends: Vec::new(),
            delimiter,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
        self.ends.clear();
    }

    pub(crate) fn column_count(&self) -> usize {
        self.ends.len()
    }

    pub(crate) fn range(&self, i: usize) -> Option<Range<usize>> {
        let end = *self.ends.get(i)?;
        let start = if i == 0 { 0 } else { self.ends[i - 1] + 1 };
        Some(start..end)
    }

    pub(crate) fn raw(&self, i: usize) -> Option<&[u8]> {
        self.range(i).map(|r| &self.buf[r])
    }

    /// Insert already-encoded bytes as the new column `i`. Bytes of every
    /// other column are left untouched; ends after the insertion shift.
    pub(crate) fn insert_raw(&mut self, i: usize, encoded: &[u8]) {
        let n = self.ends.len();
        let i = i.min(n);
        if n == 0 {
            self.buf.extend_from_slice(encoded);
            self.ends.push(self.buf.len());
            return;
        }
        if i == n {
            self.buf.push(self.delimiter);
            self.buf.extend_from_slice(encoded);
            self.ends.push(self.buf.len());
            return;
        }
        let at = self.range(i).map_or(0, |r| r.start);
        let shift = encoded.len() + 1;
        let mut spliced = Vec::with_capacity(shift);
        spliced.extend_from_slice(encoded);
        spliced.push(self.delimiter);
        self.buf.splice(at..at, spliced);
        for end in &mut self.ends[i..] {
            *end += shift;
        }
        self.ends.insert(i, at + encoded.len());
    }

    /// Remove the last column and its preceding delimiter.
    pub(crate) fn drop_last(&mut self) {
        let Some(last) = self.ends.len().checked_sub(1) else {
            return;
        };
        let cut = self.range(last).map_or(0, |r| r.start.saturating_sub(1));
        self.buf.truncate(if last == 0 { 0 } else { cut });
        self.ends.pop();
    }
}

/// Strip one trailing CR, LF or CRLF.
pub(crate) fn strip_terminator(bytes: &[u8]) -> (&[u8], &'static [u8]) {
    if let Some(rest) = bytes.strip_suffix(b"\r\n") {
        (rest, b"\r\n")
    } else if let Some(rest) = bytes.strip_suffix(b"\n") {
        (rest, b"\n")
    } else if let Some(rest) = bytes.strip_suffix(b"\r") {
        (rest, b"\r")
    } else {
        (bytes, b"")
    }
}
