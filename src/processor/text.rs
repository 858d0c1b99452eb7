//! COPY text rows: delimiter-separated fields with backslash escapes.

use super::line::{DelimitedLine, strip_terminator};
use crate::config::CopyFormat;
use std::borrow::Cow;

/// Parser state for one text row.
#[derive(Debug)]
pub struct TextRow {
    line: DelimitedLine,
    delimiter: u8,
    null_marker: Vec<u8>,
}

impl TextRow {
    #[must_use]
    pub fn new(format: &CopyFormat) -> Self {
        let delimiter = format.delimiter_byte();
        Self {
            line: DelimitedLine::new(delimiter),
            delimiter,
            null_marker: format.null_marker.as_bytes().to_vec(),
        }
    }

    /// Split `bytes` into columns.
    ///
    /// A delimiter preceded by an odd number of contiguous backslashes is
    /// part of the value.
    pub fn parse(&mut self, bytes: &[u8]) {
        let (bytes, _) = strip_terminator(bytes);
        self.line.clear();
        self.line.buf.extend_from_slice(bytes);
        let mut escaped = false;
        for (i, &b) in bytes.iter().enumerate() {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == self.delimiter {
                self.line.ends.push(i);
            }
        }
        self.line.ends.push(bytes.len());
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.line.column_count()
    }

    /// Decoded value of column `i`; `None` for the null marker or a missing
    /// column.
    #[must_use]
    pub fn value(&self, i: usize) -> Option<Cow<'_, str>> {
        let raw = self.line.raw(i)?;
        if raw == self.null_marker.as_slice() {
            return None;
        }
        if !raw.contains(&b'\\') {
            return Some(String::from_utf8_lossy(raw));
        }
        Some(Cow::Owned(
            String::from_utf8_lossy(&unescape(raw)).into_owned(),
        ))
    }

    /// Encode `value` and splice it in as column `i`.
    pub fn insert_value(&mut self, i: usize, value: Option<&str>) {
        let encoded = match value {
            None => self.null_marker.clone(),
            Some(v) => escape(v.as_bytes(), self.delimiter),
        };
        self.line.insert_raw(i, &encoded);
    }

    pub fn drop_last_column(&mut self) {
        self.line.drop_last();
    }

    pub fn output_row(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.line.buf);
    }
}

fn unescape(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut iter = raw.iter().copied();
    while let Some(b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(b'b') => out.push(0x08),
            Some(b'f') => out.push(0x0c),
            Some(b'v') => out.push(0x0b),
            Some(other) => out.push(other),
            None => out.push(b'\\'),
        }
    }
    out
}

/// Escape a value for COPY text output.
pub(crate) fn escape(value: &[u8], delimiter: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for &b in value {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            d if d == delimiter => {
                out.push(b'\\');
                out.push(d);
            }
            _ => out.push(b),
        }
    }
    out
}
