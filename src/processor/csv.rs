//! CSV rows: quote- and escape-aware fields that may span physical lines.

use super::line::{DelimitedLine, strip_terminator};
use crate::config::CopyFormat;
use std::borrow::Cow;

/// Quoting rules of one CSV dialect.
#[derive(Clone, Debug)]
pub struct CsvCodec {
    delimiter: u8,
    quote: u8,
    escape: u8,
    null_marker: Vec<u8>,
}

/// Outcome of scanning a logical record.
#[derive(Debug, PartialEq, Eq)]
pub enum Scan {
    /// End offset of every field.
    Complete(Vec<usize>),
    /// A quoted field is still open at the end of the input.
    Incomplete,
}

impl CsvCodec {
    /// Codec for `format`. Text formats get `"` quoting.
    #[must_use]
    pub fn new(format: &CopyFormat) -> Self {
        let (quote, escape) = format
            .csv
            .as_ref()
            .map_or((b'"', b'"'), |c| (c.quote as u8, c.escape as u8));
        Self {
            delimiter: format.delimiter_byte(),
            quote,
            escape,
            null_marker: format.null_marker.as_bytes().to_vec(),
        }
    }

    fn doubled(&self) -> bool {
        self.quote == self.escape
    }

    /// Find field boundaries in `buf`.
    ///
    /// # Errors
    /// A closing quote followed by anything but a delimiter or the end.
    pub fn scan(&self, buf: &[u8]) -> Result<Scan, String> {
        let n = buf.len();
        let mut ends = Vec::new();
        let mut i = 0;
        loop {
            if i < n && buf[i] == self.quote {
                i += 1;
                loop {
                    if i >= n {
                        return Ok(Scan::Incomplete);
                    }
                    let b = buf[i];
                    if !self.doubled() && b == self.escape {
                        if i + 1 >= n {
                            return Ok(Scan::Incomplete);
                        }
                        let next = buf[i + 1];
                        i += if next == self.quote || next == self.escape { 2 } else { 1 };
                        continue;
                    }
                    if b == self.quote {
                        if self.doubled() && i + 1 < n && buf[i + 1] == self.quote {
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    i += 1;
                }
                if i == n {
                    ends.push(n);
                    return Ok(Scan::Complete(ends));
                }
                if buf[i] != self.delimiter {
                    return Err(format!(
                        "delimiter expected after closing quote at byte {i}"
                    ));
                }
                ends.push(i);
                i += 1;
            } else {
                match buf[i..].iter().position(|&b| b == self.delimiter) {
                    Some(p) => {
                        ends.push(i + p);
                        i += p + 1;
                    }
                    None => {
                        ends.push(n);
                        return Ok(Scan::Complete(ends));
                    }
                }
            }
        }
    }

    /// Decode one raw field. Quoted fields are never NULL; an unquoted null
    /// marker is NULL unless `force_not_null` is set.
    #[must_use]
    pub fn decode<'a>(&self, raw: &'a [u8], force_not_null: bool) -> Option<Cow<'a, str>> {
        if raw.len() >= 2 && raw[0] == self.quote && raw[raw.len() - 1] == self.quote {
            let inner = &raw[1..raw.len() - 1];
            if !inner.contains(&self.escape) && !inner.contains(&self.quote) {
                return Some(String::from_utf8_lossy(inner));
            }
            let mut out = Vec::with_capacity(inner.len());
            let mut i = 0;
            while i < inner.len() {
                let b = inner[i];
                if b == self.escape
                    && i + 1 < inner.len()
                    && (inner[i + 1] == self.quote || inner[i + 1] == self.escape)
                {
                    out.push(inner[i + 1]);
                    i += 2;
                } else {
                    out.push(b);
                    i += 1;
                }
            }
            return Some(Cow::Owned(String::from_utf8_lossy(&out).into_owned()));
        }
        if raw == self.null_marker.as_slice() && !force_not_null {
            return None;
        }
        Some(String::from_utf8_lossy(raw))
    }

    /// Encode a value so that [`decode`](Self::decode) returns it unchanged.
    #[must_use]
    pub fn encode(&self, value: Option<&str>) -> Vec<u8> {
        let Some(v) = value else {
            return self.null_marker.clone();
        };
        let bytes = v.as_bytes();
        let needs_quotes = bytes.first() == Some(&self.quote)
            || bytes == self.null_marker.as_slice()
            || bytes
                .iter()
                .any(|&b| b == self.delimiter || b == b'\r' || b == b'\n');
        if !needs_quotes {
            return bytes.to_vec();
        }
        let mut out = Vec::with_capacity(bytes.len() + 2);
        out.push(self.quote);
        for &b in bytes {
            if b == self.quote || (!self.doubled() && b == self.escape) {
                out.push(self.escape);
            }
            out.push(b);
        }
        out.push(self.quote);
        out
    }
}

/// Parser state for one logical CSV record.
#[derive(Debug)]
pub struct CsvRow {
    codec: CsvCodec,
    line: DelimitedLine,
    force_not_null: Vec<bool>,
}

/// What [`CsvRow::feed`] needs next.
#[derive(Debug, PartialEq, Eq)]
pub enum Feed {
    Done,
    /// The record continues on the next physical line.
    NeedMore,
}

impl CsvRow {
    #[must_use]
    pub fn new(format: &CopyFormat) -> Self {
        Self {
            codec: CsvCodec::new(format),
            line: DelimitedLine::new(format.delimiter_byte()),
            force_not_null: Vec::new(),
        }
    }

    /// Input columns whose unquoted null marker reads as an empty string.
    pub fn set_force_not_null(&mut self, flags: Vec<bool>) {
        self.force_not_null = flags;
    }

    /// Start a new record from one physical line.
    ///
    /// # Errors
    /// Text after a closing quote.
    pub fn start(&mut self, bytes: &[u8]) -> Result<Feed, String> {
        self.line.clear();
        self.append(bytes, None)
    }

    /// Append the next physical line to an open record. `joint` is the
    /// terminator of the previous line, restored between the two.
    ///
    /// # Errors
    /// Text after a closing quote.
    pub fn continue_with(&mut self, bytes: &[u8], joint: &[u8]) -> Result<Feed, String> {
        self.append(bytes, Some(joint))
    }

    fn append(&mut self, bytes: &[u8], joint: Option<&[u8]>) -> Result<Feed, String> {
        if let Some(joint) = joint {
            self.line.buf.extend_from_slice(joint);
        }
        let (content, _) = strip_terminator(bytes);
        self.line.buf.extend_from_slice(content);
        match self.codec.scan(&self.line.buf)? {
            Scan::Complete(ends) => {
                self.line.ends = ends;
                Ok(Feed::Done)
            }
            Scan::Incomplete => Ok(Feed::NeedMore),
        }
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.line.column_count()
    }

    #[must_use]
    pub fn value(&self, i: usize) -> Option<Cow<'_, str>> {
        let raw = self.line.raw(i)?;
        let force = self.force_not_null.get(i).copied().unwrap_or(false);
        self.codec.decode(raw, force)
    }

    pub fn insert_value(&mut self, i: usize, value: Option<&str>) {
        let encoded = self.codec.encode(value);
        self.line.insert_raw(i, &encoded);
    }

    pub fn drop_last_column(&mut self) {
        self.line.drop_last();
    }

    pub fn output_row(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.line.buf);
    }
}

/// Terminator to restore when joining `bytes` with the next line.
pub(crate) fn joint_for(bytes: &[u8]) -> &'static [u8] {
    match strip_terminator(bytes).1 {
        b"" => b"\n",
        t => t,
    }
}
