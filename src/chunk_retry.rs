//! Client-side bulk loading with chunked commits and reject isolation.
//!
//! A [`BulkLoader`] reads a line-oriented input, groups records into chunks
//! of `commit_interval` rows and hands every chunk to a [`ChunkSubmitter`]
//! as one unit. A rejected chunk is split into `auto_reduce_rate` parts that
//! are submitted the same way, so a single bad line among `N` good ones
//! costs `O(rate * log_rate N)` extra submissions and every good row still
//! loads. Chunks that cannot be split further go to the reject file.
//!
//! Every input record ends up either loaded or rejected. When rejected rows
//! exceed `max_errors` the run stops with
//! [`LoadError::ErrorBudgetExceeded`], whose `lines_consumed` is the last
//! input line already accounted for: rerunning with
//! `start_line = lines_consumed + 1` resumes without loading anything twice.

use crate::NodeId;
use crate::config::CopyFormat;
use crate::error::{LoadError, Result};
use crate::io::{create_output, expand_inputs, open_input};
use crate::metrics::MetricsCollector;
use crate::processor::{CsvRow, Feed, escape_text, joint_for, strip_terminator};
use crate::readers::read_line_into;
use crate::writers::{NodeWriter, SinkTarget, WriterFactory};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const TEXT_NULL: &[u8] = b"\\N";

/// Settings of one client bulk load. Field names follow the CLI flags.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkLoadOptions {
    pub table: String,
    /// Target columns in input order. Empty means all columns.
    pub columns: Vec<String>,
    /// Input format. CSV input is re-encoded to COPY text before sending.
    pub format: CopyFormat,
    /// Lines starting with this prefix are skipped.
    pub comment_prefix: Option<String>,
    /// First input line to load, 1-based.
    pub start_line: u64,
    /// Last input line to load.
    pub end_line: Option<u64>,
    /// Log progress every this many rows sent; 0 disables.
    pub verbose_interval: u64,
    /// Rejected rows tolerated before the run aborts.
    pub max_errors: Option<u64>,
    /// Rows per top-level chunk.
    pub commit_interval: usize,
    /// Parts a rejected chunk is split into; 0 disables splitting.
    pub auto_reduce_rate: usize,
    /// Chunks of at most this many rows are rejected instead of split.
    pub min_commit_interval: usize,
    pub reject_file: Option<PathBuf>,
    /// Write rejected records as read instead of re-encoded.
    pub preserve_original: bool,
    /// Precede rejected chunks with a `# reason` line.
    pub error_comments: bool,
}

impl Default for BulkLoadOptions {
    fn default() -> Self {
        Self {
            table: String::new(),
            columns: Vec::new(),
            format: CopyFormat::default(),
            comment_prefix: None,
            start_line: 1,
            end_line: None,
            verbose_interval: 0,
            max_errors: None,
            commit_interval: 1000,
            auto_reduce_rate: 10,
            min_commit_interval: 1,
            reject_file: None,
            preserve_original: false,
            error_comments: true,
        }
    }
}

impl BulkLoadOptions {
    pub fn new(table: impl Into<String>, format: CopyFormat) -> Self {
        Self {
            table: table.into(),
            format,
            ..Self::default()
        }
    }

    /// Read options from a JSON file and validate them.
    ///
    /// # Errors
    /// I/O, JSON and validation errors.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let options: BulkLoadOptions = serde_json::from_str(&text)?;
        options.validate()?;
        Ok(options)
    }

    /// # Errors
    /// An invalid format, zero chunk sizes, a reduce rate of 1, inverted
    /// line bounds, an empty comment prefix, or force-not-null columns that
    /// are not in `columns`.
    pub fn validate(&self) -> Result<()> {
        self.format.validate()?;
        if self.table.trim().is_empty() {
            return Err(LoadError::config("no target table"));
        }
        if self.commit_interval == 0 || self.min_commit_interval == 0 {
            return Err(LoadError::config("commit intervals must be positive"));
        }
        if self.auto_reduce_rate == 1 {
            return Err(LoadError::config(
                "auto-reduce rate must be 0 (off) or at least 2",
            ));
        }
        if self.start_line == 0 {
            return Err(LoadError::config("start line is 1-based"));
        }
        if let Some(end) = self.end_line
            && end < self.start_line
        {
            return Err(LoadError::config(format!(
                "end line {end} is before start line {}",
                self.start_line
            )));
        }
        if self.comment_prefix.as_deref() == Some("") {
            return Err(LoadError::config("comment prefix is empty"));
        }
        if let Some(csv) = &self.format.csv {
            for name in &csv.force_not_null {
                if self.column_index(name).is_none() {
                    return Err(LoadError::config(format!(
                        "force-not-null column '{name}' is not in the column list"
                    )));
                }
            }
        }
        Ok(())
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Format of the rows handed to submitters: the input format for text
    /// input, COPY text with `\N` for CSV input.
    #[must_use]
    pub fn output_format(&self) -> CopyFormat {
        if self.format.is_csv() {
            CopyFormat::text(self.format.delimiter)
        } else {
            self.format.clone()
        }
    }

    #[must_use]
    pub fn sink_target(&self) -> SinkTarget {
        SinkTarget::new(&self.table, self.columns.clone(), self.output_format())
    }
}

/// One input record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkRecord {
    /// First and last physical input line of the record.
    pub first_line: u64,
    pub last_line: u64,
    /// Row as submitted, without terminator.
    pub encoded: Vec<u8>,
    /// Bytes as read, terminators included.
    pub original: Vec<u8>,
}

/// Split `records` into `parts` runs of roughly equal length.
pub fn split_chunk(records: &[ChunkRecord], parts: usize) -> std::slice::Chunks<'_, ChunkRecord> {
    records.chunks(records.len().div_ceil(parts.max(1)).max(1))
}

/// Verdict on one submitted chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Every row was loaded and committed.
    Accepted,
    /// Nothing was loaded; the reason is what the server said.
    Rejected(String),
}

/// Loads a chunk as one transaction.
pub trait ChunkSubmitter {
    /// # Errors
    /// Failures that make continuing pointless, such as a lost connection.
    /// Row-level rejections are [`SubmitOutcome::Rejected`] instead.
    fn submit(&mut self, rows: &[&[u8]]) -> Result<SubmitOutcome>;
}

impl<F> ChunkSubmitter for F
where
    F: FnMut(&[&[u8]]) -> Result<SubmitOutcome>,
{
    fn submit(&mut self, rows: &[&[u8]]) -> Result<SubmitOutcome> {
        self(rows)
    }
}

/// Submits every chunk through a fresh [`NodeWriter`].
///
/// Sink failures become rejections; anything else aborts the run.
pub struct WriterSubmitter {
    factory: Arc<dyn WriterFactory>,
    node: NodeId,
    target: SinkTarget,
}

impl WriterSubmitter {
    pub fn new(factory: Arc<dyn WriterFactory>, node: NodeId, target: SinkTarget) -> Self {
        Self {
            factory,
            node,
            target,
        }
    }
}

fn deliver(writer: &mut dyn NodeWriter, rows: &[&[u8]]) -> Result<()> {
    writer.start()?;
    for row in rows {
        writer.write_row(row)?;
    }
    writer.finish(true)?;
    writer.commit()
}

impl ChunkSubmitter for WriterSubmitter {
    fn submit(&mut self, rows: &[&[u8]]) -> Result<SubmitOutcome> {
        let mut writer = self.factory.create(self.node, 0, &self.target)?;
        let outcome = match deliver(writer.as_mut(), rows) {
            Ok(()) => Ok(SubmitOutcome::Accepted),
            Err(e @ (LoadError::Sink { .. } | LoadError::SinkTimeout { .. })) => {
                if let Err(rb) = writer.rollback() {
                    warn!(node = %self.node, error = %rb, "rollback of rejected chunk failed");
                }
                Ok(SubmitOutcome::Rejected(e.to_string()))
            }
            Err(e) => {
                if let Err(rb) = writer.rollback() {
                    debug!(node = %self.node, error = %rb, "rollback after failure");
                }
                Err(e)
            }
        };
        writer.close();
        outcome
    }
}

/// Counters of one bulk load.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BulkLoadSummary {
    /// Physical input lines read, skipped ones included.
    pub lines_read: u64,
    /// Records taken from the input, malformed ones included.
    pub rows_read: u64,
    /// Records submitted at least once.
    pub rows_sent: u64,
    pub rows_loaded: u64,
    pub rejected_rows: u64,
    /// Top-level chunks.
    pub chunks: u64,
    /// Submissions, retries of split chunks included.
    pub submissions: u64,
    /// Reject file entries.
    pub rejected_chunks: u64,
    pub first_error: Option<String>,
    pub elapsed: Duration,
}

enum Item {
    Record(ChunkRecord),
    Malformed(ChunkRecord, String),
}

/// Turns physical lines into records: applies line bounds, skips comments,
/// joins CSV records spanning lines and re-encodes them as COPY text.
struct InputFilter<R> {
    input: R,
    line: u64,
    start_line: u64,
    end_line: Option<u64>,
    comment: Option<Vec<u8>>,
    csv: Option<CsvRow>,
    delimiter: u8,
    done: bool,
}

impl<R: BufRead> InputFilter<R> {
    fn new(input: R, options: &BulkLoadOptions) -> Self {
        let csv = options.format.csv.as_ref().map(|c| {
            let mut row = CsvRow::new(&options.format);
            let flags = options
                .columns
                .iter()
                .map(|col| c.force_not_null.iter().any(|n| n.eq_ignore_ascii_case(col)))
                .collect();
            row.set_force_not_null(flags);
            row
        });
        Self {
            input,
            line: 0,
            start_line: options.start_line,
            end_line: options.end_line,
            comment: options.comment_prefix.as_ref().map(|p| p.as_bytes().to_vec()),
            csv,
            delimiter: options.format.delimiter_byte(),
            done: false,
        }
    }

    fn read_line(&mut self, out: &mut Vec<u8>) -> Result<bool> {
        out.clear();
        if read_line_into(&mut self.input, out)?.0 == 0 {
            return Ok(false);
        }
        self.line += 1;
        Ok(true)
    }

    fn next_item(&mut self) -> Result<Option<Item>> {
        let mut raw = Vec::new();
        while !self.done {
            if !self.read_line(&mut raw)? {
                break;
            }
            if self.line < self.start_line {
                continue;
            }
            if let Some(end) = self.end_line
                && self.line > end
            {
                self.done = true;
                break;
            }
            let (content, _) = strip_terminator(&raw);
            if let Some(prefix) = &self.comment
                && content.starts_with(prefix)
            {
                continue;
            }
            if content == b"\\." {
                debug!(line = self.line, "end-of-data marker");
                self.done = true;
                break;
            }
            let mut record = ChunkRecord {
                first_line: self.line,
                last_line: self.line,
                encoded: Vec::new(),
                original: raw.clone(),
            };
            if self.csv.is_none() {
                record.encoded = content.to_vec();
                return Ok(Some(Item::Record(record)));
            }
            return self.read_csv(raw, record).map(Some);
        }
        Ok(None)
    }

    fn read_csv(&mut self, mut raw: Vec<u8>, mut record: ChunkRecord) -> Result<Item> {
        let Some(row) = self.csv.as_mut() else {
            return Ok(Item::Record(record));
        };
        let mut state = row.start(&raw);
        loop {
            match state {
                Err(reason) => return Ok(Item::Malformed(record, reason)),
                Ok(Feed::Done) => {
                    encode_csv(row, self.delimiter, &mut record.encoded);
                    return Ok(Item::Record(record));
                }
                Ok(Feed::NeedMore) => {
                    let joint = joint_for(&raw);
                    raw.clear();
                    if read_line_into(&mut self.input, &mut raw)?.0 == 0 {
                        self.done = true;
                        return Ok(Item::Malformed(
                            record,
                            "unterminated quoted field".to_string(),
                        ));
                    }
                    self.line += 1;
                    record.last_line = self.line;
                    record.original.extend_from_slice(&raw);
                    state = row.continue_with(&raw, joint);
                }
            }
        }
    }
}

fn encode_csv(row: &CsvRow, delimiter: u8, out: &mut Vec<u8>) {
    for i in 0..row.column_count() {
        if i > 0 {
            out.push(delimiter);
        }
        match row.value(i) {
            Some(v) => out.extend_from_slice(&escape_text(v.as_bytes(), delimiter)),
            None => out.extend_from_slice(TEXT_NULL),
        }
    }
}

/// Runs a client bulk load. See the module docs.
pub struct BulkLoader<S> {
    options: BulkLoadOptions,
    submitter: S,
    rejects: Option<Box<dyn Write + Send>>,
    metrics: Option<MetricsCollector>,
    summary: BulkLoadSummary,
    consumed: u64,
    next_progress: u64,
}

impl<S: ChunkSubmitter> BulkLoader<S> {
    /// # Errors
    /// The options do not validate.
    pub fn new(options: BulkLoadOptions, submitter: S) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            submitter,
            rejects: None,
            metrics: None,
            summary: BulkLoadSummary::default(),
            consumed: 0,
            next_progress: 0,
        })
    }

    /// Send rejects here instead of `reject_file`.
    #[must_use]
    pub fn with_reject_writer(mut self, writer: impl Write + Send + 'static) -> Self {
        self.rejects = Some(Box::new(writer));
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn submitter(&self) -> &S {
        &self.submitter
    }

    /// Counters of the last run, complete even when it failed.
    pub fn summary(&self) -> &BulkLoadSummary {
        &self.summary
    }

    /// Load `inputs` (paths or glob patterns) as one stream.
    ///
    /// # Errors
    /// See [`run`](Self::run).
    pub fn run_inputs<P: AsRef<str>>(&mut self, inputs: &[P]) -> Result<BulkLoadSummary> {
        let mut chained: Box<dyn Read + Send> = Box::new(std::io::empty());
        for path in expand_inputs(inputs)? {
            chained = Box::new(chained.chain(open_input(&path)?));
        }
        self.run(BufReader::with_capacity(64 * 1024, chained))
    }

    /// Load everything `input` holds.
    ///
    /// # Errors
    /// Input and reject-file I/O failures, fatal submitter errors, and
    /// [`LoadError::ErrorBudgetExceeded`].
    pub fn run<R: BufRead>(&mut self, input: R) -> Result<BulkLoadSummary> {
        let started = Instant::now();
        self.summary = BulkLoadSummary::default();
        self.consumed = self.options.start_line - 1;
        self.next_progress = self.options.verbose_interval;
        if self.rejects.is_none()
            && let Some(path) = &self.options.reject_file
        {
            self.rejects = Some(create_output(path)?);
        }
        info!(table = %self.options.table, chunk = self.options.commit_interval, "bulk load started");

        let result = self.load(input);
        let flushed = self.rejects.as_mut().map_or(Ok(()), |w| w.flush());
        self.summary.elapsed = started.elapsed();
        if let Some(m) = &self.metrics {
            m.record_bulk_load(&self.summary);
        }
        let s = &self.summary;
        match &result {
            Ok(()) => info!(
                rows_loaded = s.rows_loaded,
                rejected = s.rejected_rows,
                chunks = s.chunks,
                submissions = s.submissions,
                elapsed_ms = s.elapsed.as_millis() as u64,
                "bulk load finished"
            ),
            Err(e) => warn!(error = %e, rows_loaded = s.rows_loaded, "bulk load aborted"),
        }
        result?;
        flushed?;
        Ok(self.summary.clone())
    }

    fn load<R: BufRead>(&mut self, input: R) -> Result<()> {
        let mut filter = InputFilter::new(input, &self.options);
        let mut chunk = Vec::with_capacity(self.options.commit_interval);
        loop {
            let item = filter.next_item();
            self.summary.lines_read = filter.line;
            let Some(item) = item? else {
                break;
            };
            self.summary.rows_read += 1;
            match item {
                Item::Record(record) => {
                    chunk.push(record);
                    if chunk.len() >= self.options.commit_interval {
                        self.load_chunk(&mut chunk)?;
                    }
                }
                Item::Malformed(record, reason) => {
                    self.load_chunk(&mut chunk)?;
                    self.reject(std::slice::from_ref(&record), &reason)?;
                }
            }
        }
        self.load_chunk(&mut chunk)
    }

    fn load_chunk(&mut self, chunk: &mut Vec<ChunkRecord>) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.summary.chunks += 1;
        self.summary.rows_sent += chunk.len() as u64;
        self.submit(chunk)?;
        chunk.clear();
        if self.next_progress > 0 && self.summary.rows_sent >= self.next_progress {
            info!(
                rows_sent = self.summary.rows_sent,
                rows_loaded = self.summary.rows_loaded,
                rejected = self.summary.rejected_rows,
                "progress"
            );
            while self.next_progress <= self.summary.rows_sent {
                self.next_progress += self.options.verbose_interval;
            }
        }
        Ok(())
    }

    fn submit(&mut self, records: &[ChunkRecord]) -> Result<()> {
        let Some(last) = records.last() else {
            return Ok(());
        };
        self.summary.submissions += 1;
        let rows: Vec<&[u8]> = records.iter().map(|r| r.encoded.as_slice()).collect();
        match self.submitter.submit(&rows)? {
            SubmitOutcome::Accepted => {
                self.summary.rows_loaded += records.len() as u64;
                self.consumed = last.last_line;
                Ok(())
            }
            SubmitOutcome::Rejected(reason) => {
                let rate = self.options.auto_reduce_rate;
                if rate >= 2 && records.len() > self.options.min_commit_interval {
                    debug!(
                        first_line = records[0].first_line,
                        rows = records.len(),
                        parts = rate,
                        %reason,
                        "chunk rejected, splitting"
                    );
                    for part in split_chunk(records, rate) {
                        self.submit(part)?;
                    }
                    Ok(())
                } else {
                    self.reject(records, &reason)
                }
            }
        }
    }

    fn reject(&mut self, records: &[ChunkRecord], reason: &str) -> Result<()> {
        let Some(last) = records.last() else {
            return Ok(());
        };
        warn!(
            first_line = records[0].first_line,
            rows = records.len(),
            %reason,
            "rows rejected"
        );
        self.summary.rejected_chunks += 1;
        self.summary.rejected_rows += records.len() as u64;
        self.summary
            .first_error
            .get_or_insert_with(|| reason.to_string());
        if let Some(out) = self.rejects.as_mut() {
            if self.options.error_comments {
                let flat = reason.replace(['\r', '\n'], " ");
                writeln!(out, "# {flat}")?;
            }
            for record in records {
                if self.options.preserve_original {
                    out.write_all(&record.original)?;
                    if strip_terminator(&record.original).1.is_empty() {
                        out.write_all(b"\n")?;
                    }
                } else {
                    out.write_all(&record.encoded)?;
                    out.write_all(b"\n")?;
                }
            }
        }
        self.consumed = last.last_line;
        if let Some(max) = self.options.max_errors
            && self.summary.rejected_rows > max
        {
            return Err(LoadError::ErrorBudgetExceeded {
                lines_consumed: self.consumed,
                rejected_rows: self.summary.rejected_rows,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedSubmitter, SharedBuffer};
    use std::io::Cursor;

    fn options(chunk: usize, rate: usize) -> BulkLoadOptions {
        BulkLoadOptions {
            commit_interval: chunk,
            auto_reduce_rate: rate,
            ..BulkLoadOptions::new("t", CopyFormat::text('|'))
        }
    }

    fn lines(n: usize, bad: &[usize]) -> String {
        (1..=n)
            .map(|i| {
                if bad.contains(&i) {
                    format!("bad{i}\n")
                } else {
                    format!("{i}|ok\n")
                }
            })
            .collect()
    }

    fn loader(opts: BulkLoadOptions) -> (BulkLoader<ScriptedSubmitter>, SharedBuffer) {
        let rejects = SharedBuffer::default();
        let loader = BulkLoader::new(opts, ScriptedSubmitter::rejecting_prefix("bad"))
            .unwrap()
            .with_reject_writer(rejects.clone());
        (loader, rejects)
    }

    #[test]
    fn single_bad_line_converges_logarithmically() {
        let (mut l, rejects) = loader(options(1024, 2));
        let s = l.run(Cursor::new(lines(1024, &[700]))).unwrap();
        assert_eq!(s.rows_loaded, 1023);
        assert_eq!(s.rejected_rows, 1);
        assert_eq!(s.chunks, 1);
        // one full submission plus two halves per level of a 1024-row chunk
        assert!(s.submissions <= 1 + 2 * 10, "{} submissions", s.submissions);
        assert_eq!(rejects.contents(), "# bad row: bad700\nbad700\n");
        assert_eq!(l.submitter().accepted_rows(), 1023);
    }

    #[test]
    fn splitting_disabled_rejects_whole_chunk() {
        let (mut l, rejects) = loader(BulkLoadOptions {
            error_comments: false,
            ..options(3, 0)
        });
        let s = l.run(Cursor::new(lines(6, &[2]))).unwrap();
        assert_eq!(s.rows_loaded, 3);
        assert_eq!(s.rejected_rows, 3);
        assert_eq!(s.rejected_chunks, 1);
        assert_eq!(rejects.contents(), "1|ok\nbad2\n3|ok\n");
    }

    #[test]
    fn min_commit_interval_stops_splitting() {
        let (mut l, _) = loader(BulkLoadOptions {
            min_commit_interval: 4,
            ..options(8, 2)
        });
        let s = l.run(Cursor::new(lines(8, &[1]))).unwrap();
        assert_eq!(s.rows_loaded, 4);
        assert_eq!(s.rejected_rows, 4);
        assert_eq!(s.submissions, 3);
    }

    #[test]
    fn budget_reports_lines_consumed() {
        let (mut l, _) = loader(BulkLoadOptions {
            max_errors: Some(1),
            ..options(4, 2)
        });
        let err = l.run(Cursor::new(lines(12, &[2, 7, 11]))).unwrap_err();
        assert!(matches!(
            err,
            LoadError::ErrorBudgetExceeded { lines_consumed: 7, rejected_rows: 2 }
        ));
        assert_eq!(l.summary().rows_loaded, 5);
    }

    #[test]
    fn bounds_comments_and_end_marker() {
        let (mut l, _) = loader(BulkLoadOptions {
            start_line: 2,
            end_line: Some(6),
            comment_prefix: Some("--".into()),
            ..options(10, 2)
        });
        let input = "h|h\n1|a\n-- note\n2|b\n\\.\n3|c\n";
        let s = l.run(Cursor::new(input)).unwrap();
        assert_eq!(s.rows_loaded, 2);
        assert_eq!(l.submitter().accepted(), vec!["1|a", "2|b"]);
        assert_eq!(s.lines_read, 5);
    }

    #[test]
    fn csv_records_are_joined_and_reencoded() {
        let mut format = CopyFormat::csv(',');
        if let Some(csv) = format.csv.as_mut() {
            csv.force_not_null = vec!["c".into()];
        }
        let opts = BulkLoadOptions {
            columns: vec!["a".into(), "b".into(), "c".into()],
            ..BulkLoadOptions::new("t", format)
        };
        let mut l = BulkLoader::new(opts, ScriptedSubmitter::accept_all()).unwrap();
        let input = "1,\"x\ny\",\n2,,\"q\"\"\"\n";
        let s = l.run(Cursor::new(input)).unwrap();
        assert_eq!(s.rows_read, 2);
        assert_eq!(s.lines_read, 3);
        assert_eq!(l.submitter().accepted(), vec!["1,x\\ny,", "2,\\N,q\""]);
    }

    #[test]
    fn malformed_csv_goes_to_rejects_with_original_bytes() {
        let opts = BulkLoadOptions {
            preserve_original: true,
            error_comments: false,
            ..BulkLoadOptions::new("t", CopyFormat::csv(','))
        };
        let rejects = SharedBuffer::default();
        let mut l = BulkLoader::new(opts, ScriptedSubmitter::accept_all())
            .unwrap()
            .with_reject_writer(rejects.clone());
        let s = l.run(Cursor::new("1,a\r\n\"x\"y,b\r\n2,c\r\n\"open\r\n")).unwrap();
        assert_eq!(s.rows_loaded, 2);
        assert_eq!(s.rejected_rows, 2);
        assert_eq!(rejects.contents(), "\"x\"y,b\r\n\"open\r\n");
    }

    #[test]
    fn carriage_returns_end_lines() {
        let (mut l, rejects) = loader(BulkLoadOptions {
            error_comments: false,
            ..options(10, 2)
        });
        let s = l.run(Cursor::new("1|a\rbad2\r3|c\r\n4|d")).unwrap();
        assert_eq!(s.lines_read, 4);
        assert_eq!(s.rows_loaded, 3);
        assert_eq!(l.submitter().accepted(), vec!["1|a", "3|c", "4|d"]);
        assert_eq!(rejects.contents(), "bad2\n");
    }

    #[test]
    fn csv_continuation_after_carriage_return() {
        let opts = BulkLoadOptions {
            columns: vec!["a".into(), "b".into()],
            ..BulkLoadOptions::new("t", CopyFormat::csv(','))
        };
        let mut l = BulkLoader::new(opts, ScriptedSubmitter::accept_all()).unwrap();
        let s = l.run(Cursor::new("1,\"x\ry\"\r2,z\r")).unwrap();
        assert_eq!(s.rows_read, 2);
        assert_eq!(l.submitter().accepted(), vec!["1,x\\ry", "2,z"]);
    }

    #[test]
    fn closures_submit_chunks() {
        let mut seen = Vec::new();
        let submit = |rows: &[&[u8]]| -> Result<SubmitOutcome> {
            seen.push(rows.len());
            Ok(SubmitOutcome::Accepted)
        };
        let mut l = BulkLoader::new(options(2, 2), submit).unwrap();
        l.run(Cursor::new(lines(5, &[]))).unwrap();
        drop(l);
        assert_eq!(seen, vec![2, 2, 1]);
    }

    #[test]
    fn options_validate() {
        assert!(options(0, 2).validate().is_err());
        assert!(options(10, 1).validate().is_err());
        let mut o = options(10, 2);
        o.end_line = Some(0);
        assert!(o.validate().is_err());
        let mut format = CopyFormat::csv(',');
        if let Some(csv) = format.csv.as_mut() {
            csv.force_not_null = vec!["zz".into()];
        }
        assert!(BulkLoadOptions::new("t", format).validate().is_err());
    }

    #[test]
    fn split_is_roughly_even() {
        let records: Vec<ChunkRecord> = (0..10)
            .map(|i| ChunkRecord {
                first_line: i,
                last_line: i,
                encoded: Vec::new(),
                original: Vec::new(),
            })
            .collect();
        let sizes: Vec<usize> = split_chunk(&records, 3).map(<[_]>::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }
}
