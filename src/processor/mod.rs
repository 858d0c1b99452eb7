//! Row processors: parse, validate, route, complete and write each row.
//!
//! All input formats share one pipeline, [`RowProcessor::load_data`], and
//! differ only in the [`RowParser`] strategy that owns the current row.
//! For every row the processor:
//!
//! 1. parses it (`false` from `parse_row` ends the loop),
//! 2. checks the column count and NULLs in non-nullable columns,
//! 3. tracks the largest supplied serial and row-id values,
//! 4. resolves the destination nodes through the [`Router`],
//! 5. drops the node-id column of explicitly routed rows,
//! 6. splices generated values in, ascending by table position,
//! 7. writes the finished row to every destination before taking the next.

mod csv;
mod line;
mod plan;
mod result_set;
mod text;

pub use self::csv::{CsvCodec, CsvRow, Feed, Scan};
pub use plan::ColumnPlan;
pub use result_set::ResultSetRow;
pub use text::TextRow;

pub(crate) use self::csv::joint_for;
pub(crate) use line::strip_terminator;
pub(crate) use text::escape as escape_text;

use crate::NodeId;
use crate::config::CopyFormat;
use crate::error::{LoadError, Result};
use crate::routing::Router;
use crate::row::Row;
use crate::row_buffer::RowConsumer;
use crate::writers::WriterSet;
use std::borrow::Cow;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Shape of the rows a reader produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowKind {
    /// Raw delimited or CSV lines.
    Bytes,
    /// Decoded result-set columns.
    Columns,
}

/// Which parser a load uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParserKind {
    Text,
    Csv,
    ResultSet,
}

impl ParserKind {
    /// Parser for rows of `kind` in `format`.
    #[must_use]
    pub fn select(kind: RowKind, format: &CopyFormat) -> Self {
        match kind {
            RowKind::Columns => ParserKind::ResultSet,
            RowKind::Bytes if format.is_csv() => ParserKind::Csv,
            RowKind::Bytes => ParserKind::Text,
        }
    }
}

/// The parsing strategy, owning the row currently being processed.
#[derive(Debug)]
pub enum RowParser {
    Text(TextRow),
    Csv(CsvRow),
    ResultSet(ResultSetRow),
}

impl RowParser {
    #[must_use]
    pub fn new(kind: ParserKind, format: &CopyFormat, plan: &ColumnPlan) -> Self {
        match kind {
            ParserKind::Text => RowParser::Text(TextRow::new(format)),
            ParserKind::Csv => {
                let mut row = CsvRow::new(format);
                row.set_force_not_null(plan.force_not_null.clone());
                RowParser::Csv(row)
            }
            ParserKind::ResultSet => RowParser::ResultSet(ResultSetRow::new(format)),
        }
    }

    /// Take the next row from `consumer`. CSV records that span lines pull
    /// further rows from the same consumer. `line` counts rows taken.
    ///
    /// # Errors
    /// A row of the wrong shape, text after a closing quote, or a quoted
    /// field still open at the end of input.
    pub fn parse_row(&mut self, consumer: &mut RowConsumer<'_, Row>, line: &mut u64) -> Result<bool> {
        let Some(row) = consumer.get() else {
            return Ok(false);
        };
        *line += 1;
        match (self, row) {
            (RowParser::Text(p), Row::Bytes(bytes)) => p.parse(&bytes),
            (RowParser::ResultSet(p), Row::Columns(values)) => p.set(values),
            (RowParser::Csv(p), Row::Bytes(bytes)) => {
                let first = *line;
                let mut feed = p.start(&bytes).map_err(|r| LoadError::malformed(first, r))?;
                let mut joint = joint_for(&bytes);
                while feed == Feed::NeedMore {
                    let Some(next) = consumer.get() else {
                        return Err(LoadError::malformed(first, "unterminated quoted field"));
                    };
                    *line += 1;
                    let Row::Bytes(next) = next else {
                        return Err(LoadError::malformed(*line, "expected a text row"));
                    };
                    feed = p
                        .continue_with(&next, joint)
                        .map_err(|r| LoadError::malformed(first, r))?;
                    joint = joint_for(&next);
                }
            }
            (p, row) => {
                return Err(LoadError::malformed(
                    *line,
                    format!("{} parser cannot read a {} row", p.name(), row.kind()),
                ));
            }
        }
        Ok(true)
    }

    fn name(&self) -> &'static str {
        match self {
            RowParser::Text(_) => "text",
            RowParser::Csv(_) => "csv",
            RowParser::ResultSet(_) => "result-set",
        }
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        match self {
            RowParser::Text(p) => p.column_count(),
            RowParser::Csv(p) => p.column_count(),
            RowParser::ResultSet(p) => p.column_count(),
        }
    }

    #[must_use]
    pub fn value(&self, i: usize) -> Option<Cow<'_, str>> {
        match self {
            RowParser::Text(p) => p.value(i),
            RowParser::Csv(p) => p.value(i),
            RowParser::ResultSet(p) => p.value(i),
        }
    }

    pub fn insert_value(&mut self, i: usize, value: Option<&str>) {
        match self {
            RowParser::Text(p) => p.insert_value(i, value),
            RowParser::Csv(p) => p.insert_value(i, value),
            RowParser::ResultSet(p) => p.insert_value(i, value),
        }
    }

    pub fn drop_last_column(&mut self) {
        match self {
            RowParser::Text(p) => p.drop_last_column(),
            RowParser::Csv(p) => p.drop_last_column(),
            RowParser::ResultSet(p) => p.drop_last_column(),
        }
    }

    pub fn output_row(&self, out: &mut Vec<u8>) {
        match self {
            RowParser::Text(p) => p.output_row(out),
            RowParser::Csv(p) => p.output_row(out),
            RowParser::ResultSet(p) => p.output_row(out),
        }
    }
}

/// What one processor did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessorReport {
    pub rows: u64,
    pub rows_per_node: BTreeMap<NodeId, u64>,
    pub max_serial: Option<i64>,
    pub max_row_id: Option<i64>,
}

impl ProcessorReport {
    /// Fold `other` into `self`.
    pub fn merge(&mut self, other: &ProcessorReport) {
        self.rows += other.rows;
        for (node, n) in &other.rows_per_node {
            *self.rows_per_node.entry(*node).or_default() += n;
        }
        self.max_serial = self.max_serial.max(other.max_serial);
        self.max_row_id = self.max_row_id.max(other.max_row_id);
    }
}

/// One processor thread's state.
pub struct RowProcessor<'a> {
    index: usize,
    plan: &'a ColumnPlan,
    router: &'a Router,
    parser: RowParser,
    progress_interval: u64,
    line: u64,
    destinations: Vec<NodeId>,
    out: Vec<u8>,
}

impl<'a> RowProcessor<'a> {
    #[must_use]
    pub fn new(
        index: usize,
        kind: ParserKind,
        format: &CopyFormat,
        plan: &'a ColumnPlan,
        router: &'a Router,
    ) -> Self {
        Self {
            index,
            plan,
            router,
            parser: RowParser::new(kind, format, plan),
            progress_interval: 100_000,
            line: 0,
            destinations: Vec::new(),
            out: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_progress_interval(mut self, rows: u64) -> Self {
        self.progress_interval = rows.max(1);
        self
    }

    /// Process rows until the consumer runs dry.
    ///
    /// # Errors
    /// The first malformed row, generator failure or writer failure; the
    /// caller cancels the load.
    pub fn load_data(
        &mut self,
        consumer: &mut RowConsumer<'_, Row>,
        writers: &mut WriterSet,
    ) -> Result<ProcessorReport> {
        let mut report = ProcessorReport::default();
        debug!(processor = self.index, "processor started");
        while self.parser.parse_row(consumer, &mut self.line)? {
            self.check_row(&mut report)?;

            let parser = &self.parser;
            self.router.resolve(
                |i| parser.value(i),
                parser.column_count(),
                consumer.group_hash(),
                self.line,
                &mut self.destinations,
            )?;
            if self.router.uses_node_column() {
                self.parser.drop_last_column();
            }
            for injection in &self.plan.injections {
                let value = injection.next_value()?;
                self.parser.insert_value(injection.output_index, value.as_deref());
            }

            self.out.clear();
            self.parser.output_row(&mut self.out);
            for node in &self.destinations {
                writers.write(*node, &self.out)?;
                *report.rows_per_node.entry(*node).or_default() += 1;
            }
            report.rows += 1;
            if report.rows % self.progress_interval == 0 {
                info!(processor = self.index, rows = report.rows, "load progress");
            }
        }
        debug!(processor = self.index, rows = report.rows, "processor finished");
        Ok(report)
    }

    fn check_row(&self, report: &mut ProcessorReport) -> Result<()> {
        let line = self.line;
        let expected = self.plan.expected_inputs();
        let got = self.parser.column_count();
        if got < expected {
            return Err(LoadError::malformed(
                line,
                format!("missing data for column {} (expected {expected}, got {got})", got + 1),
            ));
        }
        if got > expected {
            return Err(LoadError::malformed(
                line,
                format!("extra data after last expected column (expected {expected}, got {got})"),
            ));
        }
        for (i, name) in &self.plan.not_null_inputs {
            if self.parser.value(*i).is_none() {
                return Err(LoadError::malformed(
                    line,
                    format!("null value in column '{name}' violates not-null constraint"),
                ));
            }
        }
        if let Some(i) = self.plan.serial_input {
            track_max(&self.parser, i, line, "serial", &mut report.max_serial)?;
        }
        if let Some(i) = self.plan.row_id_input {
            track_max(&self.parser, i, line, "row id", &mut report.max_row_id)?;
        }
        Ok(())
    }
}

fn track_max(
    parser: &RowParser,
    i: usize,
    line: u64,
    what: &str,
    max: &mut Option<i64>,
) -> Result<()> {
    let Some(raw) = parser.value(i) else {
        return Ok(());
    };
    let v: i64 = raw
        .trim()
        .parse()
        .map_err(|_| LoadError::malformed(line, format!("invalid {what} value '{raw}'")))?;
    *max = (*max).max(Some(v));
    Ok(())
}
