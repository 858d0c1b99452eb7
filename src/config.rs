//! Load configuration.
//!
//! Everything a load needs to know up front lives in [`LoadConfig`]: the
//! row format, the destination table layout, how rows are partitioned, and
//! the sizing of the pipeline. Configurations are plain serde structs, so
//! they can be built in code or read from JSON:
//!
//! ```json
//! {
//!   "format": { "delimiter": "|", "null_marker": "" },
//!   "layout": {
//!     "table": "orders",
//!     "columns": [
//!       { "name": "id", "column_type": "integer", "is_serial": true },
//!       { "name": "region" }
//!     ],
//!     "input_columns": ["region"]
//!   },
//!   "partitioning": { "column": { "name": "region" } },
//!   "processors": 2
//! }
//! ```

use crate::error::{LoadError, Result};
use crate::row::TableLayout;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Quoting rules for CSV input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvOptions {
    pub quote: char,
    /// Escape character inside quoted fields. Equal to `quote` means doubled
    /// quotes (`""`); anything else is backslash-style escaping.
    pub escape: char,
    /// Columns whose unquoted null marker is read as an empty string.
    pub force_not_null: Vec<String>,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            quote: '"',
            escape: '"',
            force_not_null: Vec::new(),
        }
    }
}

/// Row format shared by parsers, encoders and sinks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyFormat {
    pub delimiter: char,
    pub null_marker: String,
    /// CSV quoting; `None` means COPY text format.
    pub csv: Option<CsvOptions>,
    /// Escape backslashes, delimiters and line breaks when rendering
    /// result-set columns as text rows.
    pub escape_backslashes: bool,
}

impl Default for CopyFormat {
    fn default() -> Self {
        Self::text('\t')
    }
}

impl CopyFormat {
    /// COPY text format with `\N` as the null marker.
    #[must_use]
    pub fn text(delimiter: char) -> Self {
        Self {
            delimiter,
            null_marker: "\\N".to_string(),
            csv: None,
            escape_backslashes: true,
        }
    }

    /// CSV with `"` quoting and an empty null marker.
    #[must_use]
    pub fn csv(delimiter: char) -> Self {
        Self {
            delimiter,
            null_marker: String::new(),
            csv: Some(CsvOptions::default()),
            escape_backslashes: false,
        }
    }

    #[must_use]
    pub fn with_null_marker(mut self, marker: impl Into<String>) -> Self {
        self.null_marker = marker.into();
        self
    }

    #[must_use]
    pub fn with_quote(mut self, quote: char, escape: char) -> Self {
        let csv = self.csv.get_or_insert_with(CsvOptions::default);
        csv.quote = quote;
        csv.escape = escape;
        self
    }

    #[must_use]
    pub fn is_csv(&self) -> bool {
        self.csv.is_some()
    }

    /// Delimiter as a byte. Valid after [`validate`](Self::validate).
    #[must_use]
    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter as u8
    }

    /// Check that the format can be parsed byte-wise.
    ///
    /// # Errors
    /// Non-ASCII or line-breaking delimiters, quote characters equal to the
    /// delimiter, and backslash delimiters in text mode.
    pub fn validate(&self) -> Result<()> {
        let d = self.delimiter;
        if !d.is_ascii() || d == '\n' || d == '\r' {
            return Err(LoadError::config(format!(
                "delimiter {d:?} must be a single-byte character other than CR/LF"
            )));
        }
        match &self.csv {
            None if d == '\\' => Err(LoadError::config(
                "backslash cannot be the delimiter in text format",
            )),
            None => Ok(()),
            Some(csv) => {
                if !csv.quote.is_ascii() || !csv.escape.is_ascii() {
                    return Err(LoadError::config("quote and escape must be ASCII"));
                }
                if csv.quote == d || csv.escape == d {
                    return Err(LoadError::config(
                        "quote and escape must differ from the delimiter",
                    ));
                }
                if self.null_marker.contains(d) {
                    return Err(LoadError::config("null marker contains the delimiter"));
                }
                Ok(())
            }
        }
    }
}

/// How rows pick their destination nodes. Exactly one mode per load.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partitioning {
    /// Hash/list partitioning on one column.
    Column { name: String },
    /// The last input column holds the destination node id.
    ExplicitNode,
    /// Rows carry a group-by hash computed by the reader.
    GroupByHash,
    /// Every row goes to every node of a replicated table.
    #[default]
    Replicated,
}

/// Full description of one load.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub format: CopyFormat,
    pub layout: TableLayout,
    pub partitioning: Partitioning,
    /// Processor threads consuming the row buffer.
    pub processors: usize,
    /// Row buffer capacity.
    pub buffer_capacity: usize,
    /// Rows between progress log lines, per processor.
    pub progress_interval: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            format: CopyFormat::default(),
            layout: TableLayout::default(),
            partitioning: Partitioning::default(),
            processors: num_cpus::get().clamp(1, 4),
            buffer_capacity: 10_000,
            progress_interval: 100_000,
        }
    }
}

impl LoadConfig {
    pub fn new(layout: TableLayout, format: CopyFormat, partitioning: Partitioning) -> Self {
        Self {
            format,
            layout,
            partitioning,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_processors(mut self, processors: usize) -> Self {
        self.processors = processors;
        self
    }

    #[must_use]
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Read a configuration from a JSON file and validate it.
    ///
    /// # Errors
    /// I/O, JSON and validation errors.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let cfg: LoadConfig = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check internal consistency.
    ///
    /// # Errors
    /// Zero processors or capacity, an invalid format, a partitioning column
    /// missing from the input, or an invalid table layout.
    pub fn validate(&self) -> Result<()> {
        if self.processors == 0 {
            return Err(LoadError::Capacity("at least one processor is required".into()));
        }
        if self.buffer_capacity == 0 {
            return Err(LoadError::Capacity(
                "row buffer capacity must be positive".into(),
            ));
        }
        if self.progress_interval == 0 {
            return Err(LoadError::config("progress interval must be positive"));
        }
        self.format.validate()?;
        let supplied = self.layout.supplied_positions()?;
        if let Partitioning::Column { name } = &self.partitioning {
            let pos = self.layout.position(name).ok_or_else(|| {
                LoadError::config(format!("unknown partitioning column '{name}'"))
            })?;
            if !supplied.contains(&pos) {
                return Err(LoadError::config(format!(
                    "partitioning column '{name}' is not supplied by the input"
                )));
            }
        }
        if let Some(csv) = &self.format.csv {
            for name in &csv.force_not_null {
                if self.layout.position(name).is_none() {
                    return Err(LoadError::config(format!(
                        "unknown force-not-null column '{name}'"
                    )));
                }
            }
        }
        Ok(())
    }
}
