//! Rows, column descriptors and the table layout a load writes into.

use crate::error::{LoadError, Result};
use serde::{Deserialize, Serialize};

/// One unit of input.
///
/// Raw delimited or CSV lines travel as [`Row::Bytes`]; result sets deliver
/// already-decoded columns as [`Row::Columns`] where `None` is SQL NULL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Row {
    Bytes(Vec<u8>),
    Columns(Vec<Option<String>>),
}

impl Row {
    /// Short name of the variant, for error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Row::Bytes(_) => "bytes",
            Row::Columns(_) => "columns",
        }
    }
}

impl From<&str> for Row {
    fn from(s: &str) -> Self {
        Row::Bytes(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Row {
    fn from(v: Vec<u8>) -> Self {
        Row::Bytes(v)
    }
}

/// SQL type family of a column, used to normalize partition key values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Decimal,
    Float,
    Char,
    #[default]
    Text,
    Boolean,
    Date,
    Time,
    Timestamp,
}

/// Definition of one destination table column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Declared length (e.g. `CHAR(10)`), if any.
    #[serde(default)]
    pub length: Option<u32>,
    #[serde(default)]
    pub column_type: ColumnType,
    #[serde(default)]
    pub is_serial: bool,
    #[serde(default)]
    pub is_row_id: bool,
    #[serde(default = "nullable_default")]
    pub is_nullable: bool,
    #[serde(default)]
    pub default_expression: Option<String>,
}

fn nullable_default() -> bool {
    true
}

impl ColumnDescriptor {
    /// A nullable text column without a default.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            length: None,
            column_type: ColumnType::Text,
            is_serial: false,
            is_row_id: false,
            is_nullable: true,
            default_expression: None,
        }
    }

    #[must_use]
    pub fn with_type(mut self, column_type: ColumnType) -> Self {
        self.column_type = column_type;
        self
    }

    #[must_use]
    pub fn serial(mut self) -> Self {
        self.is_serial = true;
        self.column_type = ColumnType::Integer;
        self
    }

    #[must_use]
    pub fn row_id(mut self) -> Self {
        self.is_row_id = true;
        self.column_type = ColumnType::Integer;
        self
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.is_nullable = false;
        self
    }

    #[must_use]
    pub fn with_default(mut self, expression: impl Into<String>) -> Self {
        self.default_expression = Some(expression.into());
        self
    }
}

/// Destination table: its columns in table order and which of them the
/// input supplies.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLayout {
    pub table: String,
    pub columns: Vec<ColumnDescriptor>,
    /// Names of the columns present in the input, in input order. `None`
    /// means every column is supplied.
    #[serde(default)]
    pub input_columns: Option<Vec<String>>,
}

impl TableLayout {
    pub fn new(table: impl Into<String>, columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            table: table.into(),
            columns,
            input_columns: None,
        }
    }

    #[must_use]
    pub fn with_input_columns<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_columns = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Table position of a column, matched case-insensitively.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Table positions of the supplied columns, in input order.
    ///
    /// # Errors
    /// Unknown names, duplicates, and input columns out of table order are
    /// configuration errors: generated values are spliced by table position,
    /// which only works when the input follows the table's ordering.
    pub fn supplied_positions(&self) -> Result<Vec<usize>> {
        let Some(names) = &self.input_columns else {
            return Ok((0..self.columns.len()).collect());
        };
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let pos = self
                .position(name)
                .ok_or_else(|| LoadError::config(format!("unknown column '{name}' in {}", self.table)))?;
            if let Some(&prev) = out.last()
                && pos <= prev
            {
                return Err(LoadError::config(format!(
                    "input column '{name}' is duplicated or out of table order"
                )));
            }
            out.push(pos);
        }
        Ok(out)
    }
}

/// Normalize a partitioning value so equal SQL values hash alike.
///
/// Integers and decimals lose signs, padding and insignificant zeros, floats
/// go through `f64`, `CHAR` drops trailing blanks and booleans collapse to
/// `true`/`false`. Everything else is trimmed.
#[must_use]
pub fn normalize_key(column_type: ColumnType, raw: &str) -> String {
    let v = raw.trim();
    match column_type {
        ColumnType::Integer => normalize_integer(v),
        ColumnType::Decimal => normalize_decimal(v),
        ColumnType::Float => v
            .parse::<f64>()
            .map(|f| if f == 0.0 { "0".to_string() } else { f.to_string() })
            .unwrap_or_else(|_| v.to_string()),
        ColumnType::Char => raw.trim_end_matches(' ').to_string(),
        ColumnType::Boolean => match v.to_ascii_lowercase().as_str() {
            "t" | "true" | "y" | "yes" | "on" | "1" => "true".to_string(),
            "f" | "false" | "n" | "no" | "off" | "0" => "false".to_string(),
            _ => v.to_string(),
        },
        ColumnType::Text | ColumnType::Date | ColumnType::Time | ColumnType::Timestamp => {
            v.to_string()
        }
    }
}

fn split_sign(v: &str) -> (bool, &str) {
    if let Some(rest) = v.strip_prefix('-') {
        (true, rest)
    } else {
        (false, v.strip_prefix('+').unwrap_or(v))
    }
}

fn normalize_integer(v: &str) -> String {
    let (negative, digits) = split_sign(v);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return v.to_string();
    }
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        "0".to_string()
    } else if negative {
        format!("-{digits}")
    } else {
        digits.to_string()
    }
}

fn normalize_decimal(v: &str) -> String {
    let (negative, body) = split_sign(v);
    let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
    let numeric = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if (int_part.is_empty() && frac_part.is_empty()) || !numeric(int_part) || !numeric(frac_part) {
        return v.to_string();
    }
    let int_part = int_part.trim_start_matches('0');
    let frac_part = frac_part.trim_end_matches('0');
    let int_part = if int_part.is_empty() { "0" } else { int_part };
    let mut out = String::with_capacity(body.len() + 1);
    if negative && (int_part != "0" || !frac_part.is_empty()) {
        out.push('-');
    }
    out.push_str(int_part);
    if !frac_part.is_empty() {
        out.push('.');
        out.push_str(frac_part);
    }
    out
}
