//! Result-set rows: columns arrive decoded, output is rendered per format.

use super::csv::CsvCodec;
use super::text::escape;
use crate::config::CopyFormat;
use std::borrow::Cow;

#[derive(Debug)]
pub struct ResultSetRow {
    values: Vec<Option<String>>,
    delimiter: u8,
    null_marker: String,
    escape_backslashes: bool,
    csv: Option<CsvCodec>,
}

impl ResultSetRow {
    #[must_use]
    pub fn new(format: &CopyFormat) -> Self {
        Self {
            values: Vec::new(),
            delimiter: format.delimiter_byte(),
            null_marker: format.null_marker.clone(),
            escape_backslashes: format.escape_backslashes,
            csv: format.is_csv().then(|| CsvCodec::new(format)),
        }
    }

    pub fn set(&mut self, values: Vec<Option<String>>) {
        self.values = values;
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn value(&self, i: usize) -> Option<Cow<'_, str>> {
        self.values.get(i)?.as_deref().map(Cow::Borrowed)
    }

    pub fn insert_value(&mut self, i: usize, value: Option<&str>) {
        let i = i.min(self.values.len());
        self.values.insert(i, value.map(str::to_string));
    }

    pub fn drop_last_column(&mut self) {
        self.values.pop();
    }

    pub fn output_row(&self, out: &mut Vec<u8>) {
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                out.push(self.delimiter);
            }
            if let Some(codec) = &self.csv {
                out.extend_from_slice(&codec.encode(value.as_deref()));
                continue;
            }
            match value {
                None => out.extend_from_slice(self.null_marker.as_bytes()),
                Some(v) if self.escape_backslashes => {
                    out.extend_from_slice(&escape(v.as_bytes(), self.delimiter));
                }
                Some(v) => out.extend_from_slice(v.as_bytes()),
            }
        }
    }
}
