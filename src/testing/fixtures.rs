//! Pre-built sources and datasets for testing loads.

use crate::NodeId;
use crate::config::{CopyFormat, LoadConfig, Partitioning};
use crate::error::{LoadError, Result};
use crate::readers::{CopyStream, ResultSetSource};
use crate::routing::{PartitionMap, StaticPartitionMap};
use crate::row::{ColumnDescriptor, ColumnType, TableLayout};
use std::collections::VecDeque;
use std::sync::Arc;

pub const NODE1: NodeId = NodeId::new(1);
pub const NODE2: NodeId = NodeId::new(2);

/// `orders(id integer, region char(1))`, pipe-delimited text, partitioned
/// on `region`.
///
/// # Example
///
/// ```
/// use ironload::testing::two_node_config;
///
/// let config = two_node_config(2);
/// assert_eq!(config.processors, 2);
/// config.validate().unwrap();
/// ```
#[must_use]
pub fn two_node_config(processors: usize) -> LoadConfig {
    let mut region = ColumnDescriptor::new("region").with_type(ColumnType::Char);
    region.length = Some(1);
    LoadConfig::new(
        TableLayout::new(
            "orders",
            vec![
                ColumnDescriptor::new("id").with_type(ColumnType::Integer),
                region,
            ],
        ),
        CopyFormat::text('|'),
        Partitioning::Column {
            name: "region".into(),
        },
    )
    .with_processors(processors)
    .with_buffer_capacity(4)
}

/// Regions `A` and `B` on [`NODE1`], `C` on [`NODE2`].
#[must_use]
pub fn two_node_map() -> Arc<dyn PartitionMap> {
    Arc::new(
        StaticPartitionMap::new([NODE1, NODE2])
            .assign(["A", "B"], NODE1)
            .assign(["C"], NODE2),
    )
}

/// Five `orders` rows: three for [`NODE1`], two for [`NODE2`].
#[must_use]
pub fn five_rows() -> Vec<&'static str> {
    vec!["1|A", "2|B", "3|C", "4|B", "5|C"]
}

/// A result set served from memory.
#[derive(Clone, Debug, Default)]
pub struct VecResultSet {
    rows: VecDeque<Vec<Option<String>>>,
}

impl VecResultSet {
    pub fn new(rows: Vec<Vec<Option<String>>>) -> Self {
        Self { rows: rows.into() }
    }

    /// Rows of non-NULL text columns.
    pub fn from_strs<'a>(rows: impl IntoIterator<Item = &'a [&'a str]>) -> Self {
        Self::new(
            rows.into_iter()
                .map(|r| r.iter().map(|v| Some((*v).to_string())).collect())
                .collect(),
        )
    }
}

impl ResultSetSource for VecResultSet {
    fn next_row(&mut self) -> Result<Option<Vec<Option<String>>>> {
        Ok(self.rows.pop_front())
    }
}

/// A server COPY stream served from memory, optionally failing with an I/O
/// error once its rows are exhausted.
#[derive(Clone, Debug, Default)]
pub struct VecCopyStream {
    rows: VecDeque<Vec<u8>>,
    failure: Option<String>,
}

impl VecCopyStream {
    pub fn new<I, S>(rows: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Self {
            rows: rows.into_iter().map(|r| r.as_ref().to_vec()).collect(),
            failure: None,
        }
    }

    pub fn failing_after<I, S>(rows: I, message: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Self {
            failure: Some(message.into()),
            ..Self::new(rows)
        }
    }
}

impl CopyStream for VecCopyStream {
    fn read_row(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(row) = self.rows.pop_front() {
            return Ok(Some(row));
        }
        match &self.failure {
            Some(message) => Err(LoadError::Io(std::io::Error::other(message.clone()))),
            None => Ok(None),
        }
    }
}
