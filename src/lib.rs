//! # ironload
//!
//! A **bulk data loader** for partitioned, multi-node SQL databases. Rows
//! stream from a source through a bounded buffer into parallel processors
//! that route each row to the node(s) owning its partition and pipe it into
//! one sink per node. All sinks commit together or roll back together.
//!
//! ## Key Features
//!
//! - **Sources** - result sets, server-side COPY streams, and raw delimited
//!   or CSV files (compressed or not, glob-expanded)
//! - **Formats** - COPY text with backslash escapes and CSV with quoted
//!   fields spanning lines
//! - **Routing** - by partitioning column, by an explicit node-id column,
//!   by a group-by hash, or replicated to every node
//! - **Generated values** - serial and row-id columns and column defaults
//!   spliced into rows that lack them
//! - **Sinks** - an external loader process per node or a native COPY
//!   channel, with an all-or-nothing commit
//! - **Client bulk loading** - chunked commits that isolate bad rows into a
//!   reject file by recursive subdivision
//!
//! ## Quick Start
//!
//! ```no_run
//! use ironload::config::{CopyFormat, LoadConfig, Partitioning};
//! use ironload::orchestrator::{LoadOrchestrator, WorkerPool};
//! use ironload::readers::RawStreamReader;
//! use ironload::routing::StaticPartitionMap;
//! use ironload::row::{ColumnDescriptor, TableLayout};
//! use ironload::writers::{ProcessWriterConfig, ProcessWriterFactory};
//! use ironload::NodeId;
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let (n1, n2) = (NodeId::new(1), NodeId::new(2));
//! let config = LoadConfig::new(
//!     TableLayout::new("orders", vec![ColumnDescriptor::new("id"), ColumnDescriptor::new("region")]),
//!     CopyFormat::text('|'),
//!     Partitioning::Column { name: "region".into() },
//! );
//! let map = StaticPartitionMap::new([n1, n2])
//!     .assign(["A", "B"], n1)
//!     .assign(["C"], n2);
//! let sinks = ProcessWriterFactory::new(ProcessWriterConfig::from_json_file("sinks.json")?)?;
//!
//! let pool = WorkerPool::for_processors(config.processors)?;
//! let report = LoadOrchestrator::new(&pool, config, Arc::new(map), Arc::new(sinks))?
//!     .run(RawStreamReader::open(&["orders-*.tbl.gz"])?)?;
//! println!("{} rows loaded", report.rows_loaded);
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### RowBuffer
//!
//! A [`RowBuffer`] is the only structure shared between the reader thread
//! and the processors: a bounded FIFO whose `put` blocks while full and
//! whose `get` blocks while empty. Marking it finished releases every
//! waiter; cancelling it also drops the queued rows.
//!
//! ### Readers and processors
//!
//! Exactly one [`RowReader`](readers::RowReader) fills the buffer and always
//! marks it finished, even on error. Each
//! [`RowProcessor`](processor::RowProcessor) owns one writer per node and a
//! parser for the input format, and writes every row to all of its
//! destinations before taking the next.
//!
//! ### Writers
//!
//! A [`NodeWriter`](writers::NodeWriter) follows
//! `Created → Started → Finished → Committed | RolledBack → Closed`; any
//! failure parks it in `Failed`. [`finish_load`](orchestrator::finish_load)
//! commits every writer only when all of them finished cleanly.
//!
//! ### Bulk loader
//!
//! [`BulkLoader`](chunk_retry::BulkLoader) is the client-side path: it
//! commits fixed-size chunks, splits rejected chunks until the bad rows are
//! isolated, and stops with the number of lines consumed once its error
//! budget runs out.
//!
//! ## Logging
//!
//! The library logs through [`tracing`]; install a subscriber (the
//! `ironload` binary uses `tracing-subscriber` with `RUST_LOG`) to see
//! progress checkpoints and lifecycle events.

pub mod chunk_retry;
pub mod config;
pub mod error;
pub mod generated;
pub mod io;
pub mod metrics;
pub mod node_id;
pub mod orchestrator;
pub mod processor;
pub mod readers;
pub mod routing;
pub mod row;
pub mod row_buffer;
pub mod testing;
pub mod writers;

// Re-export commonly used items
pub use chunk_retry::{BulkLoadOptions, BulkLoadSummary, BulkLoader, SubmitOutcome};
pub use config::{CopyFormat, LoadConfig, Partitioning};
pub use error::{LoadError, Result};
pub use node_id::NodeId;
pub use orchestrator::{LoadOrchestrator, LoadReport, WorkerPool};
pub use row::Row;
pub use row_buffer::RowBuffer;
