//! Error taxonomy for the loading pipeline and the client bulk loader.

use crate::NodeId;
use std::time::Duration;
use thiserror::Error;

/// Result type for loader operations
pub type Result<T> = std::result::Result<T, LoadError>;

/// Errors raised while reading, routing, writing or retrying rows
#[derive(Debug, Error)]
pub enum LoadError {
    /// A row could not be parsed or violates the table layout
    #[error("malformed row at line {line}: {reason}")]
    MalformedRow {
        /// 1-based row/line number as seen by the component that failed
        line: u64,
        /// What was wrong with the row
        reason: String,
    },

    /// A non-CSV text stream switched line terminator style
    #[error("mixed line ends at line {line}: expected {expected}, found {found}")]
    MixedLineEnds {
        /// Line on which the second style was seen
        line: u64,
        /// Style established by the first terminated line
        expected: &'static str,
        /// Style that broke the pattern
        found: &'static str,
    },

    /// Buffer or worker pool misconfigured
    #[error("capacity error: {0}")]
    Capacity(String),

    /// A generated-value provider cannot hand out more values
    #[error("generator '{name}' exhausted")]
    GeneratorExhausted {
        /// Provider name
        name: String,
    },

    /// The sink for one node failed
    #[error("sink failure on {node}: {message}")]
    Sink {
        /// Node whose sink failed
        node: NodeId,
        /// Error reported by the sink
        message: String,
    },

    /// The sink process outlived its grace period after finish
    #[error("sink on {node} did not finish within {grace:?} and was terminated")]
    SinkTimeout {
        /// Node whose sink was killed
        node: NodeId,
        /// Grace period that elapsed
        grace: Duration,
    },

    /// The partition map lists the same node twice
    #[error("duplicate node {0} while building writers")]
    DuplicateNode(NodeId),

    /// A row resolved to a node that has no writer
    #[error("no writer for {0}")]
    UnknownNode(NodeId),

    /// A writer operation is not allowed in its current state
    #[error("{node}: cannot {op} while {state}")]
    InvalidState {
        /// Writer node
        node: NodeId,
        /// Attempted operation
        op: &'static str,
        /// Current lifecycle state
        state: &'static str,
    },

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The row buffer was finished or cancelled
    #[error("load cancelled")]
    Cancelled,

    /// Client bulk loader rejected more rows than allowed
    #[error("error budget exceeded after {rejected_rows} rejected rows ({lines_consumed} input lines consumed)")]
    ErrorBudgetExceeded {
        /// Input lines fully accounted for, so a rerun can resume after them
        lines_consumed: u64,
        /// Rows written to the reject file
        rejected_rows: u64,
    },

    /// I/O failure reading input or writing output
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON configuration could not be parsed
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LoadError {
    /// Create a MalformedRow error
    #[inline]
    pub fn malformed(line: u64, reason: impl Into<String>) -> Self {
        Self::MalformedRow {
            line,
            reason: reason.into(),
        }
    }

    /// Create a Sink error
    #[inline]
    pub fn sink(node: NodeId, message: impl Into<String>) -> Self {
        Self::Sink {
            node,
            message: message.into(),
        }
    }

    /// Create a Config error
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a GeneratorExhausted error
    #[inline]
    pub fn exhausted(name: impl Into<String>) -> Self {
        Self::GeneratorExhausted { name: name.into() }
    }

    /// True for the cooperative cancellation condition
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
