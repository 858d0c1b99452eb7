//! Identifier for a database node that receives rows.
//!
//! Partition maps hand out `NodeId`s, writers are keyed by them, and reports
//! aggregate row counts per `NodeId`. They are small, `Copy`, ordered and
//! hashable, so they work as keys in `BTreeMap`s (deterministic iteration for
//! commit/rollback ordering) as well as `HashMap`s.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric identifier of a destination node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    /// Create a `NodeId` from its numeric value.
    #[must_use]
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    /// Return the underlying numeric value.
    #[must_use]
    pub const fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Parses the textual node id carried in an explicit node-id column.
///
/// Surrounding whitespace is ignored; anything else must be a plain
/// non-negative integer.
impl FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u32>().map(NodeId)
    }
}
