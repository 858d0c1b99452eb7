//! Partition maps and per-row destination resolution.
//!
//! The catalog's partition map is consumed through the [`PartitionMap`]
//! trait. Two implementations ship with the crate:
//!
//! - [`StaticPartitionMap`] - explicit value lists per node (list
//!   partitioning), with optional default and NULL partitions.
//! - [`HashPartitionMap`] - a bucket table addressed by the hash of the
//!   normalized key, optionally replicated to every node.
//!
//! [`Router`] applies the load's [`Partitioning`] mode to a parsed row.

use crate::NodeId;
use crate::config::Partitioning;
use crate::error::{LoadError, Result};
use crate::row::{ColumnType, TableLayout, normalize_key};
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

/// Mapping from partition key values to destination nodes.
pub trait PartitionMap: Send + Sync {
    /// Every node that can receive rows; one writer is built per entry.
    fn nodes(&self) -> Vec<NodeId>;

    /// Nodes for a normalized key, or for `None` (NULL key / replicated
    /// table). More than one node means the row is replicated.
    fn nodes_for(&self, key: Option<&str>) -> Vec<NodeId>;
}

/// Policy for group-by hash routing: the first node the map lists wins.
///
/// Maps are expected to return a single node per hash. When one returns
/// several, nothing ranks them, so the first listed is taken as is.
#[must_use]
pub fn first_listed_node(nodes: &[NodeId]) -> Option<NodeId> {
    nodes.first().copied()
}

/// List partitioning with explicit value assignments.
#[derive(Clone, Debug, Default)]
pub struct StaticPartitionMap {
    nodes: Vec<NodeId>,
    assignments: BTreeMap<String, Vec<NodeId>>,
    null_nodes: Vec<NodeId>,
    default_nodes: Vec<NodeId>,
}

impl StaticPartitionMap {
    /// A map over `nodes` with no assignments yet.
    pub fn new(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            nodes: nodes.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Route each of `values` to `node` (in addition to earlier assignments).
    #[must_use]
    pub fn assign<I, S>(mut self, values: I, node: NodeId) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for v in values {
            let entry = self.assignments.entry(v.into()).or_default();
            if !entry.contains(&node) {
                entry.push(node);
            }
        }
        self
    }

    /// Nodes for NULL keys.
    #[must_use]
    pub fn with_null_nodes(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.null_nodes = nodes.into_iter().collect();
        self
    }

    /// Nodes for values without an assignment.
    #[must_use]
    pub fn with_default_nodes(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.default_nodes = nodes.into_iter().collect();
        self
    }
}

impl PartitionMap for StaticPartitionMap {
    fn nodes(&self) -> Vec<NodeId> {
        self.nodes.clone()
    }

    fn nodes_for(&self, key: Option<&str>) -> Vec<NodeId> {
        match key {
            None => self.null_nodes.clone(),
            Some(k) => self
                .assignments
                .get(k)
                .cloned()
                .unwrap_or_else(|| self.default_nodes.clone()),
        }
    }
}

/// Hash partitioning over a fixed bucket table.
#[derive(Clone, Debug)]
pub struct HashPartitionMap {
    nodes: Vec<NodeId>,
    buckets: Vec<NodeId>,
    replicated: bool,
}

impl HashPartitionMap {
    /// Default bucket table size.
    pub const BUCKETS: usize = 1024;

    /// Spread [`Self::BUCKETS`] buckets round-robin over `nodes`.
    ///
    /// # Errors
    /// An empty node list.
    pub fn new(nodes: Vec<NodeId>) -> Result<Self> {
        Self::with_buckets(nodes, Self::BUCKETS)
    }

    /// Spread `bucket_count` buckets round-robin over `nodes`.
    ///
    /// # Errors
    /// An empty node list or zero buckets.
    pub fn with_buckets(nodes: Vec<NodeId>, bucket_count: usize) -> Result<Self> {
        if nodes.is_empty() || bucket_count == 0 {
            return Err(LoadError::config(
                "hash partition map needs at least one node and one bucket",
            ));
        }
        let buckets = (0..bucket_count).map(|b| nodes[b % nodes.len()]).collect();
        Ok(Self {
            nodes,
            buckets,
            replicated: false,
        })
    }

    /// Every key maps to every node.
    #[must_use]
    pub fn replicated(mut self) -> Self {
        self.replicated = true;
        self
    }

    /// A map over `nodes` suited to `partitioning`: replicated for
    /// [`Partitioning::Replicated`], hashed otherwise.
    ///
    /// # Errors
    /// An empty node list.
    pub fn for_partitioning(nodes: Vec<NodeId>, partitioning: &Partitioning) -> Result<Self> {
        let map = Self::new(nodes)?;
        Ok(match partitioning {
            Partitioning::Replicated => map.replicated(),
            _ => map,
        })
    }

    /// Bucket index for a normalized key; NULL keys use bucket 0.
    #[must_use]
    pub fn bucket_of(&self, key: Option<&str>) -> usize {
        match key {
            None => 0,
            Some(k) => {
                let mut h = DefaultHasher::new();
                k.hash(&mut h);
                (h.finish() % self.buckets.len() as u64) as usize
            }
        }
    }
}

impl PartitionMap for HashPartitionMap {
    fn nodes(&self) -> Vec<NodeId> {
        self.nodes.clone()
    }

    fn nodes_for(&self, key: Option<&str>) -> Vec<NodeId> {
        if self.replicated {
            return self.nodes.clone();
        }
        vec![self.buckets[self.bucket_of(key)]]
    }
}

enum RouteMode {
    Column { input: usize, column_type: ColumnType },
    ExplicitNode,
    GroupByHash,
    Replicated(Vec<NodeId>),
}

/// Resolves the destination nodes of parsed rows for one load.
pub struct Router {
    mode: RouteMode,
    map: Arc<dyn PartitionMap>,
}

impl Router {
    /// Bind a partitioning mode to the layout and map of a load.
    ///
    /// # Errors
    /// A partitioning column the input does not supply, or a replicated map
    /// returning no nodes.
    pub fn new(
        partitioning: &Partitioning,
        layout: &TableLayout,
        map: Arc<dyn PartitionMap>,
    ) -> Result<Self> {
        let mode = match partitioning {
            Partitioning::Column { name } => {
                let pos = layout.position(name).ok_or_else(|| {
                    LoadError::config(format!("unknown partitioning column '{name}'"))
                })?;
                let input = layout
                    .supplied_positions()?
                    .iter()
                    .position(|&p| p == pos)
                    .ok_or_else(|| {
                        LoadError::config(format!("partitioning column '{name}' is not supplied"))
                    })?;
                RouteMode::Column {
                    input,
                    column_type: layout.columns[pos].column_type,
                }
            }
            Partitioning::ExplicitNode => RouteMode::ExplicitNode,
            Partitioning::GroupByHash => RouteMode::GroupByHash,
            Partitioning::Replicated => {
                let nodes = map.nodes_for(None);
                if nodes.is_empty() {
                    return Err(LoadError::config("replicated table has no nodes"));
                }
                RouteMode::Replicated(nodes)
            }
        };
        Ok(Self { mode, map })
    }

    /// True when the last input column carries the node id.
    #[must_use]
    pub fn uses_node_column(&self) -> bool {
        matches!(self.mode, RouteMode::ExplicitNode)
    }

    /// Input column index of the partitioning column, if any.
    #[must_use]
    pub fn key_column(&self) -> Option<usize> {
        match self.mode {
            RouteMode::Column { input, .. } => Some(input),
            _ => None,
        }
    }

    /// Fill `out` with the destinations of one row.
    ///
    /// `value` reads an input column (`None` = NULL), `column_count` is the
    /// row's input column count and `group_hash` the reader-supplied hash.
    ///
    /// # Errors
    /// Unparseable node ids, keys with no partition, or a group-by load
    /// whose reader supplied no hash.
    pub fn resolve<'a>(
        &self,
        value: impl Fn(usize) -> Option<std::borrow::Cow<'a, str>>,
        column_count: usize,
        group_hash: Option<&str>,
        line: u64,
        out: &mut Vec<NodeId>,
    ) -> Result<()> {
        out.clear();
        if let RouteMode::ExplicitNode = self.mode {
            let raw = column_count
                .checked_sub(1)
                .and_then(&value)
                .ok_or_else(|| LoadError::malformed(line, "missing node id column"))?;
            let node = raw
                .parse::<NodeId>()
                .map_err(|_| LoadError::malformed(line, format!("invalid node id '{raw}'")))?;
            out.push(node);
            return Ok(());
        }
        if let Some(hash) = group_hash {
            let nodes = self.map.nodes_for(Some(hash));
            let node = first_listed_node(&nodes).ok_or_else(|| {
                LoadError::malformed(line, format!("no node for group hash '{hash}'"))
            })?;
            out.push(node);
            return Ok(());
        }
        match &self.mode {
            RouteMode::Column { input, column_type } => {
                let key = value(*input).map(|v| normalize_key(*column_type, &v));
                out.extend(self.map.nodes_for(key.as_deref()));
                if out.is_empty() {
                    return Err(LoadError::malformed(
                        line,
                        format!("no partition for key {:?}", key.as_deref().unwrap_or("NULL")),
                    ));
                }
            }
            RouteMode::Replicated(nodes) => out.extend_from_slice(nodes),
            RouteMode::GroupByHash => {
                return Err(LoadError::config(
                    "group-by routing requires the reader to supply hash columns",
                ));
            }
            RouteMode::ExplicitNode => {}
        }
        Ok(())
    }
}

/// Check a partition map's node list for duplicates.
///
/// # Errors
/// [`LoadError::DuplicateNode`] for the first repeated id.
pub fn distinct_nodes(nodes: &[NodeId]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for node in nodes {
        if !seen.insert(*node) {
            return Err(LoadError::DuplicateNode(*node));
        }
    }
    Ok(())
}
