//! Graph model: blocks connected by edges, validated once at load.
//!
//! A workflow is a directed graph of [`Block`]s. Edges carry a condition
//! (`always`, `conditional`, `on_failure`) and may be satisfied when their
//! source is skipped. The only permitted cycle is the back edge from a
//! `loop-end` to its `loop-start`.
//!
//! [`Graph::validate`] turns a graph into a [`ValidatedGraph`]: an immutable
//! value with adjacency, topological order, loop regions, and parsed
//! expressions precomputed. Runs only ever start against a validated graph.

pub mod block;
pub mod edge;
mod validate;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use braid_core::error::{BraidError, Result, ValidationError};
use braid_core::types::BlockId;

use crate::expr::{CompiledInput, Guard};

pub use block::{Block, BlockMode, FailureMode, InputExpr, JoinMode};
pub use edge::{Edge, EdgeCondition};
pub use validate::validate;

/// A workflow definition as authored and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Block the run starts at.
    pub entry: BlockId,
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn new(id: impl Into<String>, entry: impl Into<BlockId>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            entry: entry.into(),
            blocks: vec![],
            edges: vec![],
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_block(mut self, block: Block) -> Self {
        self.blocks.push(block);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Parse a graph from its JSON definition.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn validate(self) -> std::result::Result<ValidatedGraph, ValidationError> {
        validate(self)
    }
}

/// A loop region: the blocks between a loop-start and its loop-end.
#[derive(Debug, Clone)]
pub struct LoopRegion {
    pub start: BlockId,
    pub end: BlockId,
    /// Every block reachable from `start` without passing through `end`,
    /// in declaration order. Includes `end`, excludes `start`.
    pub body: Vec<BlockId>,
    pub max_iterations: Option<u32>,
    pub(crate) condition: Guard,
}

impl LoopRegion {
    pub fn contains(&self, id: &str) -> bool {
        self.body.iter().any(|b| b == id)
    }

    /// The continuation predicate.
    pub fn condition(&self) -> &Guard {
        &self.condition
    }
}

/// An immutable graph that passed validation, with lookup tables for the
/// scheduler and executor.
#[derive(Debug)]
pub struct ValidatedGraph {
    pub(crate) graph: Graph,
    pub(crate) index: HashMap<BlockId, usize>,
    /// Forward (non-back) edge indices into each block, declaration order.
    pub(crate) incoming: Vec<Vec<usize>>,
    /// Forward edge indices out of each block, declaration order.
    pub(crate) outgoing: Vec<Vec<usize>>,
    pub(crate) back_edges: Vec<bool>,
    pub(crate) topo: Vec<usize>,
    pub(crate) inputs: Vec<BTreeMap<String, CompiledInput>>,
    pub(crate) guards: Vec<Option<Guard>>,
    pub(crate) loops: Vec<LoopRegion>,
    pub(crate) loop_by_start: HashMap<BlockId, usize>,
    pub(crate) loop_by_end: HashMap<BlockId, usize>,
}

impl ValidatedGraph {
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn id(&self) -> &str {
        &self.graph.id
    }

    pub fn entry(&self) -> &str {
        &self.graph.entry
    }

    pub fn blocks(&self) -> &[Block] {
        &self.graph.blocks
    }

    pub fn edges(&self) -> &[Edge] {
        &self.graph.edges
    }

    pub fn len(&self) -> usize {
        self.graph.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.blocks.is_empty()
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.index_of(id).map(|i| &self.graph.blocks[i])
    }

    pub fn block_at(&self, idx: usize) -> &Block {
        &self.graph.blocks[idx]
    }

    pub fn edge(&self, edge_idx: usize) -> &Edge {
        &self.graph.edges[edge_idx]
    }

    /// Forward edges into a block.
    pub fn incoming(&self, idx: usize) -> &[usize] {
        &self.incoming[idx]
    }

    /// Forward edges out of a block, in declaration order.
    pub fn outgoing(&self, idx: usize) -> &[usize] {
        &self.outgoing[idx]
    }

    pub fn is_back_edge(&self, edge_idx: usize) -> bool {
        self.back_edges[edge_idx]
    }

    /// Block indices in topological order of the forward graph.
    pub fn topo_order(&self) -> &[usize] {
        &self.topo
    }

    pub fn guard(&self, edge_idx: usize) -> Option<&Guard> {
        self.guards[edge_idx].as_ref()
    }

    pub fn inputs(&self, idx: usize) -> &BTreeMap<String, CompiledInput> {
        &self.inputs[idx]
    }

    pub fn loops(&self) -> &[LoopRegion] {
        &self.loops
    }

    pub fn loop_starting_at(&self, start: &str) -> Option<&LoopRegion> {
        self.loop_by_start.get(start).map(|&i| &self.loops[i])
    }

    pub fn loop_ending_at(&self, end: &str) -> Option<&LoopRegion> {
        self.loop_by_end.get(end).map(|&i| &self.loops[i])
    }

    /// Ids of the sources of a block's forward incoming edges.
    pub fn predecessors(&self, idx: usize) -> Vec<&str> {
        let mut preds: Vec<&str> = self.incoming[idx]
            .iter()
            .map(|&e| self.graph.edges[e].from.as_str())
            .collect();
        preds.dedup();
        preds
    }
}

impl TryFrom<Graph> for ValidatedGraph {
    type Error = BraidError;

    fn try_from(graph: Graph) -> Result<Self> {
        Ok(validate(graph)?)
    }
}
