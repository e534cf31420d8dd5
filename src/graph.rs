//! Session graph construction.
//!
//! Every session becomes a small directed graph over its distinct items:
//! an edge `u -> v` exists when `v` immediately follows `u` somewhere in the
//! session. Repeated transitions collapse to a single edge.
//!
//! # Adjacency layout
//!
//! For a batch whose largest session has `N` distinct items, each session's
//! adjacency is an `N x 2N` matrix holding two row-normalised halves:
//!
//! ```text
//!             incoming (N)                 outgoing (N)
//! row v  [ A[u][v] / indeg(v) for u ]  [ A[v][w] / outdeg(v) for w ]
//! ```
//!
//! Nodes with no incoming (outgoing) edges keep an all-zero half: a zero
//! degree is treated as 1 before dividing.
//!
//! # Alias indices
//!
//! `alias_inputs[b][l]` is the position of the item at sequence position `l`
//! within session `b`'s sorted unique-node list. Padding positions alias to
//! node 0; their features are removed downstream by the sequence mask.

use std::collections::HashMap;

use candle_core::{Device, Tensor};
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;

use crate::data::{ItemId, SessionBatch, SessionDataset, PADDING};
use crate::error::{Error, Result};

/// Node index used for padding positions.
pub const PADDING_ALIAS: u32 = 0;

/// Graph view of one mini-batch, still in host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphBatch {
    /// Sorted unique item ids per session, zero-padded to `n_node`.
    pub items: Vec<Vec<ItemId>>,
    /// Row-major `n_node x 2 * n_node` adjacency per session.
    pub adjacency: Vec<Vec<f32>>,
    /// Node index per sequence position.
    pub alias_inputs: Vec<Vec<u32>>,
    pub mask: Vec<Vec<u8>>,
    pub targets: Vec<ItemId>,
    n_node: usize,
}

impl GraphBatch {
    /// Build session graphs for every row of `batch`.
    pub fn build(batch: &SessionBatch) -> Result<Self> {
        if batch.is_empty() {
            return Err(Error::EmptyBatch);
        }

        let nodes: Vec<Vec<ItemId>> = batch.inputs().iter().map(|s| unique_nodes(s)).collect();
        let n_node = nodes.iter().map(Vec::len).max().unwrap_or(0).max(1);

        let mut items = Vec::with_capacity(batch.len());
        let mut adjacency = Vec::with_capacity(batch.len());
        let mut alias_inputs = Vec::with_capacity(batch.len());

        for (input, node) in batch.inputs().iter().zip(&nodes) {
            adjacency.push(session_adjacency(input, node, n_node));
            alias_inputs.push(alias(input, node)?);

            let mut padded = node.clone();
            padded.resize(n_node, PADDING);
            items.push(padded);
        }

        Ok(Self {
            items,
            adjacency,
            alias_inputs,
            mask: batch.mask().to_vec(),
            targets: batch.targets().to_vec(),
            n_node,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.items.len()
    }

    /// Batch-wide maximum unique-node count `N`.
    pub fn n_node(&self) -> usize {
        self.n_node
    }

    /// Padded sequence length `L`.
    pub fn seq_len(&self) -> usize {
        self.alias_inputs.first().map_or(0, Vec::len)
    }

    /// Normalised weight of the incoming edge `from -> to` in session `b`.
    pub fn in_weight(&self, b: usize, from: usize, to: usize) -> f32 {
        self.adjacency[b][to * 2 * self.n_node + from]
    }

    /// Normalised weight of the outgoing edge `from -> to` in session `b`.
    pub fn out_weight(&self, b: usize, from: usize, to: usize) -> f32 {
        self.adjacency[b][from * 2 * self.n_node + self.n_node + to]
    }

    /// Index of the last real position of each session.
    pub fn last_positions(&self) -> Vec<u32> {
        self.mask
            .iter()
            .map(|m| m.iter().filter(|&&v| v == 1).count().saturating_sub(1) as u32)
            .collect()
    }

    /// Move the batch onto `device`.
    pub fn to_tensors(&self, device: &Device) -> Result<BatchTensors> {
        let b = self.batch_size();
        let n = self.n_node;
        let l = self.seq_len();

        let items = Tensor::from_vec(self.items.concat(), (b, n), device)?;
        let adjacency = Tensor::from_vec(self.adjacency.concat(), (b, n, 2 * n), device)?;
        let alias_inputs = Tensor::from_vec(self.alias_inputs.concat(), (b, l), device)?;
        let mask: Vec<f32> = self.mask.iter().flatten().map(|&m| f32::from(m)).collect();
        let mask = Tensor::from_vec(mask, (b, l), device)?;
        let last = Tensor::from_vec(self.last_positions(), b, device)?;
        // zero-based class indices for the loss
        let targets: Vec<u32> = self.targets.iter().map(|&t| t - 1).collect();
        let targets = Tensor::from_vec(targets, b, device)?;

        Ok(BatchTensors {
            items,
            adjacency,
            alias_inputs,
            mask,
            last,
            targets,
        })
    }
}

/// Device-side tensors for one batch.
#[derive(Debug, Clone)]
pub struct BatchTensors {
    /// `(B, N)` u32 item ids.
    pub items: Tensor,
    /// `(B, N, 2N)` f32 adjacency.
    pub adjacency: Tensor,
    /// `(B, L)` u32 node index per position.
    pub alias_inputs: Tensor,
    /// `(B, L)` f32 sequence mask.
    pub mask: Tensor,
    /// `(B,)` u32 last real position.
    pub last: Tensor,
    /// `(B,)` u32 zero-based targets.
    pub targets: Tensor,
}

impl SessionDataset {
    /// Slice rows `indices` and build their session graphs.
    pub fn get_slice(&self, indices: &[usize]) -> Result<GraphBatch> {
        GraphBatch::build(&self.slice(indices)?)
    }
}

fn unique_nodes(input: &[ItemId]) -> Vec<ItemId> {
    let mut node: Vec<ItemId> = input.iter().copied().filter(|&id| id != PADDING).collect();
    node.sort_unstable();
    node.dedup();
    node
}

fn node_index(node: &[ItemId], id: ItemId) -> Option<usize> {
    node.binary_search(&id).ok()
}

fn alias(input: &[ItemId], node: &[ItemId]) -> Result<Vec<u32>> {
    input
        .iter()
        .map(|&id| {
            if id == PADDING {
                return Ok(PADDING_ALIAS);
            }
            node_index(node, id)
                .map(|i| i as u32)
                .ok_or_else(|| Error::InvalidSession(format!("item {id} missing from node set")))
        })
        .collect()
}

fn session_adjacency(input: &[ItemId], node: &[ItemId], n_node: usize) -> Vec<f32> {
    let mut edges = vec![0f32; n_node * n_node];
    for pair in input.windows(2) {
        if pair[1] == PADDING {
            break;
        }
        if let (Some(u), Some(v)) = (node_index(node, pair[0]), node_index(node, pair[1])) {
            edges[u * n_node + v] = 1.0;
        }
    }

    let mut in_deg = vec![0f32; n_node];
    let mut out_deg = vec![0f32; n_node];
    for u in 0..n_node {
        for v in 0..n_node {
            let w = edges[u * n_node + v];
            out_deg[u] += w;
            in_deg[v] += w;
        }
    }
    for deg in in_deg.iter_mut().chain(out_deg.iter_mut()) {
        if *deg == 0.0 {
            *deg = 1.0;
        }
    }

    let width = 2 * n_node;
    let mut adjacency = vec![0f32; n_node * width];
    for u in 0..n_node {
        for v in 0..n_node {
            let w = edges[u * n_node + v];
            if w == 0.0 {
                continue;
            }
            adjacency[v * width + u] = w / in_deg[v];
            adjacency[u * width + n_node + v] = w / out_deg[u];
        }
    }
    adjacency
}

/// Global item-transition graph over a whole partition.
///
/// Edge weights start as transition counts; each node's incoming weights are
/// then normalised to sum to one.
#[derive(Debug, Clone, Default)]
pub struct TransitionGraph {
    graph: DiGraphMap<ItemId, f32>,
}

impl TransitionGraph {
    pub fn from_sessions<'a, I>(sessions: I) -> Self
    where
        I: IntoIterator<Item = &'a [ItemId]>,
    {
        let mut graph: DiGraphMap<ItemId, f32> = DiGraphMap::new();
        for session in sessions {
            for pair in session.windows(2) {
                let count = graph.edge_weight(pair[0], pair[1]).copied().unwrap_or(0.0);
                graph.add_edge(pair[0], pair[1], count + 1.0);
            }
        }

        let mut in_sum: HashMap<ItemId, f32> = HashMap::new();
        for (_, to, &w) in graph.all_edges() {
            *in_sum.entry(to).or_insert(0.0) += w;
        }
        let edges: Vec<(ItemId, ItemId)> = graph.all_edges().map(|(a, b, _)| (a, b)).collect();
        for (from, to) in edges {
            let total = in_sum.get(&to).copied().unwrap_or(0.0);
            if total > 0.0 {
                if let Some(w) = graph.edge_weight_mut(from, to) {
                    *w /= total;
                }
            }
        }

        Self { graph }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn weight(&self, from: ItemId, to: ItemId) -> Option<f32> {
        self.graph.edge_weight(from, to).copied()
    }

    /// Up to `k` successors of `item`, heaviest first.
    pub fn top_successors(&self, item: ItemId, k: usize) -> Vec<(ItemId, f32)> {
        if !self.graph.contains_node(item) {
            return Vec::new();
        }
        let mut next: Vec<(ItemId, f32)> = self
            .graph
            .neighbors_directed(item, Direction::Outgoing)
            .filter_map(|to| self.weight(item, to).map(|w| (to, w)))
            .collect();
        next.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        next.truncate(k);
        next
    }
}
