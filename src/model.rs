//! Session-graph recommenders as one capability-tagged pipeline.
//!
//! Every graph variant runs the same four stages:
//!
//! ```text
//! embed      items (B, N)            -> node features (B, N, H)
//! propagate  adjacency, features     -> node features (B, N, H)
//! pool       alias, mask, features   -> SessionRepr  (B, H) or (B, C, H)
//! score      SessionRepr, table      -> logits (B, C)
//! ```
//!
//! and differs only in which optional stages it switches on:
//!
//! | Variant | Target attention | Self-attention | L2 norm | Scale |
//! |---------|------------------|----------------|---------|-------|
//! | SR-GNN  |                  |                |         |       |
//! | TAGNN   | yes              |                |         |       |
//! | TAGNN++ | yes              | yes            |         |       |
//! | NISER   |                  |                | yes     | 16    |
//!
//! NARM reuses the embed and score stages but replaces propagation and
//! pooling with a recurrent encoder ([`NarmEncoder`]) and scores through a
//! learned projection of the item table.
//!
//! # References
//!
//! - Wu et al., "Session-based Recommendation with Graph Neural Networks", AAAI 2019.
//! - Yu et al., "TAGNN: Target Attentive Graph Neural Networks for
//!   Session-based Recommendation", SIGIR 2020.
//! - Gupta et al., "NISER: Normalized Item and Session Representations to
//!   Handle Popularity Bias", 2019.
//! - Li et al., "Neural Attentive Session-based Recommendation", CIKM 2017.

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

use crate::conv::{uniform, GatedGraphConv};
use crate::error::{check_dim, Error, Result};
use crate::graph::BatchTensors;
use crate::narm::NarmEncoder;
use crate::readout::{
    gather_sequence, l2_normalize, CausalSelfAttention, SessionRepr, SoftAttention, TargetAttention,
};
use crate::score::{candidates, normalize_rows, Scorer, NISER_SCALE};

/// Model family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Plain gated GNN with soft-attention readout.
    #[default]
    SrGnn,
    /// SR-GNN plus target-aware attention.
    Tagnn,
    /// TAGNN plus layer-normalised causal self-attention over nodes.
    TagnnPlusPlus,
    /// SR-GNN with normalised item/session embeddings and a fixed temperature.
    Niser,
    /// GRU encoder with attention over its outputs; no session graph.
    Narm,
}

/// Optional pipeline stages a variant enables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Capabilities {
    pub target_attention: bool,
    pub self_attention: bool,
    pub l2_norm: bool,
    pub scale: Option<f64>,
    /// Recurrent encoder instead of graph propagation and soft attention.
    pub recurrent: bool,
}

impl Variant {
    pub const ALL: [Variant; 5] = [
        Variant::SrGnn,
        Variant::Tagnn,
        Variant::TagnnPlusPlus,
        Variant::Niser,
        Variant::Narm,
    ];

    pub fn capabilities(self) -> Capabilities {
        let plain = Capabilities {
            target_attention: false,
            self_attention: false,
            l2_norm: false,
            scale: None,
            recurrent: false,
        };
        match self {
            Variant::SrGnn => plain,
            Variant::Tagnn => Capabilities {
                target_attention: true,
                ..plain
            },
            Variant::TagnnPlusPlus => Capabilities {
                target_attention: true,
                self_attention: true,
                ..plain
            },
            Variant::Niser => Capabilities {
                l2_norm: true,
                scale: Some(NISER_SCALE),
                ..plain
            },
            Variant::Narm => Capabilities {
                recurrent: true,
                ..plain
            },
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Variant::SrGnn => "srgnn",
            Variant::Tagnn => "tagnn",
            Variant::TagnnPlusPlus => "tagnn++",
            Variant::Niser => "niser",
            Variant::Narm => "narm",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Variant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "srgnn" | "gnn" => Ok(Variant::SrGnn),
            "tagnn" => Ok(Variant::Tagnn),
            "tagnn++" | "tagnnplusplus" | "tagnnpp" => Ok(Variant::TagnnPlusPlus),
            "niser" => Ok(Variant::Niser),
            "narm" => Ok(Variant::Narm),
            other => Err(Error::InvalidConfig(format!("unknown model variant `{other}`"))),
        }
    }
}

/// Model hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Embedding rows, including the padding row 0 (max item id + 1).
    pub n_items: usize,
    /// Hidden size `H` (default: 100).
    pub hidden: usize,
    /// Propagation steps (default: 1).
    pub steps: usize,
    /// Use only the attention-pooled vector, without the last-item hybrid.
    pub nonhybrid: bool,
    pub variant: Variant,
    /// Self-attention heads for TAGNN++ (default: 2).
    pub num_heads: usize,
    /// Self-attention dropout for TAGNN++ (default: 0.1).
    pub dropout: f32,
}

impl ModelConfig {
    pub fn new(n_items: usize) -> Self {
        Self {
            n_items,
            hidden: 100,
            steps: 1,
            nonhybrid: false,
            variant: Variant::SrGnn,
            num_heads: 2,
            dropout: 0.1,
        }
    }

    pub fn with_hidden(mut self, hidden: usize) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_variant(mut self, variant: Variant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_nonhybrid(mut self, nonhybrid: bool) -> Self {
        self.nonhybrid = nonhybrid;
        self
    }

    pub fn with_num_heads(mut self, num_heads: usize) -> Self {
        self.num_heads = num_heads;
        self
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }
}

/// Output of the encoder half of the pipeline.
pub struct SessionOutput {
    pub repr: SessionRepr,
    /// Embedding table as seen by this forward pass (normalised for NISER).
    pub table: Tensor,
}

/// The four pipeline stages shared by every variant.
pub trait SessionPipeline {
    /// Look up `(B, N)` item ids in `table`.
    fn embed(&self, table: &Tensor, items: &Tensor) -> Result<Tensor>;

    /// Message passing over the session graphs.
    fn propagate(&self, adjacency: &Tensor, hidden: &Tensor, train: bool) -> Result<Tensor>;

    /// Reorder into sequence positions and pool into a session representation.
    fn pool(
        &self,
        node_hidden: &Tensor,
        batch: &BatchTensors,
        table: &Tensor,
        train: bool,
    ) -> Result<SessionRepr>;

    /// Logits over every candidate item.
    fn score(&self, repr: &SessionRepr, table: &Tensor) -> Result<Tensor>;

    /// Embedding table used by this forward pass.
    fn table(&self) -> Result<Tensor>;

    fn encode_t(&self, batch: &BatchTensors, train: bool) -> Result<SessionOutput> {
        let table = self.table()?;
        let hidden = self.embed(&table, &batch.items)?;
        let hidden = self.propagate(&batch.adjacency, &hidden, train)?;
        let repr = self.pool(&hidden, batch, &table, train)?;
        Ok(SessionOutput { repr, table })
    }

    fn forward_t(&self, batch: &BatchTensors, train: bool) -> Result<Tensor> {
        let out = self.encode_t(batch, train)?;
        self.score(&out.repr, &out.table)
    }
}

/// Layers between the embedding table and the scorer.
enum Encoder {
    Graph {
        gnn: GatedGraphConv,
        self_attention: Option<CausalSelfAttention>,
        readout: SoftAttention,
        target_attention: Option<TargetAttention>,
    },
    Recurrent(NarmEncoder),
}

/// Session recommender over a shared item embedding table.
pub struct SessionGraphModel {
    config: ModelConfig,
    capabilities: Capabilities,
    embedding: Tensor,
    encoder: Encoder,
    scorer: Scorer,
}

impl SessionGraphModel {
    pub fn new(config: ModelConfig, vb: VarBuilder) -> Result<Self> {
        if config.n_items < 2 {
            return Err(Error::InvalidConfig(format!(
                "need at least one item besides padding, got n_items = {}",
                config.n_items
            )));
        }
        let hidden = config.hidden;
        let stdv = 1.0 / (hidden as f64).sqrt();
        let capabilities = config.variant.capabilities();

        let embedding = vb.get_with_hints((config.n_items, hidden), "embedding", uniform(stdv))?;
        let encoder = if capabilities.recurrent {
            Encoder::Recurrent(NarmEncoder::new(hidden, vb.pp("narm"))?)
        } else {
            let gnn = GatedGraphConv::new(hidden, config.steps, vb.pp("gnn"))?;
            let self_attention = if capabilities.self_attention {
                Some(CausalSelfAttention::new(
                    hidden,
                    config.num_heads,
                    config.dropout,
                    vb.pp("self_attention"),
                )?)
            } else {
                None
            };
            let readout = SoftAttention::new(hidden, !config.nonhybrid, vb.pp("readout"))?;
            let target_attention = if capabilities.target_attention {
                Some(TargetAttention::new(hidden, vb.pp("target"))?)
            } else {
                None
            };
            Encoder::Graph {
                gnn,
                self_attention,
                readout,
                target_attention,
            }
        };

        Ok(Self {
            scorer: Scorer::new(capabilities.scale),
            config,
            capabilities,
            embedding,
            encoder,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Number of candidate items (`n_items - 1`).
    pub fn num_candidates(&self) -> usize {
        self.config.n_items - 1
    }
}

impl SessionPipeline for SessionGraphModel {
    fn table(&self) -> Result<Tensor> {
        if self.capabilities.l2_norm {
            normalize_rows(&self.embedding)
        } else {
            Ok(self.embedding.clone())
        }
    }

    fn embed(&self, table: &Tensor, items: &Tensor) -> Result<Tensor> {
        let (b, n) = items.dims2()?;
        let (_rows, h) = table.dims2()?;
        check_dim("embedding width", self.config.hidden, h)?;
        let flat = table.index_select(&items.flatten_all()?, 0)?;
        Ok(flat.reshape((b, n, h))?)
    }

    fn propagate(&self, adjacency: &Tensor, hidden: &Tensor, train: bool) -> Result<Tensor> {
        match &self.encoder {
            Encoder::Graph {
                gnn,
                self_attention,
                ..
            } => {
                let hidden = gnn.forward(adjacency, hidden)?;
                match self_attention {
                    Some(attn) => attn.forward_t(&hidden, train),
                    None => Ok(hidden),
                }
            }
            // no graph: node embeddings pass through untouched
            Encoder::Recurrent(_) => Ok(hidden.clone()),
        }
    }

    fn pool(
        &self,
        node_hidden: &Tensor,
        batch: &BatchTensors,
        table: &Tensor,
        train: bool,
    ) -> Result<SessionRepr> {
        let mut seq_hidden = gather_sequence(node_hidden, &batch.alias_inputs)?;
        let (readout, target_attention) = match &self.encoder {
            Encoder::Recurrent(narm) => {
                let session = narm.forward_t(&seq_hidden, &batch.mask, &batch.last, train)?;
                return Ok(SessionRepr::Single(session));
            }
            Encoder::Graph {
                readout,
                target_attention,
                ..
            } => (readout, target_attention),
        };

        if self.capabilities.l2_norm {
            seq_hidden = l2_normalize(&seq_hidden)?;
        }
        let session = readout.forward(&seq_hidden, &batch.mask, &batch.last)?;

        match target_attention {
            Some(target) => {
                let cands = candidates(table)?;
                let per_item = target.forward(&seq_hidden, &batch.mask, &cands)?;
                Ok(SessionRepr::PerCandidate(
                    per_item.broadcast_add(&session.unsqueeze(1)?)?,
                ))
            }
            None => Ok(SessionRepr::Single(session)),
        }
    }

    fn score(&self, repr: &SessionRepr, table: &Tensor) -> Result<Tensor> {
        let cands = candidates(table)?;
        match &self.encoder {
            Encoder::Recurrent(narm) => self.scorer.score(repr, &narm.project_candidates(&cands)?),
            Encoder::Graph { .. } => self.scorer.score(repr, &cands),
        }
    }
}
