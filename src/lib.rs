//! Session-based next-item recommendation with gated graph neural networks.
//!
//! `sessgraph` turns click sessions into small directed graphs, propagates
//! item embeddings over them with a gated GNN cell and pools the result into a
//! session representation scored against the whole item catalogue. SR-GNN,
//! TAGNN, TAGNN++ and NISER are capability flags on one shared pipeline; the
//! NARM baseline swaps the graph for a GRU encoder.
//!
//! # Modules
//!
//! - [`data`]: Session datasets, padding, batching, augmentation
//! - [`graph`]: Per-session graph construction and the global transition graph
//! - [`conv`]: Gated graph propagation cell
//! - [`readout`]: Soft attention, target attention and node self-attention
//! - [`narm`]: Recurrent encoder with attention over GRU outputs
//! - [`score`]: Dot-product scoring with optional normalisation and temperature
//! - [`model`]: Variants and the shared pipeline
//! - [`loss`]: Cross-entropy, label-aware loss, mixup, FLAG
//! - [`metrics`]: HR@K, MRR@K, Coverage@K
//! - [`train`]: Training loop and configuration
//!
//! # Example: scoring one batch
//!
//! ```rust,ignore
//! use candle_core::{DType, Device};
//! use candle_nn::{VarBuilder, VarMap};
//! use sessgraph::{ModelConfig, SessionDataset, SessionGraphModel, SessionPipeline, Variant};
//!
//! let data = SessionDataset::new(vec![vec![1, 2, 3], vec![2, 4]], vec![4, 1])?;
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
//! let model = SessionGraphModel::new(
//!     ModelConfig::new(data.n_items()).with_variant(Variant::Tagnn),
//!     vb,
//! )?;
//!
//! let batch = data.get_slice(&[0, 1])?.to_tensors(&Device::Cpu)?;
//! let scores = model.forward_t(&batch, false)?; // (2, 4)
//! ```

pub mod conv;
pub mod data;
pub mod error;
pub mod graph;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod narm;
pub mod readout;
pub mod score;
pub mod train;

pub use data::{Augmentation, ItemId, SessionBatch, SessionDataset, PADDING};
pub use error::{Error, Result};
pub use graph::{BatchTensors, GraphBatch, TransitionGraph, PADDING_ALIAS};
pub use loss::FlagConfig;
pub use metrics::{BestResults, TopKAccumulator, TopKMetrics};
pub use model::{ModelConfig, SessionGraphModel, SessionPipeline, Variant};
pub use readout::SessionRepr;
pub use train::{EpochReport, FitReport, TrainConfig, Trainer};
