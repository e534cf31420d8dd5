//! Session readout: from per-node features to a session representation.
//!
//! Node features come out of propagation in graph order `(B, N, H)`. The
//! readout first scatters them back into sequence order with the alias
//! indices, then pools the sequence into one vector per session
//! ([`SoftAttention`], SR-GNN) or one vector per session and candidate item
//! ([`TargetAttention`], TAGNN).
//!
//! All pooling weights go through [`masked_softmax`], so padding positions
//! contribute exactly zero whatever the mask pattern.

use candle_core::{Tensor, D};
use candle_nn::ops::{dropout, sigmoid, softmax};
use candle_nn::{layer_norm, LayerNorm, Linear, Module, VarBuilder};

use crate::conv::uniform_linear;
use crate::error::{check_dim, Error, Result};

/// Pooled session representation handed to the scorer.
#[derive(Debug, Clone)]
pub enum SessionRepr {
    /// One vector per session, `(B, H)`.
    Single(Tensor),
    /// One vector per session and candidate item, `(B, C, H)`.
    PerCandidate(Tensor),
}

impl SessionRepr {
    pub fn tensor(&self) -> &Tensor {
        match self {
            Self::Single(t) | Self::PerCandidate(t) => t,
        }
    }

    /// Same variant, different payload.
    pub fn with_tensor(&self, t: Tensor) -> Self {
        match self {
            Self::Single(_) => Self::Single(t),
            Self::PerCandidate(_) => Self::PerCandidate(t),
        }
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.tensor().dim(0)?)
    }
}

/// Gather `(B, N, H)` node features into sequence order `(B, L, H)`.
pub fn gather_sequence(node_hidden: &Tensor, alias_inputs: &Tensor) -> Result<Tensor> {
    let (b, _n, h) = node_hidden.dims3()?;
    let (ab, l) = alias_inputs.dims2()?;
    check_dim("alias batch", b, ab)?;
    let index = alias_inputs
        .unsqueeze(2)?
        .broadcast_as((b, l, h))?
        .contiguous()?;
    Ok(node_hidden.contiguous()?.gather(&index, 1)?)
}

/// Features at the last real position of each session, `(B, H)`.
pub fn last_position(seq_hidden: &Tensor, last: &Tensor) -> Result<Tensor> {
    let (b, _l, h) = seq_hidden.dims3()?;
    check_dim("last-position batch", b, last.dim(0)?)?;
    let index = last.reshape((b, 1, 1))?.broadcast_as((b, 1, h))?.contiguous()?;
    Ok(seq_hidden.contiguous()?.gather(&index, 1)?.squeeze(1)?)
}

/// Softmax over the last axis restricted to positions where `mask` is 1.
///
/// `mask` must broadcast to `scores`; masked-out positions get weight 0.
/// Every row needs at least one valid position.
pub fn masked_softmax(scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let mask = mask.broadcast_as(scores.dims())?.contiguous()?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, scores.dims(), scores.device())?
        .to_dtype(scores.dtype())?;
    let filled = mask.ne(0f64)?.where_cond(scores, &neg_inf)?;
    let weights = softmax(&filled, D::Minus1)?;
    Ok((weights * mask)?)
}

/// L2-normalise the last axis.
pub fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = (x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()? + 1e-12)?;
    Ok(x.broadcast_div(&norm)?)
}

/// Soft-attention pooling of SR-GNN.
///
/// ```text
/// alpha_l = w3^T sigmoid(W1 h_last + W2 h_l)    (softmax over valid l)
/// s_g     = sum_l alpha_l h_l
/// s       = W_t [s_g ; h_last]                   (hybrid mode)
/// ```
pub struct SoftAttention {
    linear_one: Linear,
    linear_two: Linear,
    linear_three: Linear,
    linear_transform: Option<Linear>,
}

impl SoftAttention {
    /// `hybrid` concatenates the global and last-item vectors before a final
    /// projection; otherwise the attention-pooled vector is used alone.
    pub fn new(hidden: usize, hybrid: bool, vb: VarBuilder) -> Result<Self> {
        let stdv = 1.0 / (hidden as f64).sqrt();
        let linear_transform = if hybrid {
            Some(uniform_linear(
                2 * hidden,
                hidden,
                true,
                stdv,
                vb.pp("linear_transform"),
            )?)
        } else {
            None
        };
        Ok(Self {
            linear_one: uniform_linear(hidden, hidden, true, stdv, vb.pp("linear_one"))?,
            linear_two: uniform_linear(hidden, hidden, true, stdv, vb.pp("linear_two"))?,
            linear_three: uniform_linear(hidden, 1, false, stdv, vb.pp("linear_three"))?,
            linear_transform,
        })
    }

    /// Pool `(B, L, H)` sequence features into `(B, H)`.
    pub fn forward(&self, seq_hidden: &Tensor, mask: &Tensor, last: &Tensor) -> Result<Tensor> {
        let (b, l, _h) = seq_hidden.dims3()?;
        let (mb, ml) = mask.dims2()?;
        check_dim("mask batch", b, mb)?;
        check_dim("mask length", l, ml)?;

        let ht = last_position(seq_hidden, last)?;
        let q1 = self.linear_one.forward(&ht)?.unsqueeze(1)?;
        let q2 = self.linear_two.forward(seq_hidden)?;
        let alpha = self
            .linear_three
            .forward(&sigmoid(&q1.broadcast_add(&q2)?)?)?
            .squeeze(2)?;
        let alpha = masked_softmax(&alpha, mask)?;
        let global = alpha.unsqueeze(2)?.broadcast_mul(seq_hidden)?.sum(1)?;

        match &self.linear_transform {
            Some(transform) => Ok(transform.forward(&Tensor::cat(&[&global, &ht], 1)?)?),
            None => Ok(global),
        }
    }
}

/// Target-aware attention of TAGNN.
///
/// Each candidate item `c` attends over the session's positions:
///
/// ```text
/// beta_cl = softmax_l( e_c . W_t h_l )      (valid l only)
/// s_c     = sum_l beta_cl h_l
/// ```
pub struct TargetAttention {
    linear_t: Linear,
}

impl TargetAttention {
    pub fn new(hidden: usize, vb: VarBuilder) -> Result<Self> {
        let stdv = 1.0 / (hidden as f64).sqrt();
        Ok(Self {
            linear_t: uniform_linear(hidden, hidden, false, stdv, vb.pp("linear_t"))?,
        })
    }

    /// Per-candidate target vectors `(B, C, H)` for candidates `(C, H)`.
    pub fn forward(&self, seq_hidden: &Tensor, mask: &Tensor, candidates: &Tensor) -> Result<Tensor> {
        let (b, _l, h) = seq_hidden.dims3()?;
        let (c, ch) = candidates.dims2()?;
        check_dim("candidate width", h, ch)?;

        let masked = seq_hidden.broadcast_mul(&mask.unsqueeze(2)?)?;
        let qt = self.linear_t.forward(&masked)?;
        let logits = candidates
            .unsqueeze(0)?
            .broadcast_as((b, c, h))?
            .contiguous()?
            .matmul(&qt.transpose(1, 2)?.contiguous()?)?;
        let beta = masked_softmax(&logits, &mask.unsqueeze(1)?)?;
        Ok(beta.matmul(&masked)?)
    }
}

/// Layer-normalised causal multi-head self-attention over node features
/// (TAGNN++).
///
/// ```text
/// out = MHA(x, x, x; causal) + LayerNorm(x)
/// ```
///
/// Node order is the sorted unique-item order; padded nodes sit at the tail,
/// so the causal mask keeps real nodes from attending to them.
pub struct CausalSelfAttention {
    norm: LayerNorm,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    dropout: f32,
}

impl CausalSelfAttention {
    pub fn new(hidden: usize, num_heads: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || hidden % num_heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "hidden size {hidden} is not divisible by {num_heads} heads"
            )));
        }
        let stdv = 1.0 / (hidden as f64).sqrt();
        let attn = vb.pp("attn");
        Ok(Self {
            norm: layer_norm(hidden, 1e-5, vb.pp("layer_norm1"))?,
            q_proj: uniform_linear(hidden, hidden, true, stdv, attn.pp("q_proj"))?,
            k_proj: uniform_linear(hidden, hidden, true, stdv, attn.pp("k_proj"))?,
            v_proj: uniform_linear(hidden, hidden, true, stdv, attn.pp("v_proj"))?,
            out_proj: uniform_linear(hidden, hidden, true, stdv, attn.pp("out_proj"))?,
            num_heads,
            dropout,
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (b, n, h) = x.dims3()?;
        let head_dim = h / self.num_heads;

        let skip = self.norm.forward(x)?;
        let split = |t: Tensor| -> candle_core::Result<Tensor> {
            t.reshape((b, n, self.num_heads, head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(self.q_proj.forward(x)?)?;
        let k = split(self.k_proj.forward(x)?)?;
        let v = split(self.v_proj.forward(x)?)?;

        let scores = (q.matmul(&k.t()?.contiguous()?)? / (head_dim as f64).sqrt())?;
        let causal = causal_mask(n, x.device())?;
        let weights = masked_softmax(&scores, &causal)?;
        let weights = if train && self.dropout > 0.0 {
            dropout(&weights, self.dropout)?
        } else {
            weights
        };

        let attended = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, n, h))?;
        Ok((self.out_proj.forward(&attended)? + skip)?)
    }
}

/// `(N, N)` lower-triangular mask: position `i` sees positions `j <= i`.
fn causal_mask(n: usize, device: &candle_core::Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..n)
        .flat_map(|i| (0..n).map(move |j| if j <= i { 1.0 } else { 0.0 }))
        .collect();
    Ok(Tensor::from_vec(mask, (n, n), device)?)
}
