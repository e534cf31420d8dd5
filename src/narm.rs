//! Recurrent session encoder of NARM (Li et al., "Neural Attentive
//! Session-based Recommendation", CIKM 2017).
//!
//! ```text
//! h_1..h_L = GRU(e_1..e_L)                      (padding positions zeroed)
//! alpha_l  = v^T sigmoid(A_1 h_l + A_2 h_last)   (unnormalised)
//! c_local  = sum_l alpha_l h_l
//! c        = [c_local ; h_last]                  (B, 2H)
//! score_i  = c . B e_i
//! ```
//!
//! Sessions are right-padded and the GRU only looks backwards, so the states
//! at real positions do not depend on how much padding follows them.

use candle_core::Tensor;
use candle_nn::ops::{dropout, sigmoid};
use candle_nn::rnn::{gru, GRUConfig, GRU, RNN};
use candle_nn::{Linear, Module, VarBuilder};

use crate::conv::uniform_linear;
use crate::error::{check_dim, Result};
use crate::readout::last_position;

/// Dropout on item embeddings during training.
const EMBEDDING_DROPOUT: f32 = 0.25;
/// Dropout on the concatenated session vector during training.
const SESSION_DROPOUT: f32 = 0.5;

pub struct NarmEncoder {
    gru: GRU,
    a_1: Linear,
    a_2: Linear,
    v_t: Linear,
    /// Projects item embeddings `(C, H)` to the session width `(C, 2H)`.
    b: Linear,
    hidden: usize,
}

impl NarmEncoder {
    pub fn new(hidden: usize, vb: VarBuilder) -> Result<Self> {
        let stdv = 1.0 / (hidden as f64).sqrt();
        Ok(Self {
            gru: gru(hidden, hidden, GRUConfig::default(), vb.pp("gru"))?,
            a_1: uniform_linear(hidden, hidden, false, stdv, vb.pp("a_1"))?,
            a_2: uniform_linear(hidden, hidden, false, stdv, vb.pp("a_2"))?,
            v_t: uniform_linear(hidden, 1, false, stdv, vb.pp("v_t"))?,
            b: uniform_linear(hidden, 2 * hidden, false, stdv, vb.pp("b"))?,
            hidden,
        })
    }

    /// Encode `(B, L, H)` item embeddings in sequence order into `(B, 2H)`.
    pub fn forward_t(&self, seq_emb: &Tensor, mask: &Tensor, last: &Tensor, train: bool) -> Result<Tensor> {
        let (b, l, h) = seq_emb.dims3()?;
        check_dim("NARM input width", self.hidden, h)?;
        let (mb, ml) = mask.dims2()?;
        check_dim("mask batch", b, mb)?;
        check_dim("mask length", l, ml)?;

        let emb = if train {
            dropout(seq_emb, EMBEDDING_DROPOUT)?
        } else {
            seq_emb.clone()
        };
        let states = self.gru.seq(&emb.contiguous()?)?;
        let outputs = self.gru.states_to_tensor(&states)?;

        let mask3 = mask.unsqueeze(2)?;
        let outputs = outputs.broadcast_mul(&mask3)?;
        let ht = last_position(&outputs, last)?;

        let q1 = self.a_1.forward(&outputs)?;
        let q2 = self.a_2.forward(&ht)?.unsqueeze(1)?.broadcast_mul(&mask3)?;
        let alpha = self.v_t.forward(&sigmoid(&q1.broadcast_add(&q2)?)?)?;
        let local = alpha.broadcast_mul(&outputs)?.sum(1)?;

        let session = Tensor::cat(&[&local, &ht], 1)?;
        if train {
            Ok(dropout(&session, SESSION_DROPOUT)?)
        } else {
            Ok(session)
        }
    }

    /// Candidate embeddings `(C, H)` projected into the session space `(C, 2H)`.
    pub fn project_candidates(&self, candidates: &Tensor) -> Result<Tensor> {
        Ok(self.b.forward(candidates)?)
    }
}
