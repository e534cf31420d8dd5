//! Scoring sessions against the item catalogue.
//!
//! Row 0 of the embedding table is the padding item; candidates are rows
//! `1..`, so column `c` of a score matrix corresponds to item id `c + 1`.

use candle_core::{Tensor, D};

use crate::error::{check_dim, Error, Result};
use crate::readout::{l2_normalize, SessionRepr};

/// NISER's fixed temperature.
pub const NISER_SCALE: f64 = 16.0;

/// L2-normalised copy of an embedding table; the input is left untouched.
pub fn normalize_rows(table: &Tensor) -> Result<Tensor> {
    l2_normalize(table)
}

/// Candidate rows of an embedding table (everything but the padding row).
pub fn candidates(table: &Tensor) -> Result<Tensor> {
    let rows = table.dim(0)?;
    if rows < 2 {
        return Err(Error::InvalidConfig(format!(
            "embedding table needs a padding row and at least one item, got {rows} rows"
        )));
    }
    Ok(table.narrow(0, 1, rows - 1)?)
}

/// Dot-product scorer with optional temperature.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Scorer {
    pub scale: Option<f64>,
}

impl Scorer {
    pub fn new(scale: Option<f64>) -> Self {
        Self { scale }
    }

    /// Logits `(B, C)` for a session representation and candidates `(C, H)`.
    pub fn score(&self, repr: &SessionRepr, candidates: &Tensor) -> Result<Tensor> {
        let (c, h) = candidates.dims2()?;
        let scores = match repr {
            SessionRepr::Single(a) => {
                let (_b, ah) = a.dims2()?;
                check_dim("session width", h, ah)?;
                a.matmul(&candidates.t()?.contiguous()?)?
            }
            SessionRepr::PerCandidate(a) => {
                let (_b, ac, ah) = a.dims3()?;
                check_dim("candidate count", c, ac)?;
                check_dim("session width", h, ah)?;
                a.broadcast_mul(&candidates.unsqueeze(0)?)?.sum(D::Minus1)?
            }
        };
        match self.scale {
            Some(scale) => Ok((scores * scale)?),
            None => Ok(scores),
        }
    }
}
