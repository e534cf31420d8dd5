//! Training objectives.
//!
//! - [`cross_entropy`]: next-item classification over all candidates
//! - [`label_aware_loss`]: pulls sessions sharing a frequent target towards
//!   their group's mean prediction
//! - [`mixup`] / [`mixup_loss`]: convex mixing of session representations
//! - [`flag_loss`]: FLAG adversarial perturbation of session representations
//!   (Kong et al., "Robust Optimization as Data Augmentation for Large-scale
//!   Graphs", CVPR 2022)

use candle_core::{Tensor, Var, D};
use candle_nn::ops::softmax;
use rand::Rng;

use crate::error::{check_dim, Error, Result};
use crate::readout::SessionRepr;

/// Mean cross-entropy of `(B, C)` logits against zero-based targets `(B,)`.
pub fn cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::loss::cross_entropy(logits, targets)?)
}

/// Label-aware loss.
///
/// Rows belonging to each non-empty group are replaced by the group's mean
/// logits (treated as constants); the result is softmaxed and scored with
/// cross-entropy against the true targets.
pub fn label_aware_loss(logits: &Tensor, targets: &Tensor, groups: &[Vec<usize>]) -> Result<Tensor> {
    let b = logits.dim(0)?;
    let mut rows: Vec<Tensor> = (0..b)
        .map(|i| logits.narrow(0, i, 1))
        .collect::<candle_core::Result<_>>()?;

    let frozen = logits.detach();
    for group in groups.iter().filter(|g| !g.is_empty()) {
        if let Some(&bad) = group.iter().find(|&&i| i >= b) {
            return Err(Error::DimensionMismatch {
                what: "label group row",
                expected: b,
                got: bad,
            });
        }
        let index: Vec<u32> = group.iter().map(|&i| i as u32).collect();
        let index = Tensor::from_vec(index, group.len(), logits.device())?;
        let mean = frozen.index_select(&index, 0)?.mean_keepdim(0)?;
        for &i in group {
            rows[i] = mean.clone();
        }
    }

    let probs = softmax(&Tensor::cat(&rows, 0)?, D::Minus1)?;
    cross_entropy(&probs, targets)
}

/// A sampled mixing partner for every row of a batch.
#[derive(Debug, Clone)]
pub struct Mixup {
    pub lam: f64,
    /// Row mixed into each row, drawn with replacement.
    pub partners: Tensor,
}

/// Draw mixing partners for a batch of `batch_size` sessions.
pub fn mixup<R: Rng + ?Sized>(
    batch_size: usize,
    lam: f64,
    device: &candle_core::Device,
    rng: &mut R,
) -> Result<Mixup> {
    if batch_size == 0 {
        return Err(Error::EmptyBatch);
    }
    let partners: Vec<u32> = (0..batch_size)
        .map(|_| rng.gen_range(0..batch_size) as u32)
        .collect();
    Ok(Mixup {
        lam,
        partners: Tensor::from_vec(partners, batch_size, device)?,
    })
}

impl Mixup {
    /// `lam * x + (1 - lam) * x[partners]`.
    pub fn mix(&self, repr: &SessionRepr) -> Result<SessionRepr> {
        let x = repr.tensor();
        check_dim("mixup batch", self.partners.dim(0)?, x.dim(0)?)?;
        let other = x.index_select(&self.partners, 0)?;
        let mixed = ((x * self.lam)? + (other * (1.0 - self.lam))?)?;
        Ok(repr.with_tensor(mixed))
    }

    /// Targets of the mixing partners.
    pub fn partner_targets(&self, targets: &Tensor) -> Result<Tensor> {
        Ok(targets.index_select(&self.partners, 0)?)
    }
}

/// `lam * CE(logits, y_a) + (1 - lam) * CE(logits, y_b)`.
pub fn mixup_loss(logits: &Tensor, targets_a: &Tensor, targets_b: &Tensor, lam: f64) -> Result<Tensor> {
    let a = (cross_entropy(logits, targets_a)? * lam)?;
    let b = (cross_entropy(logits, targets_b)? * (1.0 - lam))?;
    Ok((a + b)?)
}

/// FLAG hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FlagConfig {
    /// Perturbation bound and ascent step (default: 8e-3).
    pub step_size: f64,
    /// Ascent steps `m` (default: 3).
    pub ascent_steps: usize,
}

impl Default for FlagConfig {
    fn default() -> Self {
        Self {
            step_size: 8e-3,
            ascent_steps: 3,
        }
    }
}

/// Result of a FLAG pass.
pub struct FlagOutput {
    /// Sum of the `m` perturbed losses, each divided by `m`.
    pub loss: Tensor,
    /// Logits from the final perturbation.
    pub logits: Tensor,
}

/// Adversarially perturbed cross-entropy.
///
/// A perturbation `delta ~ U(-step, step)` of the session representation is
/// refined by `m - 1` signed-gradient ascent steps. The returned loss sums the
/// loss at every step (each scaled by `1/m`), so a single backward pass
/// accumulates the parameter gradients of all steps.
pub fn flag_loss<F>(
    repr: &SessionRepr,
    targets: &Tensor,
    config: FlagConfig,
    score: F,
) -> Result<FlagOutput>
where
    F: Fn(&SessionRepr) -> Result<Tensor>,
{
    if config.ascent_steps == 0 {
        return Err(Error::InvalidConfig("FLAG needs at least one ascent step".into()));
    }
    let feats = repr.tensor();
    let step = config.step_size;
    let m = config.ascent_steps as f64;
    let mut delta = Tensor::rand(-step as f32, step as f32, feats.dims(), feats.device())?
        .to_dtype(feats.dtype())?;

    let mut total: Option<Tensor> = None;
    let mut logits = None;
    for i in 0..config.ascent_steps {
        let var = Var::from_tensor(&delta)?;
        let perturbed = repr.with_tensor((feats + var.as_tensor())?);
        let out = score(&perturbed)?;
        let loss = (cross_entropy(&out, targets)? / m)?;

        if i + 1 < config.ascent_steps {
            let grads = loss.backward()?;
            if let Some(grad) = grads.get(var.as_tensor()) {
                delta = (delta + (sign(grad)? * step)?)?.detach();
            }
        }
        total = Some(match total {
            Some(acc) => (acc + loss)?,
            None => loss,
        });
        logits = Some(out);
    }

    match (total, logits) {
        (Some(loss), Some(logits)) => Ok(FlagOutput { loss, logits }),
        _ => Err(Error::Training("FLAG produced no loss".into())),
    }
}

fn sign(t: &Tensor) -> candle_core::Result<Tensor> {
    let pos = t.gt(0f64)?.to_dtype(t.dtype())?;
    let neg = t.lt(0f64)?.to_dtype(t.dtype())?;
    pos - neg
}
