//! Top-K evaluation for next-item prediction.
//!
//! | Metric | Range | Description |
//! |--------|-------|-------------|
//! | HR@K | [0, 100] | Percent of sessions whose target is in the top K |
//! | MRR@K | [0, 100] | Mean reciprocal rank (0 outside the top K), in percent |
//! | Coverage@K | [0, 100] | Percent of the catalogue recommended at least once |

use std::collections::HashSet;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{check_dim, Result};

/// Column indices of the `k` highest scores, best first.
///
/// Ties are broken by the lower index.
pub fn top_k_indices(row: &[f32], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..row.len()).collect();
    idx.sort_by(|&a, &b| row[b].total_cmp(&row[a]).then(a.cmp(&b)));
    idx.truncate(k);
    idx
}

/// Top-K results over an evaluation set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopKMetrics {
    pub k: usize,
    pub hit_rate: f64,
    pub mrr: f64,
    pub coverage: f64,
    /// Number of sessions evaluated
    pub count: usize,
}

impl TopKMetrics {
    pub fn summary(&self) -> String {
        format!(
            "HR@{k}: {:.2} | MRR@{k}: {:.2} | Cov@{k}: {:.2} (n={})",
            self.hit_rate,
            self.mrr,
            self.coverage,
            self.count,
            k = self.k
        )
    }
}

/// Streams batches of scores into HR/MRR/coverage totals for one K.
#[derive(Debug, Clone)]
pub struct TopKAccumulator {
    k: usize,
    hits: usize,
    reciprocal_sum: f64,
    count: usize,
    covered: HashSet<usize>,
}

impl TopKAccumulator {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            hits: 0,
            reciprocal_sum: 0.0,
            count: 0,
            covered: HashSet::new(),
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Add one batch of score rows with their zero-based targets.
    pub fn update(&mut self, scores: &[Vec<f32>], targets: &[u32]) -> Result<()> {
        check_dim("metric targets", scores.len(), targets.len())?;
        for (row, &target) in scores.iter().zip(targets) {
            let top = top_k_indices(row, self.k);
            if let Some(rank) = top.iter().position(|&c| c == target as usize) {
                self.hits += 1;
                self.reciprocal_sum += 1.0 / (rank + 1) as f64;
            }
            self.covered.extend(top);
            self.count += 1;
        }
        Ok(())
    }

    /// [`update`](Self::update) from `(B, C)` scores and `(B,)` u32 targets.
    pub fn update_tensor(&mut self, scores: &Tensor, targets: &Tensor) -> Result<()> {
        let scores = scores.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?;
        let targets = targets.to_vec1::<u32>()?;
        self.update(&scores, &targets)
    }

    /// Final metrics; coverage is relative to `n_candidates` items.
    pub fn finish(&self, n_candidates: usize) -> TopKMetrics {
        if self.count == 0 {
            return TopKMetrics {
                k: self.k,
                ..TopKMetrics::default()
            };
        }
        let n = self.count as f64;
        let coverage = if n_candidates == 0 {
            0.0
        } else {
            self.covered.len() as f64 / n_candidates as f64 * 100.0
        };
        TopKMetrics {
            k: self.k,
            hit_rate: self.hits as f64 / n * 100.0,
            mrr: self.reciprocal_sum / n * 100.0,
            coverage,
            count: self.count,
        }
    }
}

/// Best value and epoch seen so far for one metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Best {
    pub value: f64,
    pub epoch: usize,
}

/// Best HR/MRR/coverage per K across epochs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BestResults {
    pub k: Vec<usize>,
    pub hit_rate: Vec<Best>,
    pub mrr: Vec<Best>,
    pub coverage: Vec<Best>,
}

impl BestResults {
    pub fn new(ks: &[usize]) -> Self {
        Self {
            k: ks.to_vec(),
            hit_rate: vec![Best::default(); ks.len()],
            mrr: vec![Best::default(); ks.len()],
            coverage: vec![Best::default(); ks.len()],
        }
    }

    /// Fold in one epoch's results; returns true if any metric improved.
    ///
    /// Results are matched to slots by position.
    pub fn update(&mut self, results: &[TopKMetrics], epoch: usize) -> bool {
        let mut improved = false;
        for (i, r) in results.iter().enumerate().take(self.k.len()) {
            for (best, value) in [
                (&mut self.hit_rate[i], r.hit_rate),
                (&mut self.mrr[i], r.mrr),
                (&mut self.coverage[i], r.coverage),
            ] {
                if value > best.value {
                    *best = Best { value, epoch };
                    improved = true;
                }
            }
        }
        improved
    }

    pub fn summary(&self) -> String {
        self.k
            .iter()
            .enumerate()
            .map(|(i, k)| {
                format!(
                    "HR@{k}: {:.2} (epoch {}) | MRR@{k}: {:.2} (epoch {}) | Cov@{k}: {:.2} (epoch {})",
                    self.hit_rate[i].value,
                    self.hit_rate[i].epoch,
                    self.mrr[i].value,
                    self.mrr[i].epoch,
                    self.coverage[i].value,
                    self.coverage[i].epoch,
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
