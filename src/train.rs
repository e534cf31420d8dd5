//! Training loop for session-graph recommenders.
//!
//! One epoch:
//! 1. Shuffle the training sessions into mini-batches
//! 2. Optionally append augmented copies of sessions to each batch
//! 3. Build session graphs, run the model and sum the enabled objectives:
//!    cross-entropy (or its FLAG-perturbed version), label-aware loss, mixup
//! 4. AdamW step with a step-decayed learning rate
//!
//! After every epoch the model is evaluated with HR/MRR/Coverage at each K and
//! training stops once no metric has improved for `patience` epochs.
//!
//! # Example
//!
//! ```rust,ignore
//! use sessgraph::{SessionDataset, TrainConfig, Trainer, Variant};
//!
//! let train = SessionDataset::from_json_file("train.json")?;
//! let test = SessionDataset::from_json_file("test.json")?;
//!
//! let config = TrainConfig::default()
//!     .with_variant(Variant::Niser)
//!     .with_epochs(10)
//!     .with_mixup(0.6);
//!
//! let n_items = train.n_items().max(test.n_items());
//! let mut trainer = Trainer::new(config, n_items, candle_core::Device::Cpu)?;
//! let report = trainer.fit(&train, &test, |_| {})?;
//! println!("{}", report.best.summary());
//! ```

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::data::{top_labels, Augmentation, ItemId, SessionBatch, SessionDataset};
use crate::error::{Error, Result};
use crate::graph::{BatchTensors, GraphBatch};
use crate::loss::{cross_entropy, flag_loss, label_aware_loss, mixup, mixup_loss, FlagConfig};
use crate::metrics::{BestResults, TopKAccumulator, TopKMetrics};
use crate::model::{ModelConfig, SessionGraphModel, SessionPipeline, Variant};

/// Training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Hidden size (default: 100).
    pub hidden: usize,
    /// Propagation steps (default: 1).
    pub steps: usize,
    /// Batch size (default: 100).
    pub batch_size: usize,
    /// Maximum number of epochs (default: 30).
    pub epochs: usize,
    /// Initial learning rate (default: 0.001).
    pub lr: f64,
    /// Learning-rate decay factor (default: 0.1).
    pub lr_dc: f64,
    /// Epochs between learning-rate decays (default: 3).
    pub lr_dc_step: usize,
    /// Weight decay (default: 1e-5).
    pub l2: f64,
    /// Epochs without any metric improving before stopping (default: 10).
    pub patience: usize,
    /// Random seed for shuffling, augmentation and mixup (default: 42).
    pub seed: u64,
    /// Hold out this share of training sessions and evaluate on it instead
    /// of the test set (default: None).
    pub valid_portion: Option<f64>,
    /// Cut-offs for HR/MRR/Coverage (default: [10, 20]).
    pub ks: Vec<usize>,
    pub variant: Variant,
    pub nonhybrid: bool,
    /// Self-attention heads for TAGNN++ (default: 2).
    pub num_heads: usize,
    /// Self-attention dropout for TAGNN++ (default: 0.1).
    pub dropout: f32,
    /// Weight of the label-aware loss (None = disabled).
    pub label_aware: Option<f64>,
    /// Mixup coefficient `lam` (None = disabled).
    pub mixup: Option<f64>,
    /// FLAG adversarial training (None = disabled).
    pub flag: Option<FlagConfig>,
    pub augmentation: Option<Augmentation>,
    /// Share of target occurrences covered by the label-aware groups (default: 0.75).
    pub top_label_fraction: f64,
    /// Log a batch loss every this many batches (0 = never).
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            hidden: 100,
            steps: 1,
            batch_size: 100,
            epochs: 30,
            lr: 1e-3,
            lr_dc: 0.1,
            lr_dc_step: 3,
            l2: 1e-5,
            patience: 10,
            seed: 42,
            valid_portion: None,
            ks: vec![10, 20],
            variant: Variant::SrGnn,
            nonhybrid: false,
            num_heads: 2,
            dropout: 0.1,
            label_aware: None,
            mixup: None,
            flag: None,
            augmentation: None,
            top_label_fraction: 0.75,
            log_every: 1000,
        }
    }
}

impl TrainConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn with_hidden(mut self, hidden: usize) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    pub fn with_ks(mut self, ks: Vec<usize>) -> Self {
        self.ks = ks;
        self
    }

    pub fn with_variant(mut self, variant: Variant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_label_aware(mut self, lam: f64) -> Self {
        self.label_aware = Some(lam);
        self
    }

    pub fn with_mixup(mut self, lam: f64) -> Self {
        self.mixup = Some(lam);
        self
    }

    pub fn with_flag(mut self, flag: FlagConfig) -> Self {
        self.flag = Some(flag);
        self
    }

    pub fn with_augmentation(mut self, augmentation: Augmentation) -> Self {
        self.augmentation = Some(augmentation);
        self
    }

    pub fn with_valid_portion(mut self, portion: f64) -> Self {
        self.valid_portion = Some(portion);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::InvalidConfig(msg));
        if self.batch_size == 0 {
            return fail("batch_size must be positive".into());
        }
        if self.epochs == 0 {
            return fail("epochs must be positive".into());
        }
        if self.lr.is_nan() || self.lr <= 0.0 {
            return fail(format!("lr must be positive, got {}", self.lr));
        }
        if !(self.lr_dc > 0.0 && self.lr_dc <= 1.0) {
            return fail(format!("lr_dc must be in (0, 1], got {}", self.lr_dc));
        }
        if self.lr_dc_step == 0 {
            return fail("lr_dc_step must be positive".into());
        }
        if self.l2 < 0.0 {
            return fail(format!("l2 must be non-negative, got {}", self.l2));
        }
        if self.ks.is_empty() || self.ks.contains(&0) {
            return fail(format!("ks must be non-empty and positive, got {:?}", self.ks));
        }
        if let Some(portion) = self.valid_portion {
            if !(portion > 0.0 && portion < 1.0) {
                return fail(format!("valid_portion must be in (0, 1), got {portion}"));
            }
        }
        if let Some(lam) = self.mixup {
            if !(0.0..=1.0).contains(&lam) {
                return fail(format!("mixup lam must be in [0, 1], got {lam}"));
            }
        }
        if let Some(flag) = self.flag {
            if flag.ascent_steps == 0 || flag.step_size.is_nan() || flag.step_size <= 0.0 {
                return fail(format!("invalid FLAG settings {flag:?}"));
            }
        }
        if !(self.top_label_fraction > 0.0 && self.top_label_fraction <= 1.0) {
            return fail(format!(
                "top_label_fraction must be in (0, 1], got {}",
                self.top_label_fraction
            ));
        }
        Ok(())
    }

    /// Model hyperparameters for a catalogue of `n_items` embedding rows.
    pub fn model_config(&self, n_items: usize) -> ModelConfig {
        ModelConfig::new(n_items)
            .with_hidden(self.hidden)
            .with_steps(self.steps)
            .with_variant(self.variant)
            .with_nonhybrid(self.nonhybrid)
            .with_num_heads(self.num_heads)
            .with_dropout(self.dropout)
    }

    /// Step-decayed learning rate for a zero-based epoch.
    ///
    /// The schedule steps before each epoch trains, so the first decay
    /// applies from epoch `lr_dc_step - 1`.
    pub fn learning_rate_for(&self, epoch: usize) -> f64 {
        let decays = ((epoch + 1) / self.lr_dc_step.max(1)) as i32;
        self.lr * self.lr_dc.powi(decays)
    }
}

/// Loss terms for one batch.
struct BatchLoss {
    total: Tensor,
    main: f32,
    label_aware: Option<f32>,
    mixup: Option<f32>,
}

/// One epoch's outcome.
#[derive(Debug, Clone)]
pub struct EpochReport {
    pub epoch: usize,
    pub lr: f64,
    /// Sum of batch losses.
    pub loss: f32,
    pub metrics: Vec<TopKMetrics>,
    pub improved: bool,
}

/// Outcome of [`Trainer::fit`].
#[derive(Debug, Clone)]
pub struct FitReport {
    pub epochs: Vec<EpochReport>,
    pub best: BestResults,
    pub stopped_early: bool,
}

/// Owns the model, its parameters and the optimiser.
pub struct Trainer {
    config: TrainConfig,
    model: SessionGraphModel,
    varmap: VarMap,
    optimizer: AdamW,
    device: Device,
    rng: StdRng,
    top_labels: Vec<ItemId>,
}

impl Trainer {
    /// Build a model over `n_items` embedding rows (max item id + 1).
    pub fn new(config: TrainConfig, n_items: usize, device: Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = SessionGraphModel::new(config.model_config(n_items), vb)?;
        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: config.lr,
                weight_decay: config.l2,
                ..Default::default()
            },
        )?;
        tracing::debug!(
            variant = %config.variant,
            n_items,
            hidden = config.hidden,
            params = varmap.all_vars().len(),
            "trainer ready"
        );
        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            model,
            varmap,
            optimizer,
            device,
            top_labels: Vec::new(),
        })
    }

    /// Labels whose sessions are grouped by the label-aware loss.
    pub fn with_top_labels(mut self, labels: Vec<ItemId>) -> Self {
        self.top_labels = labels;
        self
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn model(&self) -> &SessionGraphModel {
        &self.model
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn top_labels(&self) -> &[ItemId] {
        &self.top_labels
    }

    /// One pass over `data`; returns the summed batch loss.
    pub fn train_epoch(&mut self, data: &SessionDataset, epoch: usize) -> Result<f32> {
        let lr = self.config.learning_rate_for(epoch);
        self.optimizer.set_learning_rate(lr);

        let slices = data.shuffled_batch_slices(self.config.batch_size, &mut self.rng)?;
        let n_batches = slices.len();
        let mut total = 0f32;
        for (j, idx) in slices.iter().enumerate() {
            let mut batch = data.slice(idx)?;
            if let Some(kind) = self.config.augmentation {
                batch = batch.augment(kind, &mut self.rng)?;
            }
            let tensors = GraphBatch::build(&batch)?.to_tensors(&self.device)?;
            let loss = self.batch_loss(&batch, &tensors)?;
            self.optimizer.backward_step(&loss.total)?;

            let value = loss.total.to_scalar::<f32>()?;
            if !value.is_finite() {
                return Err(Error::Training(format!(
                    "non-finite loss {value} at epoch {epoch}, batch {j}"
                )));
            }
            total += value;
            if self.config.log_every > 0 && j % self.config.log_every == 0 {
                tracing::debug!(
                    epoch,
                    batch = j,
                    n_batches,
                    loss = value,
                    main = loss.main,
                    label_aware = ?loss.label_aware,
                    mixup = ?loss.mixup,
                    "batch"
                );
            }
        }
        tracing::info!(epoch, lr, total_loss = total, "epoch trained");
        Ok(total)
    }

    fn batch_loss(&mut self, batch: &SessionBatch, tensors: &BatchTensors) -> Result<BatchLoss> {
        let model = &self.model;
        let targets = &tensors.targets;
        let out = model.encode_t(tensors, true)?;

        let (main, logits) = match self.config.flag {
            Some(flag) => {
                let res = flag_loss(&out.repr, targets, flag, |r| model.score(r, &out.table))?;
                (res.loss, res.logits)
            }
            None => {
                let logits = model.score(&out.repr, &out.table)?;
                (cross_entropy(&logits, targets)?, logits)
            }
        };
        let mut report = BatchLoss {
            main: main.to_scalar::<f32>()?,
            total: main,
            label_aware: None,
            mixup: None,
        };

        if let Some(lam) = self.config.label_aware {
            let groups = batch.top_label_groups(&self.top_labels);
            let la = label_aware_loss(&logits, targets, &groups)?;
            report.label_aware = Some(la.to_scalar::<f32>()?);
            report.total = (report.total + (la * lam)?)?;
        }

        if let Some(lam) = self.config.mixup {
            let mix = mixup(batch.len(), lam, &self.device, &mut self.rng)?;
            let mixed_logits = model.score(&mix.mix(&out.repr)?, &out.table)?;
            let partner_targets = mix.partner_targets(targets)?;
            let mixed = mixup_loss(&mixed_logits, targets, &partner_targets, lam)?;
            report.mixup = Some(mixed.to_scalar::<f32>()?);
            report.total = (report.total + mixed)?;
        }

        Ok(report)
    }

    /// HR/MRR/Coverage at every configured K.
    pub fn evaluate(&self, data: &SessionDataset) -> Result<Vec<TopKMetrics>> {
        let mut accs: Vec<TopKAccumulator> =
            self.config.ks.iter().map(|&k| TopKAccumulator::new(k)).collect();
        for idx in data.batch_slices(self.config.batch_size)? {
            let tensors = data.get_slice(&idx)?.to_tensors(&self.device)?;
            let scores = self.model.forward_t(&tensors, false)?;
            for acc in accs.iter_mut() {
                acc.update_tensor(&scores, &tensors.targets)?;
            }
        }
        let n_candidates = self.model.num_candidates();
        let metrics: Vec<TopKMetrics> = accs.iter().map(|a| a.finish(n_candidates)).collect();
        for m in &metrics {
            tracing::info!(k = m.k, hr = m.hit_rate, mrr = m.mrr, coverage = m.coverage, "evaluated");
        }
        Ok(metrics)
    }

    /// Train on `train`, evaluating on `test` after every epoch.
    ///
    /// When `valid_portion` is set, a shuffled share of `train` is held out
    /// and used for evaluation instead of `test`. `on_epoch` sees every
    /// [`EpochReport`] as soon as it is available.
    pub fn fit<F>(&mut self, train: &SessionDataset, test: &SessionDataset, mut on_epoch: F) -> Result<FitReport>
    where
        F: FnMut(&EpochReport),
    {
        let split;
        let (train, eval) = match self.config.valid_portion {
            Some(portion) => {
                split = train.split_validation(portion, &mut self.rng)?;
                tracing::info!(train = split.0.len(), valid = split.1.len(), "held out validation split");
                (&split.0, &split.1)
            }
            None => (train, test),
        };
        if eval.is_empty() {
            return Err(Error::Training("evaluation set is empty".into()));
        }

        if self.config.label_aware.is_some() && self.top_labels.is_empty() {
            let labels = train.targets().iter().chain(test.targets()).copied();
            self.top_labels = top_labels(labels, self.config.top_label_fraction);
            tracing::info!(top_labels = self.top_labels.len(), "label-aware groups");
        }

        let mut best = BestResults::new(&self.config.ks);
        let mut epochs = Vec::with_capacity(self.config.epochs);
        let mut bad_epochs = 0usize;
        let mut stopped_early = false;
        for epoch in 0..self.config.epochs {
            let lr = self.config.learning_rate_for(epoch);
            let loss = self.train_epoch(train, epoch)?;
            let metrics = self.evaluate(eval)?;
            let improved = best.update(&metrics, epoch);
            let report = EpochReport {
                epoch,
                lr,
                loss,
                metrics,
                improved,
            };
            on_epoch(&report);
            epochs.push(report);

            if improved {
                bad_epochs = 0;
            } else {
                bad_epochs += 1;
                if bad_epochs >= self.config.patience {
                    tracing::info!(epoch, patience = self.config.patience, "early stopping");
                    stopped_early = true;
                    break;
                }
            }
        }

        Ok(FitReport {
            epochs,
            best,
            stopped_early,
        })
    }

    /// Write all trained parameters as safetensors.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TrainConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ks, vec![10, 20]);
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn test_step_decay() {
        let config = TrainConfig::default().with_lr(1.0);
        assert_eq!(config.learning_rate_for(0), 1.0);
        assert_eq!(config.learning_rate_for(1), 1.0);
        assert!((config.learning_rate_for(2) - 0.1).abs() < 1e-12);
        assert!((config.learning_rate_for(4) - 0.1).abs() < 1e-12);
        assert!((config.learning_rate_for(5) - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        assert!(TrainConfig::default().with_batch_size(0).validate().is_err());
        assert!(TrainConfig::default().with_ks(vec![]).validate().is_err());
        assert!(TrainConfig::default().with_mixup(1.5).validate().is_err());
        assert!(TrainConfig::default().with_valid_portion(1.0).validate().is_err());
        assert!(TrainConfig::default().with_valid_portion(0.0).validate().is_err());
        let flag = FlagConfig {
            step_size: 8e-3,
            ascent_steps: 0,
        };
        assert!(TrainConfig::default().with_flag(flag).validate().is_err());
    }

    #[test]
    fn test_config_json_defaults() {
        let config: TrainConfig =
            serde_json::from_str(r#"{"variant": "niser", "mixup": 0.6, "epochs": 2}"#).unwrap();
        assert_eq!(config.variant, Variant::Niser);
        assert_eq!(config.mixup, Some(0.6));
        assert_eq!(config.epochs, 2);
        assert_eq!(config.hidden, 100);
    }

    fn toy() -> SessionDataset {
        SessionDataset::new(
            vec![vec![1, 2], vec![2, 3], vec![3, 4, 1], vec![4], vec![1, 2, 3]],
            vec![3, 4, 2, 1, 4],
        )
        .unwrap()
    }

    fn small(config: TrainConfig) -> TrainConfig {
        config.with_hidden(8).with_batch_size(2).with_epochs(2).with_ks(vec![1, 3])
    }

    #[test]
    fn test_fit_runs_every_regularizer() {
        let data = toy();
        let configs = [
            small(TrainConfig::default()),
            small(TrainConfig::default().with_variant(Variant::Niser).with_mixup(0.6).with_label_aware(1.0)),
            small(TrainConfig::default().with_variant(Variant::Tagnn).with_flag(FlagConfig::default())),
            small(TrainConfig::default().with_augmentation(Augmentation::Deletion)),
            small(TrainConfig::default().with_variant(Variant::Narm).with_flag(FlagConfig::default()).with_mixup(0.5)),
        ];
        for config in configs {
            let mut trainer = Trainer::new(config, 5, Device::Cpu).unwrap();
            let mut seen = 0;
            let report = trainer.fit(&data, &data, |_| seen += 1).unwrap();
            assert_eq!(report.epochs.len(), 2);
            assert_eq!(seen, 2);
            for epoch in &report.epochs {
                assert!(epoch.loss.is_finite());
                assert_eq!(epoch.metrics.len(), 2);
                assert_eq!(epoch.metrics[0].count, data.len());
            }
        }
    }

    #[test]
    fn test_fit_rejects_split_with_empty_validation() {
        let data = toy();
        // passes range validation but holds out round(5 * 0.05) = 0 sessions
        let config = small(TrainConfig::default()).with_valid_portion(0.05);
        assert!(config.validate().is_ok());
        let mut trainer = Trainer::new(config, 5, Device::Cpu).unwrap();
        let err = trainer.fit(&data, &data, |_| {}).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(ref msg) if msg.contains("5 sessions")), "{err}");

        let config = small(TrainConfig::default()).with_valid_portion(0.4);
        let mut trainer = Trainer::new(config, 5, Device::Cpu).unwrap();
        let report = trainer.fit(&data, &data, |_| {}).unwrap();
        assert_eq!(report.epochs[0].metrics[0].count, 2);
    }

    #[test]
    fn test_label_aware_groups_filled_on_fit() {
        let data = toy();
        let config = small(TrainConfig::default().with_label_aware(1.0)).with_epochs(1);
        let mut trainer = Trainer::new(config, 5, Device::Cpu).unwrap();
        trainer.fit(&data, &data, |_| {}).unwrap();
        assert!(!trainer.top_labels().is_empty());
    }

    #[test]
    fn test_training_lowers_loss_on_repeated_pattern() {
        let sessions = vec![vec![1, 2]; 8];
        let targets = vec![3; 8];
        let data = SessionDataset::new(sessions, targets).unwrap();
        let config = TrainConfig::default()
            .with_hidden(8)
            .with_batch_size(4)
            .with_lr(0.05)
            .with_ks(vec![1]);
        let mut trainer = Trainer::new(config, 4, Device::Cpu).unwrap();
        let first = trainer.train_epoch(&data, 0).unwrap();
        let mut last = first;
        for epoch in 1..10 {
            last = trainer.train_epoch(&data, epoch % 2).unwrap();
        }
        assert!(last < first, "loss {first} -> {last}");
        let metrics = trainer.evaluate(&data).unwrap();
        assert_eq!(metrics[0].hit_rate, 100.0);
    }

    #[test]
    fn test_config_file_and_weights_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, r#"{"hidden": 8, "epochs": 1, "ks": [2]}"#).unwrap();
        let config = TrainConfig::from_json_file(&config_path).unwrap();
        assert_eq!(config.hidden, 8);

        let trainer = Trainer::new(config, 5, Device::Cpu).unwrap();
        let weights = dir.path().join("model.safetensors");
        trainer.save(&weights).unwrap();

        let tensors = candle_core::safetensors::load(&weights, &Device::Cpu).unwrap();
        assert_eq!(tensors["embedding"].dims(), &[5, 8]);
        assert!(tensors.contains_key("gnn.w_ih"));
    }
}
