//! sessgraph CLI - train and inspect session-graph recommenders.
//!
//! # Usage
//!
//! ```bash
//! # Dataset statistics
//! sessgraph stats train.json
//!
//! # Most frequent successors of an item in the transition graph
//! sessgraph graph train.json --item 42 --top 5
//!
//! # Train TAGNN with label-aware loss, evaluating on a test split
//! sessgraph train train.json test.json --variant tagnn --label-aware 1.0
//!
//! # Train from a JSON config and save the weights
//! sessgraph train train.json test.json --config niser.json --save niser.safetensors
//! ```
//!
//! Datasets are JSON files of the form `{"sessions": [[1, 2, 3], ...], "targets": [4, ...]}`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use sessgraph::data::top_labels;
use sessgraph::{
    Augmentation, FlagConfig, SessionDataset, TrainConfig, Trainer, TransitionGraph, Variant,
};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sessgraph")]
#[command(about = "Session-based recommendation with graph neural networks", long_about = None)]
struct Cli {
    /// Verbose logging (repeat for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model and report HR/MRR/Coverage after every epoch
    Train {
        /// Training sessions (JSON)
        train: PathBuf,

        /// Test sessions (JSON)
        test: PathBuf,

        /// Training config (JSON); flags below override it
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Model variant
        #[arg(long)]
        variant: Option<VariantArg>,

        #[arg(long)]
        epochs: Option<usize>,

        #[arg(long)]
        hidden: Option<usize>,

        #[arg(long)]
        batch_size: Option<usize>,

        /// Initial learning rate
        #[arg(long)]
        lr: Option<f64>,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Label-aware loss weight
        #[arg(long)]
        label_aware: Option<f64>,

        /// Mixup coefficient
        #[arg(long)]
        mixup: Option<f64>,

        /// FLAG adversarial training with default step size and ascent steps
        #[arg(long)]
        flag: bool,

        /// Session augmentation
        #[arg(long)]
        augment: Option<AugmentArg>,

        /// Evaluate on a held-out share of the training data instead of the test set
        #[arg(long)]
        valid_portion: Option<f64>,

        /// Write trained weights (safetensors)
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Show statistics about a session dataset
    Stats {
        /// Sessions (JSON)
        input: PathBuf,

        /// Share of target occurrences counted as frequent
        #[arg(long, default_value = "0.75")]
        fraction: f64,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Query the global item-transition graph
    Graph {
        /// Sessions (JSON)
        input: PathBuf,

        /// Item whose successors to list
        #[arg(long)]
        item: u32,

        /// Number of successors to show
        #[arg(short, long, default_value = "10")]
        top: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum VariantArg {
    /// SR-GNN
    Srgnn,
    /// Target-attentive GNN
    Tagnn,
    /// TAGNN with node self-attention
    TagnnPp,
    /// Normalised item and session representations
    Niser,
    /// GRU encoder with attention (no session graph)
    Narm,
}

impl From<VariantArg> for Variant {
    fn from(v: VariantArg) -> Self {
        match v {
            VariantArg::Srgnn => Variant::SrGnn,
            VariantArg::Tagnn => Variant::Tagnn,
            VariantArg::TagnnPp => Variant::TagnnPlusPlus,
            VariantArg::Niser => Variant::Niser,
            VariantArg::Narm => Variant::Narm,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum AugmentArg {
    /// Drop a random item
    Deletion,
    /// Insert a random in-batch item
    Insertion,
}

impl From<AugmentArg> for Augmentation {
    fn from(a: AugmentArg) -> Self {
        match a {
            AugmentArg::Deletion => Augmentation::Deletion,
            AugmentArg::Insertion => Augmentation::Insertion,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Train {
            train,
            test,
            config,
            variant,
            epochs,
            hidden,
            batch_size,
            lr,
            seed,
            label_aware,
            mixup,
            flag,
            augment,
            valid_portion,
            save,
        } => {
            let mut cfg = match config {
                Some(path) => TrainConfig::from_json_file(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => TrainConfig::default(),
            };
            if let Some(v) = variant {
                cfg.variant = v.into();
            }
            if let Some(e) = epochs {
                cfg.epochs = e;
            }
            if let Some(h) = hidden {
                cfg.hidden = h;
            }
            if let Some(b) = batch_size {
                cfg.batch_size = b;
            }
            if let Some(lr) = lr {
                cfg.lr = lr;
            }
            if let Some(s) = seed {
                cfg.seed = s;
            }
            if label_aware.is_some() {
                cfg.label_aware = label_aware;
            }
            if mixup.is_some() {
                cfg.mixup = mixup;
            }
            if flag {
                cfg.flag = Some(FlagConfig::default());
            }
            if let Some(a) = augment {
                cfg.augmentation = Some(a.into());
            }
            if valid_portion.is_some() {
                cfg.valid_portion = valid_portion;
            }
            cmd_train(&train, &test, cfg, save.as_deref())
        }
        Commands::Stats {
            input,
            fraction,
            json,
        } => cmd_stats(&input, fraction, json),
        Commands::Graph { input, item, top } => cmd_graph(&input, item, top),
    }
}

fn load_sessions(path: &Path) -> Result<SessionDataset> {
    let start = Instant::now();
    let pb = ProgressBar::new_spinner();
    pb.set_message(format!("Loading {}...", path.display()));

    let data = SessionDataset::from_json_file(path)
        .with_context(|| format!("Failed to load sessions from {}", path.display()))?;

    pb.finish_with_message(format!(
        "Loaded {} sessions in {:.2?}",
        data.len(),
        start.elapsed()
    ));
    Ok(data)
}

fn cmd_train(train: &Path, test: &Path, config: TrainConfig, save: Option<&Path>) -> Result<()> {
    config.validate().context("Invalid training config")?;
    let train_data = load_sessions(train)?;
    let test_data = load_sessions(test)?;
    let n_items = train_data.n_items().max(test_data.n_items());

    println!(
        "Training {} (hidden={}, epochs={}, items={})",
        config.variant,
        config.hidden,
        config.epochs,
        n_items - 1
    );
    let epochs = config.epochs as u64;
    let mut trainer = Trainer::new(config, n_items, candle_core::Device::Cpu)
        .context("Failed to build model")?;

    let pb = ProgressBar::new(epochs);
    pb.set_style(
        ProgressStyle::with_template("{bar:30} {pos}/{len} epochs {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let start = Instant::now();
    let report = trainer
        .fit(&train_data, &test_data, |epoch| {
            pb.inc(1);
            pb.set_message(format!("loss {:.3}", epoch.loss));
            pb.suspend(|| {
                println!("Epoch {} (lr {:.2e}, loss {:.4})", epoch.epoch, epoch.lr, epoch.loss);
                for m in &epoch.metrics {
                    println!("  {}", m.summary());
                }
            });
        })
        .context("Training failed")?;
    pb.finish_with_message(format!("done in {:.2?}", start.elapsed()));

    if report.stopped_early {
        println!("Stopped early after {} epochs", report.epochs.len());
    }
    println!("Best results");
    println!("============");
    println!("{}", report.best.summary());

    if let Some(path) = save {
        trainer
            .save(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Saved weights to {}", path.display());
    }
    Ok(())
}

fn cmd_stats(input: &Path, fraction: f64, json: bool) -> Result<()> {
    if !(fraction > 0.0 && fraction <= 1.0) {
        bail!("--fraction must be in (0, 1], got {fraction}");
    }
    let data = load_sessions(input)?;
    let lengths: Vec<usize> = data.sessions().map(<[u32]>::len).collect();
    let avg_len = lengths.iter().sum::<usize>() as f64 / lengths.len().max(1) as f64;
    let frequent = top_labels(data.targets().iter().copied(), fraction);

    if json {
        let stats = serde_json::json!({
            "sessions": data.len(),
            "max_item_id": data.max_item_id(),
            "max_length": data.len_max(),
            "avg_length": avg_len,
            "frequent_items": frequent,
        });
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Session Dataset Statistics");
    println!("==========================");
    println!("Sessions:       {}", data.len());
    println!("Max item id:    {}", data.max_item_id());
    println!("Max length:     {}", data.len_max());
    println!("Avg length:     {:.2}", avg_len);
    println!("Frequent items: {}", frequent.len());

    Ok(())
}

fn cmd_graph(input: &Path, item: u32, top: usize) -> Result<()> {
    let data = load_sessions(input)?;
    let graph = TransitionGraph::from_sessions(data.sessions());

    println!(
        "Transition graph: {} items, {} edges",
        graph.node_count(),
        graph.edge_count()
    );
    let successors = graph.top_successors(item, top);
    if successors.is_empty() {
        println!("Item {} has no successors", item);
        return Ok(());
    }
    println!("Top {} successors of item {}:", successors.len(), item);
    for (i, (next, weight)) in successors.iter().enumerate() {
        println!("{}. {} ({:.4})", i + 1, next, weight);
    }
    Ok(())
}
