use anyhow::{bail, Result};
use candle_core::Device;
use clap::Parser;
use tracing::info;

use dynonn_arc::data::ArcDataset;
use dynonn_arc::{ArcTokenizer, Config, DynOnnModel, SamplingStrategy, Trainer};

#[derive(Debug, Parser)]
#[command(name = "dynonn-arc", about = "Train a dynamically-gated expert transformer on ARC grids")]
struct Args {
    /// Directory of ARC task JSON files.
    #[arg(long, default_value = "data/training")]
    data_dir: String,

    /// TOML hyperparameter file; defaults apply when it does not exist.
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Overrides the checkpoint directory from the config.
    #[arg(long)]
    checkpoint_dir: Option<String>,

    /// cpu or auto (the expert-gating step function only ships a CPU kernel).
    #[arg(long, default_value = "auto")]
    device: String,

    /// Overrides the RNG seed from the config.
    #[arg(long)]
    seed: Option<u64>,

    /// Overrides the epoch count from the config.
    #[arg(long)]
    epochs: Option<usize>,

    /// Candidate sampling strategy for evaluation: greedy, temperature, top_p.
    #[arg(long, default_value = "greedy")]
    sampling: String,
}

fn select_device(name: &str) -> Result<Device> {
    match name {
        "cpu" | "auto" => Ok(Device::Cpu),
        "cuda" => bail!(
            "cuda is not supported: the expert-gating step function only has a CPU kernel"
        ),
        other => bail!("unknown device '{other}', expected cpu or auto"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let strategy: SamplingStrategy = args.sampling.parse()?;
    let device = select_device(&args.device)?;

    let mut config = Config::load(&args.config)?;
    if let Some(dir) = args.checkpoint_dir {
        config.training.checkpoint_dir = dir;
    }
    if let Some(seed) = args.seed {
        config.training.seed = seed;
    }
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }

    let tokenizer = ArcTokenizer::new();
    let train_data = ArcDataset::load(&args.data_dir, config.model.max_grid_size, false)?;
    if train_data.is_empty() {
        bail!("no usable training pairs under {}", args.data_dir);
    }
    let eval_data = ArcDataset::load(&args.data_dir, config.model.max_grid_size, true)?;
    let eval_data = if eval_data.is_empty() {
        info!("no held-out pairs found, evaluating on the training pairs");
        ArcDataset::load(&args.data_dir, config.model.max_grid_size, false)?
    } else {
        eval_data
    };

    info!(
        "device {device:?}, {} train pairs, {} eval pairs, vocab {}",
        train_data.len(),
        eval_data.len(),
        tokenizer.vocab_size()
    );

    let model = DynOnnModel::new(&config.model, &config.gating, tokenizer.vocab_size(), &device)?;
    let mut trainer = Trainer::new(model, config, device, strategy)?;
    trainer.run(&train_data, &eval_data)
}
