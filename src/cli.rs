//! Command-line interface: search, fixed-model training and policy sampling

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use candle_core::Device;
use tracing::info;

use crate::arch::Architecture;
use crate::checkpoint;
use crate::data::{BatchSource, CifarDataset, SyntheticDataset};
use crate::search::{train_fixed, SearchConfig, SearchTask, TracingSink};

#[derive(Parser)]
#[command(name = "enas")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Efficient neural architecture search with weight sharing")]
#[command(long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the architecture search
    Search {
        /// Directory holding the CIFAR-10 binary files
        #[arg(short, long, default_value = "data")]
        data: PathBuf,

        /// JSON file overriding the default search configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Checkpoint directory; an existing checkpoint there is resumed
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Where to write the best architecture as JSON
        #[arg(short, long, default_value = "best_arch.json")]
        output: PathBuf,

        /// Use seeded synthetic batches instead of CIFAR-10 (smoke runs)
        #[arg(long)]
        synthetic: bool,
    },

    /// Train a dedicated network for a finalized architecture
    TrainFixed {
        /// Directory holding the CIFAR-10 binary files
        #[arg(short, long, default_value = "data")]
        data: PathBuf,

        /// Architecture JSON produced by `search`
        #[arg(short, long)]
        arch: PathBuf,

        /// JSON file overriding the default search configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Use seeded synthetic batches instead of CIFAR-10 (smoke runs)
        #[arg(long)]
        synthetic: bool,
    },

    /// Sample architectures from a trained policy checkpoint and score
    /// each on one validation batch
    Sample {
        /// Checkpoint directory written by `search`
        #[arg(long)]
        checkpoint: PathBuf,

        /// Directory holding the CIFAR-10 binary files
        #[arg(short, long, default_value = "data")]
        data: PathBuf,

        /// JSON file overriding the default search configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of architectures to print
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,

        /// Use seeded synthetic batches instead of CIFAR-10 (smoke runs)
        #[arg(long)]
        synthetic: bool,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SearchConfig> {
    let cfg = match path {
        Some(p) => serde_json::from_str(&std::fs::read_to_string(p)?)?,
        None => SearchConfig::default(),
    };
    Ok(cfg)
}

fn device() -> anyhow::Result<Device> {
    Ok(Device::cuda_if_available(0)?)
}

struct Sources {
    train: Box<dyn BatchSource>,
    valid: Box<dyn BatchSource>,
    test: Box<dyn BatchSource>,
}

fn open_sources(
    data: &Path,
    cfg: &SearchConfig,
    device: &Device,
    synthetic: bool,
) -> anyhow::Result<Sources> {
    if synthetic {
        let b = cfg.batch_size;
        return Ok(Sources {
            train: Box::new(SyntheticDataset::new(b, 8, cfg.child.num_classes, device, cfg.seed)),
            valid: Box::new(SyntheticDataset::new(b, 4, cfg.child.num_classes, device, cfg.seed + 1)),
            test: Box::new(SyntheticDataset::new(b, 4, cfg.child.num_classes, device, cfg.seed + 2)),
        });
    }
    Ok(Sources {
        train: Box::new(CifarDataset::train(data, cfg.batch_size, device, cfg.seed)?),
        valid: Box::new(CifarDataset::valid(data, cfg.batch_size, device, cfg.seed + 1)?),
        test: Box::new(CifarDataset::test(data, cfg.batch_size, device)?),
    })
}

pub fn cmd_search(
    data: &Path,
    config: Option<&Path>,
    checkpoint_dir: Option<&Path>,
    output: &Path,
    synthetic: bool,
) -> anyhow::Result<()> {
    let cfg = load_config(config)?;
    let device = device()?;
    let mut sources = open_sources(data, &cfg, &device, synthetic)?;

    let mut task = match checkpoint_dir {
        Some(dir) if checkpoint::exists(dir) => SearchTask::resume(cfg, &device, dir)?,
        _ => SearchTask::new(cfg, &device)?,
    };

    let mut sink = TracingSink;
    let best = task.run(
        sources.train.as_mut(),
        sources.valid.as_mut(),
        sources.test.as_mut(),
        &mut sink,
        checkpoint_dir,
    )?;

    std::fs::write(output, best.to_json()?)?;
    info!(path = %output.display(), "wrote best architecture");
    println!("{best}");
    Ok(())
}

pub fn cmd_train_fixed(
    data: &Path,
    arch_path: &Path,
    config: Option<&Path>,
    synthetic: bool,
) -> anyhow::Result<()> {
    let cfg = load_config(config)?;
    let arch = Architecture::from_json(&std::fs::read_to_string(arch_path)?)?;
    let device = device()?;
    let mut sources = open_sources(data, &cfg, &device, synthetic)?;

    let mut sink = TracingSink;
    let test_acc = train_fixed(
        &cfg,
        &arch,
        sources.train.as_mut(),
        sources.test.as_mut(),
        &device,
        &mut sink,
    )?;
    println!("final test accuracy: {test_acc:.4}");
    Ok(())
}

pub fn cmd_sample(
    checkpoint_dir: &Path,
    data: &Path,
    config: Option<&Path>,
    count: usize,
    synthetic: bool,
) -> anyhow::Result<()> {
    let cfg = load_config(config)?;
    let device = device()?;
    let mut sources = open_sources(data, &cfg, &device, synthetic)?;
    let mut task = SearchTask::resume(cfg, &device, checkpoint_dir)?;

    for (i, (arch, acc)) in task
        .sample_candidates(sources.valid.as_mut(), count)?
        .iter()
        .enumerate()
    {
        println!(
            "sample {i}: probe accuracy {acc:.4}, skip rate {:.2}",
            arch.skip_rate()
        );
        println!("{arch}");
    }
    Ok(())
}
