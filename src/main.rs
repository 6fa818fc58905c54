//! enas - command-line entry point

use clap::Parser;
use enas::cli::{cmd_sample, cmd_search, cmd_train_fixed, Cli, Commands};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "enas=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Search {
            data,
            config,
            checkpoint,
            output,
            synthetic,
        } => {
            cmd_search(
                &data,
                config.as_deref(),
                checkpoint.as_deref(),
                &output,
                synthetic,
            )?;
        }
        Commands::TrainFixed {
            data,
            arch,
            config,
            synthetic,
        } => {
            cmd_train_fixed(&data, &arch, config.as_deref(), synthetic)?;
        }
        Commands::Sample {
            checkpoint,
            data,
            config,
            count,
            synthetic,
        } => {
            cmd_sample(&checkpoint, &data, config.as_deref(), count, synthetic)?;
        }
    }

    Ok(())
}
