//! SLU CLI
//!
//! Command-line training entry point for speech intent and slot
//! recognition models.
//!
//! # Commands
//!
//! - `train`: load the configuration, construct the model, resolve the
//!   pretrained encoder source, run fit, and conditionally run test.
//!
//! Free-form `section.key=value` arguments after the flags override
//! configuration values, e.g.:
//!
//! ```bash
//! slu train --config configs/slu.toml \
//!     trainer.max_epochs=50 \
//!     pretrained_encoder.name=ssl_en_conformer_large \
//!     pretrained_encoder.freeze=true
//! ```

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

mod commands;
mod error;
mod observer;

/// SLU training CLI.
#[derive(Parser)]
#[command(name = "slu")]
#[command(version)]
#[command(about = "Train speech intent and slot recognition models")]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the training loop, and the test loop when configured
    Train(commands::train::TrainArgs),
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let exit_code = match cli.command {
        Commands::Train(args) => commands::train::handle_train(args),
    };
    std::process::exit(exit_code);
}
