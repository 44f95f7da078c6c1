//! The `train` command: configuration to trained model archive.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tokenizers::Tokenizer;
use tracing::{error, info};

use slu_core::config::AppConfig;
use slu_core::data::SluDataset;
use slu_core::exp::RunContext;
use slu_core::pretrained::archive::save_archive;
use slu_core::training::resolve_device;
use slu_core::{
    initialize_encoder, test_phase_requested, SluError, SluModel, SluResult, Trainer, VocabSpec,
    ZooRegistry,
};

use crate::error::exit_code_for_error;
use crate::observer::TracingObserver;

/// Arguments for `slu train`.
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    pub config: PathBuf,

    /// Device to train on (auto, cpu, cuda[:N]); overrides trainer.device
    #[arg(long)]
    pub device: Option<String>,

    /// Cache directory for model-zoo downloads
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Dotted configuration overrides, e.g. trainer.max_epochs=5
    #[arg(value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,
}

/// Run training, mapping errors to the process exit code.
pub fn handle_train(args: TrainArgs) -> i32 {
    match run_train(args) {
        Ok(()) => 0,
        Err(err) => {
            error!("{err}");
            exit_code_for_error(&err)
        }
    }
}

fn run_train(args: TrainArgs) -> SluResult<()> {
    let config = AppConfig::load_with_overrides(&args.config, &args.overrides)?;
    let registry = ZooRegistry::with_builtin(args.cache_dir.clone());

    // classification happens once, before any directory or model is built
    let source = config.validate(&registry)?;
    info!(%source, freeze = config.pretrained_encoder.freeze, "pretrained encoder source");

    let device_spec = args.device.as_deref().unwrap_or(&config.trainer.device);
    let device = resolve_device(device_spec)?;

    let tokenizer = Tokenizer::from_file(&config.model.tokenizer.path)
        .map_err(|e| SluError::Tokenizer(e.to_string()))?;
    let tokenizer = Arc::new(tokenizer);
    let vocab = VocabSpec::from_tokenizer(&tokenizer, &config.model.tokenizer)?;
    info!(vocab_size = vocab.size, "tokenizer loaded");

    let run = RunContext::create(&config.exp, &config)?;
    info!(run_dir = %run.run_dir.display(), "run directory created");

    let mut model = SluModel::new(&config.model.arch(), vocab, &device)?;
    model.attach_data(tokenizer.clone(), config.model.test_ds.clone());

    initialize_encoder(
        &source,
        config.pretrained_encoder.freeze,
        &mut model,
        &registry,
        &mut TracingObserver,
    )?;

    let train = SluDataset::load(&config.model.train_ds, &tokenizer, config.model.feat_dim)?;
    info!(utterances = train.len(), "training dataset loaded");
    let val = config
        .model
        .validation_ds
        .as_ref()
        .map(|section| SluDataset::load(section, &tokenizer, config.model.feat_dim))
        .transpose()?;
    if let Some(val) = &val {
        info!(utterances = val.len(), "validation dataset loaded");
    }

    let mut trainer = Trainer::new(
        config.trainer.clone(),
        config.model.optim.clone(),
        device,
        run,
    );
    let report = trainer.fit(&mut model, &train, val.as_ref())?;
    info!(
        epochs = report.epochs_run,
        steps = report.total_steps,
        final_train_loss = report.final_train_loss,
        best_val_loss = report.best_val_loss,
        early_stopped = report.early_stopped,
        "training complete"
    );

    let archive_path = trainer.run().run_dir.join("model.slu");
    save_archive(&model, &archive_path)?;
    info!(path = %archive_path.display(), "model archive saved");

    if !test_phase_requested(&config.model) {
        info!("No test dataset configured, skipping test phase.");
    } else if model.prepare_test(&trainer)? {
        trainer.test(&mut model)?;
    } else {
        info!("Test dataset configured but yielded no utterances, skipping test phase.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: TrainArgs,
    }

    #[test]
    fn test_args_collect_overrides() {
        let h = Harness::parse_from([
            "train",
            "--config",
            "slu.toml",
            "--device",
            "cpu",
            "trainer.max_epochs=5",
            "pretrained_encoder.freeze=true",
        ]);
        assert_eq!(h.args.config, PathBuf::from("slu.toml"));
        assert_eq!(h.args.device.as_deref(), Some("cpu"));
        assert_eq!(
            h.args.overrides,
            vec!["trainer.max_epochs=5", "pretrained_encoder.freeze=true"]
        );
    }

    #[test]
    fn test_config_is_required() {
        assert!(Harness::try_parse_from(["train"]).is_err());
    }
}
