//! Experiment run directory management.
//!
//! Each run gets `<exp_dir>/<name>/<UTC timestamp>/` with a
//! `checkpoints/` subdirectory, and the fully resolved configuration is
//! snapshotted into the run directory as `config.toml` so the run is
//! reproducible from its artifacts alone.

use std::path::PathBuf;

use crate::config::{AppConfig, ExpSection};
use crate::error::{SluError, SluResult};

/// Directories of one training run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
}

impl RunContext {
    /// Create the run directory tree and snapshot the resolved config.
    pub fn create(section: &ExpSection, config: &AppConfig) -> SluResult<Self> {
        let timestamp = chrono::Utc::now().format("%Y-%m-%d_%H-%M-%S");
        let run_dir = section
            .exp_dir
            .join(&section.name)
            .join(timestamp.to_string());
        let ctx = Self::at(run_dir)?;

        let snapshot = toml::to_string_pretty(config)
            .map_err(|e| SluError::Config(format!("cannot serialize config snapshot: {}", e)))?;
        std::fs::write(ctx.run_dir.join("config.toml"), snapshot)?;
        Ok(ctx)
    }

    /// Build a run context at an explicit directory, without a config
    /// snapshot. Used by tests.
    pub fn at(run_dir: PathBuf) -> SluResult<Self> {
        let checkpoint_dir = run_dir.join("checkpoints");
        std::fs::create_dir_all(&checkpoint_dir)?;
        Ok(Self {
            run_dir,
            checkpoint_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DatasetSection, DecoderConfig, EncoderConfig, ModelSection, OptimSection,
        PretrainedEncoderSection, TokenizerSection, TrainerSection,
    };

    fn config(exp: ExpSection) -> AppConfig {
        AppConfig {
            model: ModelSection {
                feat_dim: 8,
                encoder: EncoderConfig {
                    d_model: 16,
                    n_heads: 2,
                    n_layers: 1,
                    ff_dim: 32,
                },
                decoder: DecoderConfig {
                    n_layers: 1,
                    ff_dim: 32,
                    max_target_len: 8,
                },
                tokenizer: TokenizerSection {
                    path: "tokenizer.json".into(),
                    pad_token: "<pad>".into(),
                    unk_token: "<unk>".into(),
                    bos_token: "<s>".into(),
                    eos_token: "</s>".into(),
                },
                train_ds: DatasetSection {
                    manifest_filepath: "train.json".into(),
                    batch_size: 4,
                    shuffle: true,
                },
                validation_ds: None,
                test_ds: None,
                optim: OptimSection::default(),
            },
            trainer: TrainerSection::default(),
            exp,
            pretrained_encoder: PretrainedEncoderSection::default(),
        }
    }

    #[test]
    fn test_create_writes_tree_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let section = ExpSection {
            name: "unit".to_string(),
            exp_dir: dir.path().to_path_buf(),
        };
        let ctx = RunContext::create(&section, &config(section.clone())).unwrap();

        assert!(ctx.checkpoint_dir.is_dir());
        assert!(ctx.run_dir.starts_with(dir.path().join("unit")));
        let snapshot = std::fs::read_to_string(ctx.run_dir.join("config.toml")).unwrap();
        assert!(snapshot.contains("feat_dim = 8"));
    }
}
