//! Configuration for the SLU training entry point.
//!
//! Configuration is a nested TOML document deserialized into [`AppConfig`],
//! optionally patched by dotted `section.key=value` overrides before
//! deserialization (see [`overrides`]). It is loaded once, validated once,
//! and immutable for the duration of a run.
//!
//! Validation also classifies the overloaded `pretrained_encoder.name`
//! field into an explicit [`PretrainedSource`] so that the "does this
//! string happen to be a path" probe runs exactly once, at startup.
//!
//! [`PretrainedSource`]: crate::pretrained::PretrainedSource

pub mod overrides;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{SluError, SluResult};
use crate::pretrained::registry::ZooRegistry;
use crate::pretrained::PretrainedSource;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub model: ModelSection,
    #[serde(default)]
    pub trainer: TrainerSection,
    #[serde(default)]
    pub exp: ExpSection,
    #[serde(default)]
    pub pretrained_encoder: PretrainedEncoderSection,
}

/// Model architecture, datasets, tokenizer, and optimizer settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSection {
    /// Input feature dimension (filterbank bins per frame).
    pub feat_dim: usize,
    pub encoder: EncoderConfig,
    pub decoder: DecoderConfig,
    pub tokenizer: TokenizerSection,
    pub train_ds: DatasetSection,
    #[serde(default)]
    pub validation_ds: Option<DatasetSection>,
    #[serde(default)]
    pub test_ds: Option<DatasetSection>,
    #[serde(default)]
    pub optim: OptimSection,
}

impl ModelSection {
    /// The architecture subset of this section, as stored in model archives.
    pub fn arch(&self) -> ArchConfig {
        ArchConfig {
            feat_dim: self.feat_dim,
            encoder: self.encoder.clone(),
            decoder: self.decoder.clone(),
        }
    }
}

/// Architecture-only configuration: what is needed to rebuild the module
/// tree, without dataset or optimizer settings. Serialized into `.slu`
/// archive metadata.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ArchConfig {
    pub feat_dim: usize,
    pub encoder: EncoderConfig,
    pub decoder: DecoderConfig,
}

/// Speech encoder hyperparameters.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EncoderConfig {
    /// Model width. Must be divisible by `n_heads`.
    pub d_model: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub ff_dim: usize,
}

/// Semantics decoder hyperparameters. Shares `d_model`/`n_heads` with the
/// encoder.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DecoderConfig {
    pub n_layers: usize,
    pub ff_dim: usize,
    /// Maximum target length produced by greedy decoding.
    pub max_target_len: usize,
}

/// Tokenizer file and special-token names.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TokenizerSection {
    /// Path to a HuggingFace `tokenizer.json` file.
    pub path: PathBuf,
    #[serde(default = "default_pad_token")]
    pub pad_token: String,
    #[serde(default = "default_unk_token")]
    pub unk_token: String,
    #[serde(default = "default_bos_token")]
    pub bos_token: String,
    #[serde(default = "default_eos_token")]
    pub eos_token: String,
}

fn default_pad_token() -> String {
    "<pad>".to_string()
}
fn default_unk_token() -> String {
    "<unk>".to_string()
}
fn default_bos_token() -> String {
    "<s>".to_string()
}
fn default_eos_token() -> String {
    "</s>".to_string()
}

/// One dataset split: a manifest plus batching settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetSection {
    /// JSONL manifest path. May be empty for `test_ds`, which disables the
    /// test phase.
    #[serde(default)]
    pub manifest_filepath: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
}

fn default_batch_size() -> usize {
    8
}
fn default_shuffle() -> bool {
    true
}

/// AdamW hyperparameters and schedule settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OptimSection {
    #[serde(default = "default_lr")]
    pub lr: f64,
    /// Encoder learning rate. Defaults to `lr` when absent; fine-tuning a
    /// pretrained encoder usually wants this lower.
    #[serde(default)]
    pub encoder_lr: Option<f64>,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,
    #[serde(default)]
    pub warmup_steps: usize,
}

fn default_lr() -> f64 {
    1e-3
}
fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.999
}
fn default_weight_decay() -> f64 {
    1e-4
}
fn default_max_grad_norm() -> f64 {
    1.0
}

impl Default for OptimSection {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            encoder_lr: None,
            beta1: default_beta1(),
            beta2: default_beta2(),
            weight_decay: default_weight_decay(),
            max_grad_norm: default_max_grad_norm(),
            warmup_steps: 0,
        }
    }
}

/// Trainer loop settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TrainerSection {
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Run validation every N epochs.
    #[serde(default = "default_eval_every")]
    pub eval_every: usize,
    /// Stop after this many validations without improvement.
    #[serde(default = "default_patience")]
    pub early_stopping_patience: usize,
    /// `auto`, `cpu`, or `cuda[:N]`.
    #[serde(default = "default_device")]
    pub device: String,
}

fn default_max_epochs() -> usize {
    100
}
fn default_seed() -> u64 {
    42
}
fn default_eval_every() -> usize {
    1
}
fn default_patience() -> usize {
    10
}
fn default_device() -> String {
    "auto".to_string()
}

impl Default for TrainerSection {
    fn default() -> Self {
        Self {
            max_epochs: default_max_epochs(),
            seed: default_seed(),
            eval_every: default_eval_every(),
            early_stopping_patience: default_patience(),
            device: default_device(),
        }
    }
}

/// Experiment manager settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExpSection {
    #[serde(default = "default_exp_name")]
    pub name: String,
    #[serde(default = "default_exp_dir")]
    pub exp_dir: PathBuf,
}

fn default_exp_name() -> String {
    "slu_train".to_string()
}
fn default_exp_dir() -> PathBuf {
    PathBuf::from("experiments")
}

impl Default for ExpSection {
    fn default() -> Self {
        Self {
            name: default_exp_name(),
            exp_dir: default_exp_dir(),
        }
    }
}

/// Pretrained encoder sourcing and freeze policy.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PretrainedEncoderSection {
    /// Absent/empty, a local checkpoint or archive path, or a symbolic
    /// model-zoo name (`ssl_*` / `stt_*`).
    #[serde(default)]
    pub name: Option<String>,
    /// Disable gradient updates for the encoder after initialization.
    #[serde(default)]
    pub freeze: bool,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> SluResult<Self> {
        Self::load_with_overrides(path, &[])
    }

    /// Load configuration from a TOML file and apply dotted
    /// `section.key=value` overrides onto the value tree before
    /// deserialization.
    pub fn load_with_overrides(path: &Path, raw_overrides: &[String]) -> SluResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SluError::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        let mut value: toml::Value = text.parse().map_err(|e| {
            SluError::Config(format!("cannot parse {}: {}", path.display(), e))
        })?;
        overrides::apply_overrides(&mut value, raw_overrides)?;
        let config: AppConfig = value
            .try_into()
            .map_err(|e| SluError::Config(format!("invalid configuration: {}", e)))?;
        Ok(config)
    }

    /// Validate all sections and classify the pretrained encoder source.
    ///
    /// The filesystem probe and the symbolic-name prefix match both happen
    /// here, exactly once per run. An unrecognized symbolic name fails with
    /// [`SluError::UnknownEncoderKind`] before any load is attempted.
    pub fn validate(&self, registry: &ZooRegistry) -> SluResult<PretrainedSource> {
        let enc = &self.model.encoder;
        if self.model.feat_dim == 0 {
            return Err(SluError::Config("model.feat_dim must be positive".into()));
        }
        if enc.d_model == 0 || enc.n_heads == 0 || enc.n_layers == 0 || enc.ff_dim == 0 {
            return Err(SluError::Config(
                "model.encoder dimensions must be positive".into(),
            ));
        }
        if enc.d_model % enc.n_heads != 0 {
            return Err(SluError::Config(format!(
                "model.encoder.d_model ({}) must be divisible by n_heads ({})",
                enc.d_model, enc.n_heads
            )));
        }
        let dec = &self.model.decoder;
        if dec.n_layers == 0 || dec.ff_dim == 0 {
            return Err(SluError::Config(
                "model.decoder dimensions must be positive".into(),
            ));
        }
        if dec.max_target_len < 2 {
            return Err(SluError::Config(
                "model.decoder.max_target_len must be at least 2".into(),
            ));
        }
        if self.model.tokenizer.path.as_os_str().is_empty() {
            return Err(SluError::Config("model.tokenizer.path is required".into()));
        }
        if self.model.train_ds.manifest_filepath.trim().is_empty() {
            return Err(SluError::Config(
                "model.train_ds.manifest_filepath is required".into(),
            ));
        }
        if self.model.train_ds.batch_size == 0 {
            return Err(SluError::Config(
                "model.train_ds.batch_size must be positive".into(),
            ));
        }
        let optim = &self.model.optim;
        if optim.lr <= 0.0 {
            return Err(SluError::Config("model.optim.lr must be positive".into()));
        }
        for (name, beta) in [("beta1", optim.beta1), ("beta2", optim.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(SluError::Config(format!(
                    "model.optim.{} must be in [0, 1), got {}",
                    name, beta
                )));
            }
        }
        if self.trainer.max_epochs == 0 {
            return Err(SluError::Config("trainer.max_epochs must be positive".into()));
        }
        if self.trainer.eval_every == 0 {
            return Err(SluError::Config("trainer.eval_every must be positive".into()));
        }

        PretrainedSource::classify(self.pretrained_encoder.name.as_deref(), registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_toml() -> String {
        r#"
            [model]
            feat_dim = 80

            [model.encoder]
            d_model = 144
            n_heads = 4
            n_layers = 2
            ff_dim = 256

            [model.decoder]
            n_layers = 2
            ff_dim = 256
            max_target_len = 64

            [model.tokenizer]
            path = "tokenizer.json"

            [model.train_ds]
            manifest_filepath = "train.json"
        "#
        .to_string()
    }

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_minimal_config_defaults() {
        let (_dir, path) = write_config(&minimal_toml());
        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.model.feat_dim, 80);
        assert_eq!(cfg.model.train_ds.batch_size, 8);
        assert!(cfg.model.train_ds.shuffle);
        assert_eq!(cfg.trainer.max_epochs, 100);
        assert_eq!(cfg.trainer.seed, 42);
        assert!(cfg.pretrained_encoder.name.is_none());
        assert!(!cfg.pretrained_encoder.freeze);
        assert!(cfg.model.test_ds.is_none());
    }

    #[test]
    fn test_validate_accepts_minimal() {
        let (_dir, path) = write_config(&minimal_toml());
        let cfg = AppConfig::load(&path).unwrap();
        let source = cfg.validate(&ZooRegistry::new()).unwrap();
        assert!(matches!(source, PretrainedSource::None));
    }

    #[test]
    fn test_validate_rejects_indivisible_heads() {
        let mut toml = minimal_toml();
        toml = toml.replace("n_heads = 4", "n_heads = 5");
        let (_dir, path) = write_config(&toml);
        let cfg = AppConfig::load(&path).unwrap();
        let err = cfg.validate(&ZooRegistry::new()).unwrap_err();
        assert!(matches!(err, SluError::Config(_)));
        assert!(err.to_string().contains("divisible"));
    }

    #[test]
    fn test_validate_rejects_missing_train_manifest() {
        let toml = minimal_toml().replace("manifest_filepath = \"train.json\"", "manifest_filepath = \"\"");
        let (_dir, path) = write_config(&toml);
        let cfg = AppConfig::load(&path).unwrap();
        assert!(cfg.validate(&ZooRegistry::new()).is_err());
    }

    #[test]
    fn test_load_with_overrides_patches_values() {
        let (_dir, path) = write_config(&minimal_toml());
        let cfg = AppConfig::load_with_overrides(
            &path,
            &[
                "trainer.max_epochs=5".to_string(),
                "model.optim.lr=0.0001".to_string(),
                "pretrained_encoder.freeze=true".to_string(),
            ],
        )
        .unwrap();
        assert_eq!(cfg.trainer.max_epochs, 5);
        assert!((cfg.model.optim.lr - 1e-4).abs() < 1e-12);
        assert!(cfg.pretrained_encoder.freeze);
    }

    #[test]
    fn test_override_into_omitted_section() {
        // minimal_toml has no [trainer] table at all
        let (_dir, path) = write_config(&minimal_toml());
        let cfg =
            AppConfig::load_with_overrides(&path, &["trainer.max_epochs=50".to_string()]).unwrap();
        assert_eq!(cfg.trainer.max_epochs, 50);
        // untouched trainer fields keep their defaults
        assert_eq!(cfg.trainer.seed, 42);
    }

    #[test]
    fn test_override_with_misspelled_key_rejected() {
        let mut toml = minimal_toml();
        toml.push_str("\n[trainer]\nmax_epochs = 100\n");
        let (_dir, path) = write_config(&toml);
        let err = AppConfig::load_with_overrides(&path, &["trainer.max_epoch=5".to_string()])
            .unwrap_err();
        assert!(matches!(err, SluError::Config(_)));
        assert!(err.to_string().contains("max_epoch"));
    }

    #[test]
    fn test_override_with_unknown_section_rejected() {
        let (_dir, path) = write_config(&minimal_toml());
        let err =
            AppConfig::load_with_overrides(&path, &["nonexistent.key=1".to_string()]).unwrap_err();
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn test_arch_subset_roundtrips_as_json() {
        let (_dir, path) = write_config(&minimal_toml());
        let cfg = AppConfig::load(&path).unwrap();
        let arch = cfg.model.arch();
        let json = serde_json::to_string(&arch).unwrap();
        let back: ArchConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(arch, back);
    }
}
