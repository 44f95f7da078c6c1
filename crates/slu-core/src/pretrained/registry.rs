//! Prefix registry for remote pretrained models.
//!
//! Symbolic encoder names are routed to fetchers by name prefix. The two
//! built-in entries mirror the model-zoo naming convention: `ssl_` for
//! self-supervised speech encoders and `stt_` for full speech-to-text
//! recognizers. Additional prefixes can be registered without touching
//! the resolver's branch logic.

use std::path::PathBuf;
use std::sync::Arc;

use candle_core::Device;

use crate::error::{SluError, SluResult};

use super::merge::{TensorMap, ENCODER_PREFIX};

/// What kind of model a symbolic name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    /// Self-supervised speech encoder (`ssl_` prefix).
    SelfSupervised,
    /// Speech-to-text recognizer (`stt_` prefix).
    Recognizer,
}

impl std::fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncoderKind::SelfSupervised => write!(f, "self-supervised"),
            EncoderKind::Recognizer => write!(f, "speech recognition"),
        }
    }
}

/// Capability to fetch a named model's weights from the zoo.
pub trait EncoderFetch: Send + Sync {
    /// The model kind this fetcher produces.
    fn kind(&self) -> EncoderKind;

    /// Download (or read from cache) the named model and return its full
    /// parameter mapping on the CPU.
    fn fetch(&self, name: &str) -> SluResult<TensorMap>;
}

/// Mapping from recognized name prefixes to fetchers. First matching
/// prefix wins; registration order is lookup order.
pub struct ZooRegistry {
    entries: Vec<(String, Arc<dyn EncoderFetch>)>,
}

impl ZooRegistry {
    /// An empty registry. Useful for tests and for callers that register
    /// their own fetchers.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// The production registry: `ssl_` and `stt_` entries backed by the
    /// HuggingFace Hub, downloading into `cache_dir` when given.
    pub fn with_builtin(cache_dir: Option<PathBuf>) -> Self {
        let mut registry = Self::new();
        registry.register(
            "ssl_",
            Arc::new(HubFetcher::new(EncoderKind::SelfSupervised, cache_dir.clone())),
        );
        registry.register(
            "stt_",
            Arc::new(HubFetcher::new(EncoderKind::Recognizer, cache_dir)),
        );
        registry
    }

    /// Register a fetcher for a name prefix.
    pub fn register(&mut self, prefix: impl Into<String>, fetcher: Arc<dyn EncoderFetch>) {
        self.entries.push((prefix.into(), fetcher));
    }

    /// The fetcher whose prefix matches `name`, if any.
    pub fn fetcher_for(&self, name: &str) -> Option<&Arc<dyn EncoderFetch>> {
        self.entries
            .iter()
            .find(|(prefix, _)| name.starts_with(prefix.as_str()))
            .map(|(_, fetcher)| fetcher)
    }

    /// The model kind `name` would resolve to, if its prefix is known.
    pub fn kind_for(&self, name: &str) -> Option<EncoderKind> {
        self.fetcher_for(name).map(|f| f.kind())
    }
}

impl Default for ZooRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Production fetcher: downloads `config.json` and `model.safetensors`
/// from the HuggingFace Hub via the synchronous API.
pub struct HubFetcher {
    kind: EncoderKind,
    cache_dir: Option<PathBuf>,
}

impl HubFetcher {
    pub fn new(kind: EncoderKind, cache_dir: Option<PathBuf>) -> Self {
        Self { kind, cache_dir }
    }

    fn remote_err(name: &str, e: impl std::error::Error + Send + Sync + 'static) -> SluError {
        SluError::RemoteLookup {
            name: name.to_string(),
            source: Box::new(e),
        }
    }
}

impl EncoderFetch for HubFetcher {
    fn kind(&self) -> EncoderKind {
        self.kind
    }

    fn fetch(&self, name: &str) -> SluResult<TensorMap> {
        let mut builder = hf_hub::api::sync::ApiBuilder::new().with_progress(false);
        if let Some(dir) = &self.cache_dir {
            builder = builder.with_cache_dir(dir.clone());
        }
        let api = builder.build().map_err(|e| Self::remote_err(name, e))?;
        let repo = api.model(name.to_string());

        // config.json is fetched for cache completeness and as an early
        // existence check before the large weights download
        repo.get("config.json").map_err(|e| Self::remote_err(name, e))?;
        let weights = repo
            .get("model.safetensors")
            .map_err(|e| Self::remote_err(name, e))?;

        let tensors = candle_core::safetensors::load(&weights, &Device::Cpu).map_err(|e| {
            SluError::CheckpointCorrupted {
                path: weights.clone(),
                reason: e.to_string(),
            }
        })?;
        let map: TensorMap = tensors.into_iter().collect();
        if !map.keys().any(|k| k.starts_with(ENCODER_PREFIX)) {
            return Err(SluError::CheckpointCorrupted {
                path: weights,
                reason: format!("{} model {} has no encoder parameters", self.kind, name),
            });
        }
        Ok(map)
    }
}
