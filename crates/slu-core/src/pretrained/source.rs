//! Classification of the pretrained-encoder reference.
//!
//! The `pretrained_encoder.name` configuration field is overloaded: it can
//! be absent, a filesystem path, or a symbolic model-zoo name. Rather than
//! re-inferring the meaning from filesystem probes at use sites, it is
//! classified exactly once, at configuration validation time, into this
//! explicit tagged variant.

use std::path::{Path, PathBuf};

use crate::error::{SluError, SluResult};

use super::registry::{EncoderKind, ZooRegistry};

/// File extension of self-contained model archives.
pub const ARCHIVE_EXTENSION: &str = "slu";

/// Where the pretrained encoder weights come from, decided once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PretrainedSource {
    /// No pretrained source; the encoder keeps its random initialization.
    None,
    /// An existing local file without the archive extension: a raw
    /// training checkpoint whose `state_dict.` entries apply to the whole
    /// model.
    LocalCheckpoint(PathBuf),
    /// An existing local `.slu` archive: a complete serialized model whose
    /// full parameter mapping applies to the whole model.
    LocalArchive(PathBuf),
    /// A symbolic model-zoo name; only the fetched model's `encoder.*`
    /// parameters apply, into the target encoder.
    Remote {
        name: String,
        kind: EncoderKind,
    },
}

impl PretrainedSource {
    /// Classify a raw configuration value. Empty and whitespace-only
    /// strings count as absent. A name that is neither an existing file
    /// nor a recognized zoo prefix fails with
    /// [`SluError::UnknownEncoderKind`].
    pub fn classify(raw: Option<&str>, registry: &ZooRegistry) -> SluResult<Self> {
        let Some(name) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(PretrainedSource::None);
        };
        let path = Path::new(name);
        if path.is_file() {
            let is_archive = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == ARCHIVE_EXTENSION);
            return Ok(if is_archive {
                PretrainedSource::LocalArchive(path.to_path_buf())
            } else {
                PretrainedSource::LocalCheckpoint(path.to_path_buf())
            });
        }
        match registry.kind_for(name) {
            Some(kind) => Ok(PretrainedSource::Remote {
                name: name.to_string(),
                kind,
            }),
            None => Err(SluError::UnknownEncoderKind {
                name: name.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for PretrainedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PretrainedSource::None => write!(f, "none"),
            PretrainedSource::LocalCheckpoint(path) => {
                write!(f, "local checkpoint {}", path.display())
            }
            PretrainedSource::LocalArchive(path) => {
                write!(f, "local archive {}", path.display())
            }
            PretrainedSource::Remote { name, kind } => {
                write!(f, "remote {} model {}", kind, name)
            }
        }
    }
}
