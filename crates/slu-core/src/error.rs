//! Error types for slu-core.
//!
//! Defines the central [`SluError`] used throughout the crate, along with
//! the [`SluResult<T>`] alias. No variant is ever recovered from locally:
//! every failure propagates to the process boundary and aborts the run.
//!
//! Partial key mismatches during weight merging are deliberately *not*
//! represented here. Non-strict loading ignores unmatched parameter names
//! in both directions; only a matched name with a differing shape is an
//! error ([`SluError::ShapeMismatch`]).

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for slu-core operations.
#[derive(Debug, Error)]
pub enum SluError {
    /// A symbolic pretrained-encoder name matched no recognized prefix.
    ///
    /// Raised at configuration validation, before any load is attempted.
    #[error("Unknown pretrained encoder: {name}")]
    UnknownEncoderKind {
        /// The offending symbolic name.
        name: String,
    },

    /// A checkpoint or archive file exists but could not be read.
    #[error("Cannot read checkpoint {path}: {source}")]
    CheckpointUnreadable {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A checkpoint or archive file was read but its contents are invalid.
    ///
    /// Covers safetensors parse failures, a checkpoint with no
    /// `state_dict.` entries, and archives with a bad format tag or digest.
    #[error("Corrupt checkpoint {path}: {reason}")]
    CheckpointCorrupted {
        /// Path of the invalid file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// A symbolic name could not be resolved against the remote model zoo.
    #[error("Remote lookup failed for {name}: {source}")]
    RemoteLookup {
        /// The symbolic model name.
        name: String,
        /// Underlying registry/network failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A source parameter matched a target name but with a different shape.
    #[error("Shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Parameter name that matched.
        name: String,
        /// Shape of the target parameter.
        expected: Vec<usize>,
        /// Shape of the source parameter.
        got: Vec<usize>,
    },

    /// Configuration is invalid, unparseable, or violates a constraint.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A dataset manifest line could not be parsed.
    #[error("Manifest error in {path} line {line}: {reason}")]
    Manifest {
        /// Manifest file path.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// Parse failure description.
        reason: String,
    },

    /// Tokenizer loading or encoding failure.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Tensor computation failure from the Candle backend.
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Filesystem I/O failure outside checkpoint reading.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout slu-core.
pub type SluResult<T> = Result<T, SluError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_encoder_kind_carries_name() {
        let err = SluError::UnknownEncoderKind {
            name: "conformer_large".to_string(),
        };
        assert!(err.to_string().contains("conformer_large"));
    }

    #[test]
    fn test_shape_mismatch_display() {
        let err = SluError::ShapeMismatch {
            name: "encoder.proj.weight".to_string(),
            expected: vec![144, 80],
            got: vec![144, 64],
        };
        let msg = err.to_string();
        assert!(msg.contains("encoder.proj.weight"));
        assert!(msg.contains("[144, 80]"));
        assert!(msg.contains("[144, 64]"));
    }

    #[test]
    fn test_candle_error_converts() {
        fn fails() -> SluResult<()> {
            let t = candle_core::Tensor::zeros(
                (2, 2),
                candle_core::DType::F32,
                &candle_core::Device::Cpu,
            )?;
            // 3 is out of range for a rank-2 tensor
            t.sum(3)?;
            Ok(())
        }
        assert!(matches!(fails(), Err(SluError::Tensor(_))));
    }
}
