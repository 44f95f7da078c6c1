//! JSONL dataset manifests.
//!
//! One utterance per line:
//!
//! ```json
//! {"feature_filepath": "feats/utt1.safetensors", "duration": 2.4, "text": "turn_on ( device : lights )"}
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{SluError, SluResult};

/// A single manifest line.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManifestEntry {
    /// Path to the utterance's precomputed feature tensor.
    pub feature_filepath: PathBuf,
    /// Utterance duration in seconds, if known.
    #[serde(default)]
    pub duration: Option<f64>,
    /// Serialized intent/slot semantics.
    pub text: String,
}

/// Read a JSONL manifest. Blank lines are skipped; a malformed line fails
/// with its 1-based line number.
pub fn read_manifest(path: &Path) -> SluResult<Vec<ManifestEntry>> {
    let contents = std::fs::read_to_string(path).map_err(|e| SluError::Manifest {
        path: path.to_path_buf(),
        line: 0,
        reason: format!("cannot read manifest: {}", e),
    })?;

    let mut entries = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: ManifestEntry =
            serde_json::from_str(line).map_err(|e| SluError::Manifest {
                path: path.to_path_buf(),
                line: idx + 1,
                reason: e.to_string(),
            })?;
        if entry.text.trim().is_empty() {
            return Err(SluError::Manifest {
                path: path.to_path_buf(),
                line: idx + 1,
                reason: "empty `text` field".to_string(),
            });
        }
        entries.push(entry);
    }
    Ok(entries)
}
