//! Self-contained model archives (`.slu` files).
//!
//! An archive is a safetensors file carrying the complete parameter set
//! plus header metadata: a format tag, the architecture config as JSON,
//! the vocabulary spec as JSON, and a SHA-256 digest of the tensor
//! payload. Restore validates the tag and digest and rebuilds the model
//! without needing the original tokenizer file.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use sha2::{Digest, Sha256};

use crate::checkpoint::write_safetensors;
use crate::config::ArchConfig;
use crate::error::{SluError, SluResult};
use crate::model::{SluModel, VocabSpec};

use super::merge::{MergeScope, TensorMap};

/// Format tag stored in archive metadata.
pub const FORMAT_TAG: &str = "slu-archive-v1";

fn corrupt(path: &Path, reason: impl Into<String>) -> SluError {
    SluError::CheckpointCorrupted {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Digest over the tensor payload: names and raw little-endian f32 bytes,
/// in name order.
fn payload_digest<'a>(entries: impl Iterator<Item = (&'a str, &'a [u8])>) -> String {
    let mut hasher = Sha256::new();
    for (name, bytes) in entries {
        hasher.update(name.as_bytes());
        hasher.update(bytes);
    }
    format!("{:x}", hasher.finalize())
}

/// Serialize the complete model to `path`.
pub fn save_archive(model: &SluModel, path: &Path) -> SluResult<()> {
    let state = model.state_snapshot()?;

    let mut byte_payload: Vec<(String, Vec<u8>)> = Vec::with_capacity(state.len());
    for (name, tensor) in &state {
        let flat = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let bytes: Vec<u8> = flat.iter().flat_map(|v| v.to_le_bytes()).collect();
        byte_payload.push((name.clone(), bytes));
    }
    let digest = payload_digest(
        byte_payload
            .iter()
            .map(|(name, bytes)| (name.as_str(), bytes.as_slice())),
    );

    let arch_json = serde_json::to_string(model.arch())
        .map_err(|e| SluError::Config(format!("cannot encode architecture config: {}", e)))?;
    let vocab_json = serde_json::to_string(model.vocab())
        .map_err(|e| SluError::Config(format!("cannot encode vocabulary spec: {}", e)))?;

    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), FORMAT_TAG.to_string());
    metadata.insert("arch".to_string(), arch_json);
    metadata.insert("vocab".to_string(), vocab_json);
    metadata.insert("digest".to_string(), digest);

    write_safetensors(path, &state, None, metadata)
}

/// Read and validate an archive: format tag, digest, and metadata parse.
/// Returns the stored architecture, vocabulary, and tensors (on the CPU).
pub fn load_archive(path: &Path) -> SluResult<(ArchConfig, VocabSpec, TensorMap)> {
    let buf = std::fs::read(path).map_err(|e| SluError::CheckpointUnreadable {
        path: path.to_path_buf(),
        source: e,
    })?;
    let (_, header) =
        SafeTensors::read_metadata(&buf).map_err(|e| corrupt(path, e.to_string()))?;
    let metadata = header
        .metadata()
        .as_ref()
        .ok_or_else(|| corrupt(path, "missing header metadata"))?;

    match metadata.get("format").map(String::as_str) {
        Some(FORMAT_TAG) => {}
        Some(other) => return Err(corrupt(path, format!("unknown format tag `{}`", other))),
        None => return Err(corrupt(path, "missing format tag")),
    }
    let arch: ArchConfig = metadata
        .get("arch")
        .ok_or_else(|| corrupt(path, "missing architecture metadata"))
        .and_then(|json| {
            serde_json::from_str(json)
                .map_err(|e| corrupt(path, format!("invalid architecture metadata: {}", e)))
        })?;
    let vocab: VocabSpec = metadata
        .get("vocab")
        .ok_or_else(|| corrupt(path, "missing vocabulary metadata"))
        .and_then(|json| {
            serde_json::from_str(json)
                .map_err(|e| corrupt(path, format!("invalid vocabulary metadata: {}", e)))
        })?;
    let stored_digest = metadata
        .get("digest")
        .ok_or_else(|| corrupt(path, "missing digest"))?;

    let st = SafeTensors::deserialize(&buf).map_err(|e| corrupt(path, e.to_string()))?;
    let mut raw: Vec<(String, safetensors::tensor::TensorView<'_>)> = st.tensors();
    raw.sort_by(|a, b| a.0.cmp(&b.0));

    let actual_digest = payload_digest(raw.iter().map(|(name, view)| (name.as_str(), view.data())));
    if &actual_digest != stored_digest {
        return Err(corrupt(path, "digest mismatch, archive payload was altered"));
    }

    let mut tensors = TensorMap::new();
    for (name, view) in raw {
        if view.dtype() != safetensors::Dtype::F32 {
            return Err(corrupt(
                path,
                format!("tensor {} has unsupported dtype {:?}", name, view.dtype()),
            ));
        }
        let values: Vec<f32> = view
            .data()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let tensor = Tensor::from_vec(values, view.shape().to_vec(), &Device::Cpu)?;
        tensors.insert(name, tensor);
    }
    Ok((arch, vocab, tensors))
}

/// Restore a complete model instance from an archive onto `device`.
///
/// Unlike the non-strict merges elsewhere, restore is strict: the archive
/// must carry exactly the parameter set the rebuilt module tree expects.
pub fn restore_archive(path: &Path, device: &Device) -> SluResult<SluModel> {
    let (arch, vocab, tensors) = load_archive(path)?;
    let model = SluModel::new(&arch, vocab, device)?;

    let expected = model.param_names();
    let got: Vec<String> = tensors.keys().cloned().collect();
    if expected != got {
        let missing: Vec<&String> = expected.iter().filter(|n| !tensors.contains_key(*n)).collect();
        let extra: Vec<&String> = got
            .iter()
            .filter(|n| !expected.contains(n))
            .collect();
        return Err(corrupt(
            path,
            format!(
                "parameter set mismatch: {} missing, {} unexpected ({:?} / {:?})",
                missing.len(),
                extra.len(),
                missing,
                extra
            ),
        ));
    }
    model.apply_weights(&tensors, MergeScope::WholeModel)?;
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DecoderConfig, EncoderConfig};

    fn tiny_model() -> SluModel {
        let arch = ArchConfig {
            feat_dim: 4,
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
        };
        let vocab = VocabSpec {
            size: 12,
            pad_id: 0,
            bos_id: 2,
            eos_id: 3,
        };
        SluModel::new(&arch, vocab, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_archive_roundtrip_restores_identical_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.slu");
        let model = tiny_model();
        save_archive(&model, &path).unwrap();

        let restored = restore_archive(&path, &Device::Cpu).unwrap();
        assert_eq!(restored.arch(), model.arch());
        assert_eq!(restored.vocab(), model.vocab());

        let a = model.state_snapshot().unwrap();
        let b = restored.state_snapshot().unwrap();
        assert_eq!(a.len(), b.len());
        for (name, t) in &a {
            let x = t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let y = b[name].flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(x, y, "parameter {} differs after restore", name);
        }
    }

    #[test]
    fn test_tampered_payload_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.slu");
        save_archive(&tiny_model(), &path).unwrap();

        // flip one byte near the end of the tensor payload
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = load_archive(&path).unwrap_err();
        assert!(matches!(err, SluError::CheckpointCorrupted { .. }));
        assert!(err.to_string().contains("digest"));
    }

    #[test]
    fn test_non_archive_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.slu");
        // a valid safetensors file that is not an archive (no metadata)
        let mut map = std::collections::HashMap::new();
        map.insert(
            "weight".to_string(),
            Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&map, &path).unwrap();

        let err = load_archive(&path).unwrap_err();
        assert!(matches!(err, SluError::CheckpointCorrupted { .. }));
    }

    #[test]
    fn test_missing_file_unreadable() {
        let err = load_archive(Path::new("/nonexistent/model.slu")).unwrap_err();
        assert!(matches!(err, SluError::CheckpointUnreadable { .. }));
    }
}
