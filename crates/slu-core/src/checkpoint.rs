//! Training checkpoint I/O.
//!
//! Checkpoints are safetensors files whose model parameters live under the
//! `state_dict.` key prefix, with epoch and validation loss carried in the
//! header metadata. This is exactly the format the pretrained-encoder
//! resolver consumes for a local non-archive file: it selects the
//! `state_dict.` sub-mapping, strips the prefix, and merges the result
//! into the whole model.

use std::collections::HashMap;
use std::path::Path;

use candle_core::Device;
use safetensors::tensor::TensorView;
use safetensors::Dtype;

use crate::error::{SluError, SluResult};
use crate::pretrained::merge::TensorMap;

/// Key prefix under which model parameters are stored in checkpoints.
pub const STATE_DICT_PREFIX: &str = "state_dict.";

/// Header metadata attached to a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckpointMeta {
    /// 1-based epoch the checkpoint was written after.
    pub epoch: u32,
    /// Validation loss at that epoch, if validation ran.
    pub val_loss: Option<f32>,
}

/// Write a checkpoint: every entry of `state` stored under
/// [`STATE_DICT_PREFIX`], metadata in the header.
pub fn save_checkpoint(path: &Path, state: &TensorMap, meta: &CheckpointMeta) -> SluResult<()> {
    let mut metadata = HashMap::new();
    metadata.insert("epoch".to_string(), meta.epoch.to_string());
    if let Some(val_loss) = meta.val_loss {
        metadata.insert("val_loss".to_string(), val_loss.to_string());
    }
    write_safetensors(path, state, Some(STATE_DICT_PREFIX), metadata)
}

/// Read the epoch/val_loss metadata back from a checkpoint.
pub fn read_checkpoint_meta(path: &Path) -> SluResult<CheckpointMeta> {
    let buf = std::fs::read(path).map_err(|e| SluError::CheckpointUnreadable {
        path: path.to_path_buf(),
        source: e,
    })?;
    let (_, meta) = safetensors::SafeTensors::read_metadata(&buf).map_err(|e| {
        SluError::CheckpointCorrupted {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    })?;
    let md = meta.metadata().as_ref().ok_or_else(|| SluError::CheckpointCorrupted {
        path: path.to_path_buf(),
        reason: "missing header metadata".to_string(),
    })?;
    let epoch = md
        .get("epoch")
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| SluError::CheckpointCorrupted {
            path: path.to_path_buf(),
            reason: "missing or invalid `epoch` metadata".to_string(),
        })?;
    let val_loss = md.get("val_loss").and_then(|v| v.parse::<f32>().ok());
    Ok(CheckpointMeta { epoch, val_loss })
}

/// Load the `state_dict.` sub-mapping from a checkpoint, prefix stripped.
///
/// A safetensors file with no `state_dict.` entries is a corrupt
/// checkpoint: it is not what the trainer writes.
pub fn load_state_dict(path: &Path, device: &Device) -> SluResult<TensorMap> {
    let tensors = candle_core::safetensors::load(path, device).map_err(|e| {
        SluError::CheckpointCorrupted {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    })?;
    let mut state = TensorMap::new();
    for (name, tensor) in tensors {
        if let Some(stripped) = name.strip_prefix(STATE_DICT_PREFIX) {
            state.insert(stripped.to_string(), tensor);
        }
    }
    if state.is_empty() {
        return Err(SluError::CheckpointCorrupted {
            path: path.to_path_buf(),
            reason: format!("no `{}` entries", STATE_DICT_PREFIX),
        });
    }
    Ok(state)
}

/// Serialize a tensor map to a safetensors file with header metadata,
/// optionally prefixing every tensor name.
pub(crate) fn write_safetensors(
    path: &Path,
    tensors: &TensorMap,
    name_prefix: Option<&str>,
    metadata: HashMap<String, String>,
) -> SluResult<()> {
    let mut payload: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        let flat = tensor
            .to_dtype(candle_core::DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let bytes: Vec<u8> = flat.iter().flat_map(|v| v.to_le_bytes()).collect();
        let stored_name = match name_prefix {
            Some(prefix) => format!("{prefix}{name}"),
            None => name.clone(),
        };
        payload.push((stored_name, tensor.dims().to_vec(), bytes));
    }

    let views: Vec<(&str, TensorView<'_>)> = payload
        .iter()
        .map(|(name, shape, bytes)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes)
                .map(|view| (name.as_str(), view))
                .map_err(|e| SluError::CheckpointCorrupted {
                    path: path.to_path_buf(),
                    reason: format!("cannot build tensor view for {}: {}", name, e),
                })
        })
        .collect::<SluResult<_>>()?;

    safetensors::serialize_to_file(views, &Some(metadata), path)
        .map_err(|e| SluError::Io(std::io::Error::other(e)))?;
    Ok(())
}
