//! In-memory SLU dataset with padded batching.
//!
//! Features are loaded eagerly from per-utterance safetensors files and
//! kept as flat `f32` buffers; tensors are materialized per batch on the
//! training device. Targets are tokenized once at load time.

use std::path::Path;

use candle_core::{Device, Tensor};
use tokenizers::Tokenizer;

use crate::config::DatasetSection;
use crate::error::{SluError, SluResult};
use crate::model::VocabSpec;

use super::manifest::read_manifest;

/// Tensor name expected inside per-utterance feature files.
pub const FEATURES_TENSOR: &str = "features";

/// One loaded utterance: flat feature buffer plus tokenized target.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Row-major `[frames, feat_dim]` feature values.
    pub feats: Vec<f32>,
    /// Number of feature frames.
    pub frames: usize,
    /// Tokenized semantics target, without BOS/EOS.
    pub target: Vec<u32>,
}

/// A padded training batch.
#[derive(Debug)]
pub struct SluBatch {
    /// `[batch, max_frames, feat_dim]` f32.
    pub features: Tensor,
    /// Valid frame count per utterance.
    pub feat_lens: Vec<usize>,
    /// `[batch, max_len]` u32, BOS-prefixed teacher-forcing input.
    pub targets_in: Tensor,
    /// `[batch, max_len]` u32, EOS-suffixed expected output.
    pub targets_out: Tensor,
    /// `[batch, max_len]` f32, 1.0 on valid target positions.
    pub target_mask: Tensor,
    /// Number of utterances in the batch.
    pub size: usize,
}

/// A fully loaded dataset split.
#[derive(Debug)]
pub struct SluDataset {
    utterances: Vec<Utterance>,
    feat_dim: usize,
    batch_size: usize,
    shuffle: bool,
}

impl SluDataset {
    /// Load a split: read the manifest, load every feature file, tokenize
    /// every target.
    pub fn load(
        section: &DatasetSection,
        tokenizer: &Tokenizer,
        feat_dim: usize,
    ) -> SluResult<Self> {
        let manifest_path = Path::new(&section.manifest_filepath);
        let entries = read_manifest(manifest_path)?;

        let mut utterances = Vec::with_capacity(entries.len());
        for entry in &entries {
            let (feats, frames) = load_features(&entry.feature_filepath, feat_dim)?;
            let encoding = tokenizer
                .encode(entry.text.as_str(), false)
                .map_err(|e| SluError::Tokenizer(e.to_string()))?;
            let target = encoding.get_ids().to_vec();
            if target.is_empty() {
                return Err(SluError::Tokenizer(format!(
                    "text `{}` tokenized to nothing",
                    entry.text
                )));
            }
            utterances.push(Utterance {
                feats,
                frames,
                target,
            });
        }

        Ok(Self {
            utterances,
            feat_dim,
            batch_size: section.batch_size,
            shuffle: section.shuffle,
        })
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn shuffle(&self) -> bool {
        self.shuffle
    }

    pub fn utterance(&self, idx: usize) -> &Utterance {
        &self.utterances[idx]
    }

    /// Materialize one utterance's features as a `[1, frames, feat_dim]`
    /// tensor on `device`.
    pub fn features_tensor(&self, idx: usize, device: &Device) -> SluResult<Tensor> {
        let utt = &self.utterances[idx];
        let t = Tensor::from_vec(utt.feats.clone(), (1, utt.frames, self.feat_dim), device)?;
        Ok(t)
    }

    /// Build a padded batch for the given utterance indices.
    pub fn batch(
        &self,
        indices: &[usize],
        vocab: &VocabSpec,
        device: &Device,
    ) -> SluResult<SluBatch> {
        if indices.is_empty() {
            return Err(SluError::Config("cannot build an empty batch".into()));
        }
        let b = indices.len();
        let max_frames = indices
            .iter()
            .map(|&i| self.utterances[i].frames)
            .max()
            .unwrap_or(0);
        // +1 for the BOS/EOS position
        let max_len = indices
            .iter()
            .map(|&i| self.utterances[i].target.len())
            .max()
            .unwrap_or(0)
            + 1;

        let mut features = vec![0f32; b * max_frames * self.feat_dim];
        let mut targets_in = vec![vocab.pad_id; b * max_len];
        let mut targets_out = vec![vocab.pad_id; b * max_len];
        let mut mask = vec![0f32; b * max_len];
        let mut feat_lens = Vec::with_capacity(b);

        for (row, &i) in indices.iter().enumerate() {
            let utt = &self.utterances[i];
            let frames = utt.frames;
            feat_lens.push(frames);
            let dst = row * max_frames * self.feat_dim;
            features[dst..dst + frames * self.feat_dim].copy_from_slice(&utt.feats);

            let base = row * max_len;
            targets_in[base] = vocab.bos_id;
            for (j, &id) in utt.target.iter().enumerate() {
                targets_in[base + j + 1] = id;
                targets_out[base + j] = id;
            }
            targets_out[base + utt.target.len()] = vocab.eos_id;
            for j in 0..=utt.target.len() {
                mask[base + j] = 1.0;
            }
        }

        Ok(SluBatch {
            features: Tensor::from_vec(features, (b, max_frames, self.feat_dim), device)?,
            feat_lens,
            targets_in: Tensor::from_vec(targets_in, (b, max_len), device)?,
            targets_out: Tensor::from_vec(targets_out, (b, max_len), device)?,
            target_mask: Tensor::from_vec(mask, (b, max_len), device)?,
            size: b,
        })
    }
}

/// Load one utterance's `features` tensor and flatten it.
fn load_features(path: &Path, feat_dim: usize) -> SluResult<(Vec<f32>, usize)> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu).map_err(|e| {
        SluError::CheckpointCorrupted {
            path: path.to_path_buf(),
            reason: format!("cannot load feature file: {}", e),
        }
    })?;
    let t = tensors
        .get(FEATURES_TENSOR)
        .ok_or_else(|| SluError::CheckpointCorrupted {
            path: path.to_path_buf(),
            reason: format!("feature file has no `{}` tensor", FEATURES_TENSOR),
        })?;
    let (frames, dim) = t.dims2().map_err(|_| SluError::CheckpointCorrupted {
        path: path.to_path_buf(),
        reason: format!("`{}` tensor is not rank 2", FEATURES_TENSOR),
    })?;
    if dim != feat_dim {
        return Err(SluError::CheckpointCorrupted {
            path: path.to_path_buf(),
            reason: format!("feature dim {} does not match model.feat_dim {}", dim, feat_dim),
        });
    }
    let flat = t
        .to_dtype(candle_core::DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    Ok((flat, frames))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use std::path::PathBuf;

    const FEAT_DIM: usize = 4;

    fn write_tokenizer(dir: &Path) -> PathBuf {
        let vocab: HashMap<&str, u32> = [
            ("<pad>", 0),
            ("<unk>", 1),
            ("<s>", 2),
            ("</s>", 3),
            ("turn", 4),
            ("on", 5),
            ("off", 6),
            ("lights", 7),
        ]
        .into_iter()
        .collect();
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
        });
        let path = dir.join("tokenizer.json");
        std::fs::write(&path, serde_json::to_string(&json).unwrap()).unwrap();
        path
    }

    fn write_features(dir: &Path, name: &str, frames: usize) -> PathBuf {
        let path = dir.join(name);
        let data: Vec<f32> = (0..frames * FEAT_DIM).map(|i| i as f32 * 0.1).collect();
        let t = Tensor::from_vec(data, (frames, FEAT_DIM), &Device::Cpu).unwrap();
        let mut map = HashMap::new();
        map.insert(FEATURES_TENSOR.to_string(), t);
        candle_core::safetensors::save(&map, &path).unwrap();
        path
    }

    fn fixture() -> (tempfile::TempDir, DatasetSection, Tokenizer) {
        let dir = tempfile::tempdir().unwrap();
        let tok_path = write_tokenizer(dir.path());
        let f1 = write_features(dir.path(), "u1.safetensors", 6);
        let f2 = write_features(dir.path(), "u2.safetensors", 9);

        let manifest = dir.path().join("manifest.json");
        let mut f = std::fs::File::create(&manifest).unwrap();
        writeln!(
            f,
            r#"{{"feature_filepath": "{}", "text": "turn on lights"}}"#,
            f1.display()
        )
        .unwrap();
        writeln!(
            f,
            r#"{{"feature_filepath": "{}", "text": "turn off"}}"#,
            f2.display()
        )
        .unwrap();
        drop(f);

        let section = DatasetSection {
            manifest_filepath: manifest.display().to_string(),
            batch_size: 2,
            shuffle: false,
        };
        let tokenizer = Tokenizer::from_file(&tok_path).unwrap();
        (dir, section, tokenizer)
    }

    fn vocab() -> VocabSpec {
        VocabSpec {
            size: 8,
            pad_id: 0,
            bos_id: 2,
            eos_id: 3,
        }
    }

    #[test]
    fn test_load_dataset() {
        let (_dir, section, tokenizer) = fixture();
        let ds = SluDataset::load(&section, &tokenizer, FEAT_DIM).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.utterance(0).frames, 6);
        assert_eq!(ds.utterance(0).target, vec![4, 5, 7]);
        assert_eq!(ds.utterance(1).target, vec![4, 6]);
    }

    #[test]
    fn test_batch_padding_and_masks() {
        let (_dir, section, tokenizer) = fixture();
        let ds = SluDataset::load(&section, &tokenizer, FEAT_DIM).unwrap();
        let batch = ds.batch(&[0, 1], &vocab(), &Device::Cpu).unwrap();

        assert_eq!(batch.size, 2);
        assert_eq!(batch.features.dims(), &[2, 9, FEAT_DIM]);
        assert_eq!(batch.feat_lens, vec![6, 9]);
        // max target len 3, +1 for BOS/EOS
        assert_eq!(batch.targets_in.dims(), &[2, 4]);

        let tin = batch.targets_in.to_vec2::<u32>().unwrap();
        assert_eq!(tin[0], vec![2, 4, 5, 7]);
        assert_eq!(tin[1], vec![2, 4, 6, 0]);
        let tout = batch.targets_out.to_vec2::<u32>().unwrap();
        assert_eq!(tout[0], vec![4, 5, 7, 3]);
        assert_eq!(tout[1], vec![4, 6, 3, 0]);
        let mask = batch.target_mask.to_vec2::<f32>().unwrap();
        assert_eq!(mask[0], vec![1.0, 1.0, 1.0, 1.0]);
        assert_eq!(mask[1], vec![1.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_feature_dim_mismatch_rejected() {
        let (_dir, section, tokenizer) = fixture();
        let err = SluDataset::load(&section, &tokenizer, FEAT_DIM + 1).unwrap_err();
        assert!(matches!(err, SluError::CheckpointCorrupted { .. }));
    }
}
