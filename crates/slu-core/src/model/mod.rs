//! The SLU model: a speech encoder plus a semantics decoder.
//!
//! All parameters live in a [`candle_nn::VarMap`] with names namespaced
//! `encoder.*` / `decoder.*`. The namespaces are what the weight merge
//! scopes ([`MergeScope`]) and the freeze policy operate on: freezing the
//! encoder removes `encoder.*` variables from the trainable set reported
//! to the optimizer, without touching the variables themselves.

pub mod decoder;
pub mod encoder;

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::ops::log_softmax;
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::config::{ArchConfig, DatasetSection, TokenizerSection};
use crate::data::{SluBatch, SluDataset};
use crate::error::{SluError, SluResult};
use crate::pretrained::merge::{self, MergeReport, MergeScope, TensorMap, ENCODER_PREFIX};

use decoder::Decoder;
use encoder::Encoder;

/// Vocabulary facts the model needs from the tokenizer: size and the
/// special-token ids. Stored in model archives so a restored model does
/// not require the tokenizer file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct VocabSpec {
    pub size: usize,
    pub pad_id: u32,
    pub bos_id: u32,
    pub eos_id: u32,
}

impl VocabSpec {
    /// Resolve the special-token ids from a loaded tokenizer.
    pub fn from_tokenizer(tokenizer: &Tokenizer, section: &TokenizerSection) -> SluResult<Self> {
        let id = |token: &str| {
            tokenizer.token_to_id(token).ok_or_else(|| {
                SluError::Tokenizer(format!("token `{}` missing from vocabulary", token))
            })
        };
        Ok(Self {
            size: tokenizer.get_vocab_size(true),
            pad_id: id(&section.pad_token)?,
            bos_id: id(&section.bos_token)?,
            eos_id: id(&section.eos_token)?,
        })
    }
}

/// Dataset context attached by the model factory so the model can build
/// its own test split on demand.
struct DataContext {
    tokenizer: Arc<Tokenizer>,
    test_ds: Option<DatasetSection>,
}

/// Encoder/decoder SLU model.
pub struct SluModel {
    arch: ArchConfig,
    vocab: VocabSpec,
    device: Device,
    varmap: VarMap,
    encoder: Encoder,
    decoder: Decoder,
    encoder_frozen: bool,
    data_ctx: Option<DataContext>,
    test_set: Option<SluDataset>,
}

impl SluModel {
    /// Construct a freshly initialized model on `device`.
    pub fn new(arch: &ArchConfig, vocab: VocabSpec, device: &Device) -> SluResult<Self> {
        if arch.encoder.d_model % arch.encoder.n_heads != 0 {
            return Err(SluError::Config(format!(
                "d_model ({}) not divisible by n_heads ({})",
                arch.encoder.d_model, arch.encoder.n_heads
            )));
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let encoder = Encoder::new(arch, vb.pp("encoder"))?;
        let decoder = Decoder::new(arch, &vocab, vb.pp("decoder"))?;
        Ok(Self {
            arch: arch.clone(),
            vocab,
            device: device.clone(),
            varmap,
            encoder,
            decoder,
            encoder_frozen: false,
            data_ctx: None,
            test_set: None,
        })
    }

    pub fn arch(&self) -> &ArchConfig {
        &self.arch
    }

    pub fn vocab(&self) -> &VocabSpec {
        &self.vocab
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Attach the tokenizer and test-split configuration so
    /// [`SluModel::prepare_test`] can materialize the test dataset.
    pub fn attach_data(&mut self, tokenizer: Arc<Tokenizer>, test_ds: Option<DatasetSection>) {
        self.data_ctx = Some(DataContext { tokenizer, test_ds });
    }

    /// Teacher-forced cross-entropy loss over valid target positions.
    pub fn forward_loss(&self, batch: &SluBatch) -> SluResult<Tensor> {
        let (enc_out, enc_mask) = self.encoder.forward(&batch.features, &batch.feat_lens)?;
        let logits = self.decoder.forward(&batch.targets_in, &enc_out, &enc_mask)?;
        let lp = log_softmax(&logits, D::Minus1)?;
        let picked = lp
            .gather(&batch.targets_out.unsqueeze(2)?, 2)?
            .squeeze(2)?;
        let nll = (picked.neg()? * &batch.target_mask)?;
        let denom = batch.target_mask.sum_all()?.to_scalar::<f32>()?;
        let loss = (nll.sum_all()? / denom as f64)?;
        Ok(loss)
    }

    /// Bounded-length argmax decoding of a single utterance.
    ///
    /// `feats` is `[1, frames, feat_dim]`; returns token ids without
    /// BOS/EOS.
    pub fn greedy_decode(&self, feats: &Tensor, frames: usize) -> SluResult<Vec<u32>> {
        use candle_core::IndexOp;

        let (enc_out, enc_mask) = self.encoder.forward(feats, &[frames])?;
        let mut tokens = vec![self.vocab.bos_id];
        let mut out = Vec::new();
        for _ in 0..self.arch.decoder.max_target_len {
            let input = Tensor::from_vec(tokens.clone(), (1, tokens.len()), &self.device)?;
            let logits = self.decoder.forward(&input, &enc_out, &enc_mask)?;
            let last = logits.i((0, tokens.len() - 1))?;
            let next = last.argmax(D::Minus1)?.to_scalar::<u32>()?;
            if next == self.vocab.eos_id {
                break;
            }
            out.push(next);
            tokens.push(next);
        }
        Ok(out)
    }

    /// Copy of every parameter, by name. The copies are detached from any
    /// later updates.
    pub fn state_snapshot(&self) -> SluResult<TensorMap> {
        let data = self.varmap.data().lock().expect("varmap lock poisoned");
        let mut snapshot = TensorMap::new();
        for (name, var) in data.iter() {
            snapshot.insert(name.clone(), var.as_tensor().copy()?);
        }
        Ok(snapshot)
    }

    /// Non-strict merge of `source` into this model's parameters.
    pub fn apply_weights(&self, source: &TensorMap, scope: MergeScope) -> SluResult<MergeReport> {
        let data = self.varmap.data().lock().expect("varmap lock poisoned");
        let targets: HashMap<String, Var> =
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        drop(data);
        merge::merge_into(&targets, source, scope)
    }

    /// Disable gradient updates for `encoder.*` parameters.
    pub fn freeze_encoder(&mut self) {
        self.encoder_frozen = true;
    }

    /// Re-enable gradient updates for `encoder.*` parameters.
    pub fn unfreeze_encoder(&mut self) {
        self.encoder_frozen = false;
    }

    pub fn encoder_frozen(&self) -> bool {
        self.encoder_frozen
    }

    /// The named variables the optimizer should update, honoring the
    /// freeze policy.
    pub fn trainable_vars(&self) -> Vec<(String, Var)> {
        let data = self.varmap.data().lock().expect("varmap lock poisoned");
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .filter(|(name, _)| !(self.encoder_frozen && name.starts_with(ENCODER_PREFIX)))
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }

    /// All parameter names, sorted.
    pub fn param_names(&self) -> Vec<String> {
        let data = self.varmap.data().lock().expect("varmap lock poisoned");
        let mut names: Vec<String> = data.keys().cloned().collect();
        names.sort();
        names
    }

    /// Try to materialize the test dataset. Returns `false` when no test
    /// split is configured, its manifest path is empty, or the split is
    /// empty; `true` once the dataset is ready for [`Trainer::test`].
    ///
    /// [`Trainer::test`]: crate::training::Trainer::test
    pub fn prepare_test(&mut self, _trainer: &crate::training::Trainer) -> SluResult<bool> {
        let Some(ctx) = &self.data_ctx else {
            return Ok(false);
        };
        let Some(section) = &ctx.test_ds else {
            return Ok(false);
        };
        if section.manifest_filepath.trim().is_empty() {
            return Ok(false);
        }
        let set = SluDataset::load(section, &ctx.tokenizer, self.arch.feat_dim)?;
        if set.is_empty() {
            return Ok(false);
        }
        self.test_set = Some(set);
        Ok(true)
    }

    /// Take the prepared test dataset, if any.
    pub fn take_test_set(&mut self) -> Option<SluDataset> {
        self.test_set.take()
    }
}

/// Sinusoidal positional encoding, `[len, dim]`.
pub(crate) fn sinusoidal_pe(len: usize, dim: usize, device: &Device) -> candle_core::Result<Tensor> {
    let mut data = vec![0f32; len * dim];
    for pos in 0..len {
        for i in 0..dim / 2 {
            let angle = pos as f32 / 10000f32.powf(2.0 * i as f32 / dim as f32);
            data[pos * dim + 2 * i] = angle.sin();
            data[pos * dim + 2 * i + 1] = angle.cos();
        }
    }
    Tensor::from_vec(data, (len, dim), device)
}

/// Additive key-padding mask, `[batch, 1, 1, max_len]`: 0 on valid key
/// positions, a large negative on padding.
pub(crate) fn key_padding_mask(
    lens: &[usize],
    max_len: usize,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let b = lens.len();
    let mut data = vec![0f32; b * max_len];
    for (row, &len) in lens.iter().enumerate() {
        for t in len..max_len {
            data[row * max_len + t] = f32::MIN / 2.0;
        }
    }
    Tensor::from_vec(data, (b, 1, 1, max_len), device)
}

/// Additive causal mask, `[1, 1, len, len]`.
pub(crate) fn causal_mask(len: usize, device: &Device) -> candle_core::Result<Tensor> {
    let mut data = vec![0f32; len * len];
    for i in 0..len {
        for j in (i + 1)..len {
            data[i * len + j] = f32::MIN / 2.0;
        }
    }
    Tensor::from_vec(data, (1, 1, len, len), device)
}
