//! Speech encoder: conv subsampling followed by self-attention blocks.
//!
//! Input is `[batch, frames, feat_dim]` filterbank features; output is
//! `[batch, frames', d_model]` with frames halved by a stride-2
//! convolution, plus the additive key-padding mask derived from the
//! subsampled lengths.

use candle_core::{Module, Tensor};
use candle_nn::{conv1d, layer_norm, linear, Conv1d, Conv1dConfig, LayerNorm, Linear, VarBuilder};

use crate::config::ArchConfig;
use crate::error::SluResult;

use super::{key_padding_mask, sinusoidal_pe};

/// Multi-head scaled dot-product attention shared by encoder and decoder.
#[derive(Debug)]
pub struct MultiHeadAttention {
    q: Linear,
    k: Linear,
    v: Linear,
    o: Linear,
    n_heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    pub fn new(d_model: usize, n_heads: usize, vb: VarBuilder) -> SluResult<Self> {
        Ok(Self {
            q: linear(d_model, d_model, vb.pp("q"))?,
            k: linear(d_model, d_model, vb.pp("k"))?,
            v: linear(d_model, d_model, vb.pp("v"))?,
            o: linear(d_model, d_model, vb.pp("o"))?,
            n_heads,
            head_dim: d_model / n_heads,
        })
    }

    /// Attend from `x` over `kv` (self-attention when `kv` is `None`).
    /// `mask` is additive, broadcastable to `[b, heads, t_q, t_k]`.
    pub fn forward(
        &self,
        x: &Tensor,
        kv: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> SluResult<Tensor> {
        let (b, t_q, d) = x.dims3()?;
        let kv_x = kv.unwrap_or(x);
        let (_, t_k, _) = kv_x.dims3()?;

        let q = self
            .q
            .forward(x)?
            .reshape((b, t_q, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k
            .forward(kv_x)?
            .reshape((b, t_k, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v
            .forward(kv_x)?
            .reshape((b, t_k, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        if let Some(mask) = mask {
            scores = scores.broadcast_add(mask)?;
        }
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let ctx = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t_q, d))?;
        Ok(self.o.forward(&ctx)?)
    }
}

/// Pre-norm encoder block: self-attention plus feed-forward.
#[derive(Debug)]
struct EncoderBlock {
    ln1: LayerNorm,
    attn: MultiHeadAttention,
    ln2: LayerNorm,
    ff1: Linear,
    ff2: Linear,
}

impl EncoderBlock {
    fn new(d_model: usize, n_heads: usize, ff_dim: usize, vb: VarBuilder) -> SluResult<Self> {
        Ok(Self {
            ln1: layer_norm(d_model, 1e-5, vb.pp("ln1"))?,
            attn: MultiHeadAttention::new(d_model, n_heads, vb.pp("attn"))?,
            ln2: layer_norm(d_model, 1e-5, vb.pp("ln2"))?,
            ff1: linear(d_model, ff_dim, vb.pp("ff1"))?,
            ff2: linear(ff_dim, d_model, vb.pp("ff2"))?,
        })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor) -> SluResult<Tensor> {
        let a = self.attn.forward(&self.ln1.forward(x)?, None, Some(mask))?;
        let x = (x + &a)?;
        let h = self.ff1.forward(&self.ln2.forward(&x)?)?.gelu()?;
        let f = self.ff2.forward(&h)?;
        Ok((&x + &f)?)
    }
}

/// The speech encoder module tree (`encoder.*` parameters).
#[derive(Debug)]
pub struct Encoder {
    subsample: Conv1d,
    blocks: Vec<EncoderBlock>,
    ln_out: LayerNorm,
}

/// Frame count after the stride-2 subsampling convolution.
pub fn subsampled_len(frames: usize) -> usize {
    if frames == 0 {
        0
    } else {
        (frames - 1) / 2 + 1
    }
}

impl Encoder {
    pub fn new(arch: &ArchConfig, vb: VarBuilder) -> SluResult<Self> {
        let enc = &arch.encoder;
        let conv_cfg = Conv1dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let subsample = conv1d(arch.feat_dim, enc.d_model, 3, conv_cfg, vb.pp("subsample"))?;
        let mut blocks = Vec::with_capacity(enc.n_layers);
        let vb_blocks = vb.pp("blocks");
        for i in 0..enc.n_layers {
            blocks.push(EncoderBlock::new(
                enc.d_model,
                enc.n_heads,
                enc.ff_dim,
                vb_blocks.pp(i.to_string()),
            )?);
        }
        Ok(Self {
            subsample,
            blocks,
            ln_out: layer_norm(enc.d_model, 1e-5, vb.pp("ln_out"))?,
        })
    }

    /// Encode `[b, frames, feat_dim]` features with valid lengths `lens`.
    /// Returns the encoded sequence and its key-padding mask.
    pub fn forward(&self, feats: &Tensor, lens: &[usize]) -> SluResult<(Tensor, Tensor)> {
        let x = feats.transpose(1, 2)?.contiguous()?; // [b, feat, t]
        let x = self.subsample.forward(&x)?;
        let x = x.transpose(1, 2)?.contiguous()?; // [b, t', d]
        let (_, t, d) = x.dims3()?;

        let pe = sinusoidal_pe(t, d, x.device())?;
        let mut x = x.broadcast_add(&pe)?;

        let out_lens: Vec<usize> = lens.iter().map(|&l| subsampled_len(l)).collect();
        let mask = key_padding_mask(&out_lens, t, x.device())?;

        for block in &self.blocks {
            x = block.forward(&x, &mask)?;
        }
        let x = self.ln_out.forward(&x)?;
        Ok((x, mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DecoderConfig, EncoderConfig};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn arch() -> ArchConfig {
        ArchConfig {
            feat_dim: 4,
            encoder: EncoderConfig {
                d_model: 16,
                n_heads: 2,
                n_layers: 2,
                ff_dim: 32,
            },
            decoder: DecoderConfig {
                n_layers: 1,
                ff_dim: 32,
                max_target_len: 8,
            },
        }
    }

    #[test]
    fn test_subsampled_len() {
        assert_eq!(subsampled_len(0), 0);
        assert_eq!(subsampled_len(1), 1);
        assert_eq!(subsampled_len(2), 1);
        assert_eq!(subsampled_len(9), 5);
        assert_eq!(subsampled_len(10), 5);
    }

    #[test]
    fn test_encoder_output_shape() {
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = Encoder::new(&arch(), vb.pp("encoder")).unwrap();
        let feats = Tensor::zeros((2, 10, 4), DType::F32, &Device::Cpu).unwrap();
        let (out, mask) = encoder.forward(&feats, &[10, 7]).unwrap();
        assert_eq!(out.dims(), &[2, 5, 16]);
        assert_eq!(mask.dims(), &[2, 1, 1, 5]);
    }

    #[test]
    fn test_padding_mask_blocks_invalid_keys() {
        let mask = key_padding_mask(&[2, 4], 4, &Device::Cpu).unwrap();
        let rows = mask
            .reshape((2, 4))
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(rows[0][0], 0.0);
        assert_eq!(rows[0][1], 0.0);
        assert!(rows[0][2] < -1e30);
        assert!(rows[0][3] < -1e30);
        assert!(rows[1].iter().all(|&v| v == 0.0));
    }
}
