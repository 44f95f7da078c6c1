//! Semantics decoder: token embedding, causal self-attention,
//! cross-attention over the encoded speech, and a vocabulary projection.

use candle_core::{Module, Tensor};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, VarBuilder};

use crate::config::ArchConfig;
use crate::error::SluResult;

use super::encoder::MultiHeadAttention;
use super::{causal_mask, sinusoidal_pe, VocabSpec};

/// Pre-norm decoder block: causal self-attention, cross-attention,
/// feed-forward.
#[derive(Debug)]
struct DecoderBlock {
    ln1: LayerNorm,
    self_attn: MultiHeadAttention,
    ln2: LayerNorm,
    cross_attn: MultiHeadAttention,
    ln3: LayerNorm,
    ff1: Linear,
    ff2: Linear,
}

impl DecoderBlock {
    fn new(d_model: usize, n_heads: usize, ff_dim: usize, vb: VarBuilder) -> SluResult<Self> {
        Ok(Self {
            ln1: layer_norm(d_model, 1e-5, vb.pp("ln1"))?,
            self_attn: MultiHeadAttention::new(d_model, n_heads, vb.pp("self_attn"))?,
            ln2: layer_norm(d_model, 1e-5, vb.pp("ln2"))?,
            cross_attn: MultiHeadAttention::new(d_model, n_heads, vb.pp("cross_attn"))?,
            ln3: layer_norm(d_model, 1e-5, vb.pp("ln3"))?,
            ff1: linear(d_model, ff_dim, vb.pp("ff1"))?,
            ff2: linear(ff_dim, d_model, vb.pp("ff2"))?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        enc_out: &Tensor,
        enc_mask: &Tensor,
        causal: &Tensor,
    ) -> SluResult<Tensor> {
        let a = self
            .self_attn
            .forward(&self.ln1.forward(x)?, None, Some(causal))?;
        let x = (x + &a)?;
        let c = self
            .cross_attn
            .forward(&self.ln2.forward(&x)?, Some(enc_out), Some(enc_mask))?;
        let x = (&x + &c)?;
        let h = self.ff1.forward(&self.ln3.forward(&x)?)?.gelu()?;
        let f = self.ff2.forward(&h)?;
        Ok((&x + &f)?)
    }
}

/// The semantics decoder module tree (`decoder.*` parameters).
#[derive(Debug)]
pub struct Decoder {
    embed: Embedding,
    blocks: Vec<DecoderBlock>,
    ln_out: LayerNorm,
    proj: Linear,
}

impl Decoder {
    pub fn new(arch: &ArchConfig, vocab: &VocabSpec, vb: VarBuilder) -> SluResult<Self> {
        let d_model = arch.encoder.d_model;
        let n_heads = arch.encoder.n_heads;
        let dec = &arch.decoder;
        let embed = embedding(vocab.size, d_model, vb.pp("embed"))?;
        let mut blocks = Vec::with_capacity(dec.n_layers);
        let vb_blocks = vb.pp("blocks");
        for i in 0..dec.n_layers {
            blocks.push(DecoderBlock::new(
                d_model,
                n_heads,
                dec.ff_dim,
                vb_blocks.pp(i.to_string()),
            )?);
        }
        Ok(Self {
            embed,
            blocks,
            ln_out: layer_norm(d_model, 1e-5, vb.pp("ln_out"))?,
            proj: linear(d_model, vocab.size, vb.pp("proj"))?,
        })
    }

    /// Decode `[b, len]` token ids against the encoded speech; returns
    /// `[b, len, vocab]` logits.
    pub fn forward(&self, tokens: &Tensor, enc_out: &Tensor, enc_mask: &Tensor) -> SluResult<Tensor> {
        let x = self.embed.forward(tokens)?;
        let (_, len, d) = x.dims3()?;
        let pe = sinusoidal_pe(len, d, x.device())?;
        let mut x = x.broadcast_add(&pe)?;
        let causal = causal_mask(len, x.device())?;
        for block in &self.blocks {
            x = block.forward(&x, enc_out, enc_mask, &causal)?;
        }
        let x = self.ln_out.forward(&x)?;
        Ok(self.proj.forward(&x)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DecoderConfig, EncoderConfig};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_decoder_logits_shape() {
        let arch = ArchConfig {
            feat_dim: 4,
            encoder: EncoderConfig {
                d_model: 16,
                n_heads: 2,
                n_layers: 1,
                ff_dim: 32,
            },
            decoder: DecoderConfig {
                n_layers: 2,
                ff_dim: 32,
                max_target_len: 8,
            },
        };
        let vocab = VocabSpec {
            size: 10,
            pad_id: 0,
            bos_id: 2,
            eos_id: 3,
        };
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let decoder = Decoder::new(&arch, &vocab, vb.pp("decoder")).unwrap();

        let enc_out = Tensor::zeros((2, 5, 16), DType::F32, &Device::Cpu).unwrap();
        let enc_mask = Tensor::zeros((2, 1, 1, 5), DType::F32, &Device::Cpu).unwrap();
        let tokens = Tensor::from_vec(vec![2u32, 4, 5, 2, 6, 7], (2, 3), &Device::Cpu).unwrap();
        let logits = decoder.forward(&tokens, &enc_out, &enc_mask).unwrap();
        assert_eq!(logits.dims(), &[2, 3, 10]);
    }

    #[test]
    fn test_causal_mask_upper_triangle() {
        let mask = causal_mask(3, &Device::Cpu).unwrap();
        let rows = mask.reshape((3, 3)).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(rows[0][0], 0.0);
        assert!(rows[0][1] < -1e30);
        assert!(rows[0][2] < -1e30);
        assert_eq!(rows[1][1], 0.0);
        assert!(rows[1][2] < -1e30);
        assert_eq!(rows[2][2], 0.0);
    }
}
