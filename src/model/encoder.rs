//! Text encoder: symbol ids → memory for cross-attention.
//!
//! ```text
//! ids [B, T] ─► Embedding ─► 3 × (Conv1d k5 → BatchNorm → ReLU → dropout) ─► Linear
//!                                                                              │
//!                                        + alpha · PE(pos_text) ◄──────────────┘
//!                                                   │ dropout
//!                                  N × (self-attention → feed-forward)
//!                                                   ▼
//!                                        memory [B, T, num_hidden]
//! ```

use candle_core::{DType, Module, Tensor};
use candle_nn::VarBuilder;

use super::attention::MultiHeadAttention;
use super::feed_forward::FeedForward;
use super::positional::PositionalEncoding;
use crate::config::TransformerTtsConfig;
use crate::{Error, Result};

const PRENET_CONV_LAYERS: usize = 3;
const PRENET_KERNEL_SIZE: usize = 5;
const BATCH_NORM_EPS: f64 = 1e-5;

// ---------------------------------------------------------------------------
// Prenet
// ---------------------------------------------------------------------------

struct ConvBlock {
    conv: candle_nn::Conv1d,
    norm: candle_nn::BatchNorm,
}

/// Symbol embedding followed by a convolutional stack.
pub struct EncoderPrenet {
    embedding: candle_nn::Embedding,
    convs: Vec<ConvBlock>,
    projection: candle_nn::Linear,
    dropout: f32,
}

impl EncoderPrenet {
    pub fn load(vb: VarBuilder, config: &TransformerTtsConfig) -> Result<Self> {
        let hidden = config.num_hidden;
        let embedding =
            candle_nn::embedding(config.vocab_size, config.embedding_size, vb.pp("embedding"))?;
        let conv_cfg = candle_nn::Conv1dConfig {
            padding: PRENET_KERNEL_SIZE / 2,
            ..Default::default()
        };
        let mut convs = Vec::with_capacity(PRENET_CONV_LAYERS);
        for i in 0..PRENET_CONV_LAYERS {
            let in_channels = if i == 0 { config.embedding_size } else { hidden };
            let conv = candle_nn::conv1d(
                in_channels,
                hidden,
                PRENET_KERNEL_SIZE,
                conv_cfg,
                vb.pp(format!("convs.{i}")),
            )?;
            let norm = candle_nn::batch_norm(hidden, BATCH_NORM_EPS, vb.pp(format!("norms.{i}")))?;
            convs.push(ConvBlock { conv, norm });
        }
        let projection = candle_nn::linear(hidden, hidden, vb.pp("projection"))?;
        Ok(Self {
            embedding,
            convs,
            projection,
            dropout: config.prenet_dropout,
        })
    }

    /// `ids`: `[B, T]` → `[B, T, num_hidden]`.
    ///
    /// Steps holding the padding symbol 0, or masked out by `query_mask`
    /// (`[B, T, 1]`), are zeroed before every convolution so the kernels
    /// never read past a sequence's length.
    pub fn forward(
        &self,
        ids: &Tensor,
        query_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let ids = ids.to_dtype(DType::U32)?;
        let x = self.embedding.forward(&ids)?;

        // keep: [B, 1, T], 1 at real steps
        let mut keep = ids.ne(&ids.zeros_like()?)?.to_dtype(x.dtype())?.unsqueeze(1)?;
        if let Some(m) = query_mask {
            let m = m.ne(&m.zeros_like()?)?.to_dtype(x.dtype())?.transpose(1, 2)?;
            keep = keep.broadcast_mul(&m)?;
        }

        // [B, T, E] → [B, E, T]
        let mut x = x.transpose(1, 2)?.broadcast_mul(&keep)?;
        for block in &self.convs {
            x = block.conv.forward(&x)?;
            x = x.apply_t(&block.norm, train)?.relu()?;
            if train && self.dropout > 0.0 {
                x = candle_nn::ops::dropout(&x, self.dropout)?;
            }
            x = x.broadcast_mul(&keep)?;
        }
        let x = x.transpose(1, 2)?;
        Ok(self.projection.forward(&x)?)
    }
}

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

pub struct EncoderLayer {
    self_attn: MultiHeadAttention,
    ffn: FeedForward,
}

impl EncoderLayer {
    pub fn load(vb: VarBuilder, config: &TransformerTtsConfig) -> Result<Self> {
        let self_attn = MultiHeadAttention::load(
            vb.pp("self_attn"),
            config.num_hidden,
            config.encoder_num_head,
            config.concat_query,
            config.layer_norm_eps,
            config.dropout,
        )?;
        let ffn = FeedForward::load(
            vb.pp("ffn"),
            config.num_hidden,
            config.encoder_ffn_dim(),
            config.layer_norm_eps,
            config.dropout,
        )?;
        Ok(Self { self_attn, ffn })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        slf_mask: Option<&Tensor>,
        query_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (x, weights) = self.self_attn.forward(x, x, x, slf_mask, query_mask, train)?;
        let x = self.ffn.forward(&x, train)?;
        Ok((x, weights))
    }
}

pub struct Encoder {
    prenet: EncoderPrenet,
    positional: PositionalEncoding,
    layers: Vec<EncoderLayer>,
    dropout: f32,
}

impl Encoder {
    pub fn load(vb: VarBuilder, config: &TransformerTtsConfig) -> Result<Self> {
        let prenet = EncoderPrenet::load(vb.pp("prenet"), config)?;
        let positional =
            PositionalEncoding::new(config.max_positions, config.num_hidden, vb.pp("positional"))?;
        let layers = (0..config.encoder_n_layers)
            .map(|i| EncoderLayer::load(vb.pp(format!("layers.{i}")), config))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            prenet,
            positional,
            layers,
            dropout: config.dropout,
        })
    }

    /// Encode a batch of symbol sequences.
    ///
    /// - `characters`, `pos_text`: `[B, T_text]`
    /// - `slf_mask`: `[B, T_text, T_text]`
    /// - `query_mask`: `[B, T_text, 1]`
    ///
    /// Returns the memory `[B, T_text, num_hidden]` and one self-attention
    /// weight tensor per layer.
    pub fn forward(
        &self,
        characters: &Tensor,
        pos_text: &Tensor,
        slf_mask: Option<&Tensor>,
        query_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        if characters.dims() != pos_text.dims() {
            return Err(Error::shape("pos_text", characters.dims(), pos_text.dims()));
        }
        let x = self.prenet.forward(characters, query_mask, train)?;
        let mut x = (x + self.positional.forward(pos_text)?)?;
        if train && self.dropout > 0.0 {
            x = candle_nn::ops::dropout(&x, self.dropout)?;
        }

        let mut attns = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (next, weights) = layer.forward(&x, slf_mask, query_mask, train)?;
            x = next;
            attns.push(weights);
        }
        Ok((x, attns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn small_config() -> TransformerTtsConfig {
        TransformerTtsConfig {
            vocab_size: 20,
            embedding_size: 12,
            num_hidden: 16,
            encoder_num_head: 2,
            encoder_n_layers: 2,
            max_positions: 32,
            ..Default::default()
        }
    }

    #[test]
    fn prenet_output_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let prenet = EncoderPrenet::load(vb, &small_config()).unwrap();
        let ids = Tensor::new(&[[3u32, 4, 5, 0], [1, 2, 0, 0]], &Device::Cpu).unwrap();
        let out = prenet.forward(&ids, None, false).unwrap();
        assert_eq!(out.dims(), &[2, 4, 16]);
    }

    #[test]
    fn prenet_ignores_symbols_past_length() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let prenet = EncoderPrenet::load(vb, &small_config()).unwrap();
        let qmask = crate::model::mask::query_mask(&[3], 5, &Device::Cpu).unwrap();
        let a = Tensor::new(&[[3u32, 4, 5, 0, 0]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[3u32, 4, 5, 17, 11]], &Device::Cpu).unwrap();
        let out_a = prenet.forward(&a, Some(&qmask), false).unwrap();
        let out_b = prenet.forward(&b, Some(&qmask), false).unwrap();
        let diff = (out_a.narrow(1, 0, 3).unwrap() - out_b.narrow(1, 0, 3).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn padding_symbol_embeds_to_zero() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let prenet = EncoderPrenet::load(vb, &small_config()).unwrap();
        // Trailing zeros need no mask to stay out of the real steps.
        let a = Tensor::new(&[[3u32, 4, 0, 0]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[3u32, 4]], &Device::Cpu).unwrap();
        let out_a = prenet.forward(&a, None, false).unwrap().narrow(1, 0, 2).unwrap();
        let out_b = prenet.forward(&b, None, false).unwrap();
        let diff = (out_a - out_b).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
    }

    #[test]
    fn encoder_returns_one_attention_per_layer() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = Encoder::load(vb, &small_config()).unwrap();
        let ids = Tensor::new(&[[3u32, 4, 5], [1, 2, 0]], &Device::Cpu).unwrap();
        let pos = Tensor::new(&[[1u32, 2, 3], [1, 2, 0]], &Device::Cpu).unwrap();
        let (memory, attns) = encoder.forward(&ids, &pos, None, None, false).unwrap();
        assert_eq!(memory.dims(), &[2, 3, 16]);
        assert_eq!(attns.len(), 2);
        assert_eq!(attns[0].dims(), &[2, 2, 3, 3]);
    }

    #[test]
    fn mismatched_positions_rejected() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let encoder = Encoder::load(vb, &small_config()).unwrap();
        let ids = Tensor::new(&[[3u32, 4, 5]], &Device::Cpu).unwrap();
        let pos = Tensor::new(&[[1u32, 2]], &Device::Cpu).unwrap();
        let err = encoder.forward(&ids, &pos, None, None, false).err().unwrap();
        assert!(matches!(err, Error::ShapeMismatch { context: "pos_text", .. }));
    }
}
