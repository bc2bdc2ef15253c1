//! Autoregressive mel decoder.
//!
//! ```text
//! mel_input [B, T, C] ─► Prenet (2 × Linear+ReLU+dropout) ─► Linear
//!                                                             │
//!                                  + alpha · PE(pos_mel) ◄────┘
//!                                             │ dropout
//!            N × ┌────────────────────────────▼───────────────────────────┐
//!                │ causal self-attention (dec_slf_mask, dec_query_slf_mask)│
//!                │ cross-attention on memory (enc_dec_mask, dec_query_mask)│
//!                │ feed-forward                                            │
//!                └────────────────────────────┬───────────────────────────┘
//!                                             ▼
//!                                      OutputHeads
//! ```

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::attention::MultiHeadAttention;
use super::feed_forward::FeedForward;
use super::heads::{HeadOutputs, OutputHeads};
use super::positional::PositionalEncoding;
use crate::config::TransformerTtsConfig;
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Prenet
// ---------------------------------------------------------------------------

/// Bottleneck MLP applied to each input mel frame.
pub struct DecoderPrenet {
    layer_1: candle_nn::Linear,
    layer_2: candle_nn::Linear,
    projection: candle_nn::Linear,
    dropout: f32,
}

impl DecoderPrenet {
    pub fn load(vb: VarBuilder, in_dim: usize, hidden: usize, dropout: f32) -> Result<Self> {
        let layer_1 = candle_nn::linear(in_dim, hidden * 2, vb.pp("layer_1"))?;
        let layer_2 = candle_nn::linear(hidden * 2, hidden, vb.pp("layer_2"))?;
        let projection = candle_nn::linear(hidden, hidden, vb.pp("projection"))?;
        Ok(Self {
            layer_1,
            layer_2,
            projection,
            dropout,
        })
    }

    /// `x`: `[B, T, in_dim]` → `[B, T, hidden]`.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.dropout(&self.layer_1.forward(x)?.relu()?, train)?;
        let x = self.dropout(&self.layer_2.forward(&x)?.relu()?, train)?;
        Ok(self.projection.forward(&x)?)
    }

    fn dropout(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        if train && self.dropout > 0.0 {
            Ok(candle_nn::ops::dropout(x, self.dropout)?)
        } else {
            Ok(x.clone())
        }
    }
}

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

/// Masks consumed by every decoder layer.
#[derive(Clone, Copy, Default)]
pub struct DecoderMasks<'a> {
    pub slf_mask: Option<&'a Tensor>,
    pub query_slf_mask: Option<&'a Tensor>,
    pub enc_dec_mask: Option<&'a Tensor>,
    pub query_mask: Option<&'a Tensor>,
}

pub struct DecoderLayer {
    self_attn: MultiHeadAttention,
    cross_attn: MultiHeadAttention,
    ffn: FeedForward,
}

impl DecoderLayer {
    pub fn load(vb: VarBuilder, config: &TransformerTtsConfig) -> Result<Self> {
        let attn = |name: &str| {
            MultiHeadAttention::load(
                vb.pp(name),
                config.num_hidden,
                config.decoder_num_head,
                config.concat_query,
                config.layer_norm_eps,
                config.dropout,
            )
        };
        let self_attn = attn("self_attn")?;
        let cross_attn = attn("cross_attn")?;
        let ffn = FeedForward::load(
            vb.pp("ffn"),
            config.num_hidden,
            config.decoder_ffn_dim(),
            config.layer_norm_eps,
            config.dropout,
        )?;
        Ok(Self {
            self_attn,
            cross_attn,
            ffn,
        })
    }

    /// Returns `(state, self-attention weights, cross-attention weights)`.
    pub fn forward(
        &self,
        x: &Tensor,
        memory: &Tensor,
        masks: DecoderMasks<'_>,
        train: bool,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let (x, slf_weights) =
            self.self_attn
                .forward(x, x, x, masks.slf_mask, masks.query_slf_mask, train)?;
        let (x, cross_weights) = self.cross_attn.forward(
            &x,
            memory,
            memory,
            masks.enc_dec_mask,
            masks.query_mask,
            train,
        )?;
        let x = self.ffn.forward(&x, train)?;
        Ok((x, slf_weights, cross_weights))
    }
}

/// Decoder outputs for one forward pass.
pub struct DecoderOutput {
    pub heads: HeadOutputs,
    /// Cross-attention weights per layer, `[B, H, T_mel, T_text]`.
    pub attn_probs: Vec<Tensor>,
    /// Self-attention weights per layer, `[B, H, T_mel, T_mel]`.
    pub attns_dec: Vec<Tensor>,
}

pub struct Decoder {
    prenet: DecoderPrenet,
    positional: PositionalEncoding,
    layers: Vec<DecoderLayer>,
    heads: OutputHeads,
    frame_dim: usize,
    dropout: f32,
}

impl Decoder {
    pub fn load(vb: VarBuilder, config: &TransformerTtsConfig) -> Result<Self> {
        let frame_dim = config.frame_dim();
        let prenet = DecoderPrenet::load(
            vb.pp("prenet"),
            frame_dim,
            config.num_hidden,
            config.prenet_dropout,
        )?;
        let positional =
            PositionalEncoding::new(config.max_positions, config.num_hidden, vb.pp("positional"))?;
        let layers = (0..config.decoder_n_layers)
            .map(|i| DecoderLayer::load(vb.pp(format!("layers.{i}")), config))
            .collect::<Result<Vec<_>>>()?;
        let heads = OutputHeads::load(vb.pp("heads"), config)?;
        Ok(Self {
            prenet,
            positional,
            layers,
            heads,
            frame_dim,
            dropout: config.dropout,
        })
    }

    /// Decode teacher-forced mel frames against the encoder memory.
    ///
    /// - `memory`: `[B, T_text, H]`
    /// - `mel_input`: `[B, T_mel, r·n_mels]`
    /// - `pos_mel`: `[B, T_mel]`
    pub fn forward(
        &self,
        memory: &Tensor,
        mel_input: &Tensor,
        pos_mel: &Tensor,
        masks: DecoderMasks<'_>,
        train: bool,
    ) -> Result<DecoderOutput> {
        let (batch, t_mel, channels) = mel_input.dims3()?;
        if channels != self.frame_dim {
            return Err(Error::shape(
                "mel_input",
                &[batch, t_mel, self.frame_dim],
                mel_input.dims(),
            ));
        }
        if pos_mel.dims() != [batch, t_mel] {
            return Err(Error::shape("pos_mel", &[batch, t_mel], pos_mel.dims()));
        }

        let x = self.prenet.forward(mel_input, train)?;
        let mut x = (x + self.positional.forward(pos_mel)?)?;
        if train && self.dropout > 0.0 {
            x = candle_nn::ops::dropout(&x, self.dropout)?;
        }

        let mut attn_probs = Vec::with_capacity(self.layers.len());
        let mut attns_dec = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (next, slf_weights, cross_weights) = layer.forward(&x, memory, masks, train)?;
            x = next;
            attns_dec.push(slf_weights);
            attn_probs.push(cross_weights);
        }

        let heads = self.heads.forward(&x, train)?;
        Ok(DecoderOutput {
            heads,
            attn_probs,
            attns_dec,
        })
    }
}
