//! The TransformerTTS acoustic model.
//!
//! ## Components
//!
//! - [`encoder`]: symbol embedding, conv prenet and self-attention stack
//! - [`decoder`]: mel prenet, causal self-attention and cross-attention stack
//! - [`heads`]: mel projection, [`postnet`] refinement and stop-token logits
//! - [`attention`]: multi-head scaled dot-product attention
//! - [`mask`]: boolean mask builders and the six mask roles
//! - [`positional`]: sinusoidal positional table with learnable scale

pub mod attention;
pub mod decoder;
pub mod encoder;
pub mod feed_forward;
pub mod heads;
pub mod mask;
pub mod positional;
pub mod postnet;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::config::TransformerTtsConfig;
use crate::{Error, Result};
use decoder::{Decoder, DecoderMasks};
use encoder::Encoder;
pub use heads::stop_probabilities;
pub use mask::MaskSet;

/// Inputs for one teacher-forced forward pass.
#[derive(Debug, Clone)]
pub struct ForwardInputs {
    /// Symbol ids `[B, T_text]`, 0 = padding.
    pub characters: Tensor,
    /// Shifted mel frames `[B, T_mel, outputs_per_step · n_mels]`.
    pub mel_input: Tensor,
    /// Text position ids `[B, T_text]`, 0 = padding.
    pub pos_text: Tensor,
    /// Mel position ids `[B, T_mel]`, 0 = padding.
    pub pos_mel: Tensor,
    pub masks: MaskSet,
    /// Enable dropout and batch statistics.
    pub train: bool,
}

/// Everything one forward pass produces.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Coarse mel prediction `[B, T_mel · r, n_mels]`.
    pub mel_output: Tensor,
    /// `mel_output` plus the PostNet residual, same shape.
    pub postnet_output: Tensor,
    /// Pre-sigmoid stop logits `[B, T_mel, 1]`.
    pub stop_preds: Tensor,
    attn_probs: Vec<Tensor>,
    attns_enc: Vec<Tensor>,
    attns_dec: Vec<Tensor>,
}

impl ForwardOutput {
    /// Cross-attention weights per decoder layer, `[B, H, T_mel, T_text]`.
    pub fn attn_probs(&self) -> &[Tensor] {
        &self.attn_probs
    }

    /// Self-attention weights per encoder layer, `[B, H, T_text, T_text]`.
    pub fn attns_enc(&self) -> &[Tensor] {
        &self.attns_enc
    }

    /// Self-attention weights per decoder layer, `[B, H, T_mel, T_mel]`.
    pub fn attns_dec(&self) -> &[Tensor] {
        &self.attns_dec
    }
}

pub struct TransformerTts {
    encoder: Encoder,
    decoder: Decoder,
    config: TransformerTtsConfig,
    dtype: DType,
}

impl TransformerTts {
    /// Build the model from a `VarBuilder` (a `VarMap` for fresh parameters,
    /// or safetensors for trained ones).
    pub fn new(config: &TransformerTtsConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let encoder = Encoder::load(vb.pp("encoder"), config)?;
        let decoder = Decoder::load(vb.pp("decoder"), config)?;
        tracing::debug!(
            num_hidden = config.num_hidden,
            encoder_layers = config.encoder_n_layers,
            decoder_layers = config.decoder_n_layers,
            n_mels = config.n_mels,
            "TransformerTts constructed"
        );
        Ok(Self {
            encoder,
            decoder,
            config: config.clone(),
            dtype: vb.dtype(),
        })
    }

    /// Load trained parameters from a safetensors file.
    pub fn load(
        weights_path: &std::path::Path,
        config: &TransformerTtsConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        tracing::info!("Loading TransformerTts weights from {:?}", weights_path);
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, device)
                .map_err(|e| Error::WeightLoad(format!("{}: {e}", weights_path.display())))?
        };
        Self::new(config, vb)
    }

    pub fn config(&self) -> &TransformerTtsConfig {
        &self.config
    }

    /// Floating-point dtype of the parameters.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Teacher-forced forward pass: symbols and shifted mel frames to mel
    /// predictions, stop logits and per-layer attention weights.
    pub fn forward(&self, inputs: &ForwardInputs) -> Result<ForwardOutput> {
        let (batch, t_text) = inputs.characters.dims2()?;
        let (mel_batch, t_mel, _) = inputs.mel_input.dims3()?;
        if mel_batch != batch {
            return Err(Error::shape("mel_input batch", &[batch], &[mel_batch]));
        }
        let masks = &inputs.masks;
        masks.validate(batch, t_text, t_mel)?;

        let (memory, attns_enc) = self.encoder.forward(
            &inputs.characters,
            &inputs.pos_text,
            masks.enc_slf_mask.as_ref(),
            masks.enc_query_mask.as_ref(),
            inputs.train,
        )?;

        let decoder_masks = DecoderMasks {
            slf_mask: Some(&masks.dec_slf_mask),
            query_slf_mask: masks.dec_query_slf_mask.as_ref(),
            enc_dec_mask: masks.enc_dec_mask.as_ref(),
            query_mask: masks.dec_query_mask.as_ref(),
        };
        let decoded = self.decoder.forward(
            &memory,
            &inputs.mel_input,
            &inputs.pos_mel,
            decoder_masks,
            inputs.train,
        )?;

        Ok(ForwardOutput {
            mel_output: decoded.heads.mel_output,
            postnet_output: decoded.heads.postnet_output,
            stop_preds: decoded.heads.stop_preds,
            attn_probs: decoded.attn_probs,
            attns_enc,
            attns_dec: decoded.attns_dec,
        })
    }
}
