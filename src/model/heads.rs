//! Output heads on top of the final decoder state.
//!
//! ```text
//! hidden [B, T, H] ─┬─► mel_linear ─► mel [B, T, r·C] ─┬──────────────► mel_output
//!                   │                                   └─► + PostNet ─► postnet_output
//!                   └─► stop_linear ─► stop logits [B, T, 1]
//! ```
//!
//! With `r = outputs_per_step > 1` both mel outputs are unfolded to
//! `[B, T·r, C]`; the stop logits stay one per decoder step.

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::postnet::PostNet;
use crate::Result;
use crate::config::TransformerTtsConfig;

pub struct OutputHeads {
    mel_linear: candle_nn::Linear,
    postnet: PostNet,
    stop_linear: candle_nn::Linear,
    n_mels: usize,
    outputs_per_step: usize,
}

/// Mel predictions and stop logits for one forward pass.
pub struct HeadOutputs {
    pub mel_output: Tensor,
    pub postnet_output: Tensor,
    pub stop_preds: Tensor,
}

impl OutputHeads {
    pub fn load(vb: VarBuilder, config: &TransformerTtsConfig) -> Result<Self> {
        let frame_dim = config.frame_dim();
        let mel_linear = candle_nn::linear(config.num_hidden, frame_dim, vb.pp("mel_linear"))?;
        let postnet = PostNet::load(
            vb.pp("postnet"),
            frame_dim,
            config.num_hidden,
            config.postnet_num_conv,
            config.postnet_kernel_size,
            config.dropout,
        )?;
        let stop_linear = candle_nn::linear(config.num_hidden, 1, vb.pp("stop_linear"))?;
        Ok(Self {
            mel_linear,
            postnet,
            stop_linear,
            n_mels: config.n_mels,
            outputs_per_step: config.outputs_per_step,
        })
    }

    /// `hidden`: `[B, T, H]`.
    pub fn forward(&self, hidden: &Tensor, train: bool) -> Result<HeadOutputs> {
        let (batch, len, _) = hidden.dims3()?;
        let mel = self.mel_linear.forward(hidden)?;
        let postnet_output = (&mel + self.postnet.forward(&mel, train)?)?;
        let stop_preds = self.stop_linear.forward(hidden)?;

        let frames = len * self.outputs_per_step;
        Ok(HeadOutputs {
            mel_output: mel.reshape((batch, frames, self.n_mels))?,
            postnet_output: postnet_output.reshape((batch, frames, self.n_mels))?,
            stop_preds,
        })
    }
}

/// Sigmoid of stop logits: probability that each step is the last.
pub fn stop_probabilities(stop_preds: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::ops::sigmoid(stop_preds)?)
}
