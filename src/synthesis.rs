//! Greedy autoregressive mel synthesis.
//!
//! Starts from a single all-zero "go" frame and repeatedly runs the full
//! teacher-forced forward pass, appending the newest PostNet frame to the
//! decoder input until the stop token fires:
//!
//! ```text
//! mel_input = [go]
//! loop:
//!     out = model.forward(symbols, mel_input, causal mask)
//!     mel_input ← mel_input ‖ out.postnet_output[last step]
//!     stop when sigmoid(stop_preds[last]) > threshold and steps ≥ min_frames,
//!          or when steps = max_frames
//! ```

use std::time::Instant;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::model::{ForwardInputs, MaskSet, TransformerTts, positional, stop_probabilities};
use crate::{Error, Result};

/// Limits and stop criterion for one synthesis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Hard cap on decoder steps.
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,

    /// Steps that must run before the stop token is honoured.
    #[serde(default)]
    pub min_frames: usize,

    /// Stop probability above which decoding ends.
    #[serde(default = "default_stop_threshold")]
    pub stop_threshold: f32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_frames: default_max_frames(),
            min_frames: 0,
            stop_threshold: default_stop_threshold(),
        }
    }
}

fn default_max_frames() -> usize {
    800
}
fn default_stop_threshold() -> f32 {
    0.5
}

/// Result of a synthesis run (batch of one).
pub struct SynthesisOutput {
    /// PostNet-refined mel frames `[1, steps · r, n_mels]`.
    pub mel: Tensor,
    /// Coarse mel frames before the PostNet, same shape as `mel`.
    pub mel_coarse: Tensor,
    /// Cross-attention weights of the final pass, one per decoder layer.
    pub attn_probs: Vec<Tensor>,
    /// Decoder steps taken.
    pub steps: usize,
    /// Whether the stop token ended decoding (as opposed to `max_frames`).
    pub stopped: bool,
}

/// Synthesize mel frames for one symbol sequence.
///
/// `characters`: `[1, T_text]` or `[T_text]` symbol ids.
pub fn synthesize(
    model: &TransformerTts,
    characters: &Tensor,
    cfg: &SynthesisConfig,
) -> Result<SynthesisOutput> {
    let model_cfg = model.config();
    if cfg.max_frames == 0 || cfg.max_frames >= model_cfg.max_positions {
        return Err(Error::Config(format!(
            "max_frames must be in 1..{}, got {}",
            model_cfg.max_positions, cfg.max_frames
        )));
    }
    let characters = match characters.rank() {
        1 => characters.unsqueeze(0)?,
        _ => characters.clone(),
    };
    let (batch, t_text) = characters.dims2()?;
    if batch != 1 {
        return Err(Error::shape("synthesis batch", &[1, t_text], characters.dims()));
    }

    let device = characters.device();
    let frame_dim = model_cfg.frame_dim();
    let pos_text = positional::text_positions(&characters)?;
    let mut mel_input = Tensor::zeros((1, 1, frame_dim), model.dtype(), device)?;

    tracing::info!(
        symbols = t_text,
        max_frames = cfg.max_frames,
        "Starting greedy synthesis"
    );
    let start = Instant::now();

    loop {
        let steps = mel_input.dim(1)?;
        let inputs = ForwardInputs {
            characters: characters.clone(),
            mel_input: mel_input.clone(),
            pos_text: pos_text.clone(),
            pos_mel: positional::frame_positions(1, steps, device)?,
            masks: MaskSet::causal(1, steps, device)?,
            train: false,
        };
        let out = model.forward(&inputs)?;

        let stop = stop_probabilities(&out.stop_preds)?
            .narrow(1, steps - 1, 1)?
            .to_dtype(DType::F32)?
            .reshape(())?
            .to_scalar::<f32>()?;
        tracing::debug!(step = steps, stop_probability = stop, "Decoder step");

        let stopped = steps >= cfg.min_frames && stop > cfg.stop_threshold;
        if stopped || steps >= cfg.max_frames {
            tracing::info!(
                steps,
                stopped,
                elapsed_s = start.elapsed().as_secs_f64(),
                "Synthesis finished"
            );
            let attn_probs = out.attn_probs().to_vec();
            return Ok(SynthesisOutput {
                mel: out.postnet_output,
                mel_coarse: out.mel_output,
                attn_probs,
                steps,
                stopped,
            });
        }

        // Regroup [1, steps·r, n_mels] into decoder frames and feed the newest back.
        let last = out
            .postnet_output
            .reshape((1, steps, frame_dim))?
            .narrow(1, steps - 1, 1)?;
        mel_input = Tensor::cat(&[&mel_input, &last], 1)?;
    }
}
