//! TransformerTTS acoustic model in pure Rust.
//!
//! A candle-based implementation of the TransformerTTS sequence-to-sequence
//! model: symbol ids in, mel-spectrogram frames and stop-token logits out.
//! Waveform synthesis is left to an external vocoder.
//!
//! ## Architecture
//!
//! ```text
//! symbols ─► EncoderPrenet ─► + α·PE ─► N × [self-attn → FFN] ─► memory
//!                                                                  │
//! mel (shifted) ─► DecoderPrenet ─► + α·PE ─► N × [causal self-attn │
//!                                                  → cross-attn ◄───┘
//!                                                  → FFN]
//!                                                     │
//!                           mel_linear ─► mel_output ─┼─► + PostNet ─► postnet_output
//!                           stop_linear ─► stop_preds ┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: model hyper-parameters with serde defaults
//! - [`model`]: encoder, decoder, attention, masks, output heads
//! - [`synthesis`]: greedy autoregressive decoding loop

pub mod config;
pub mod model;
pub mod synthesis;

mod error;

pub use config::TransformerTtsConfig;
pub use error::{Error, Result};
pub use model::{ForwardInputs, ForwardOutput, MaskSet, TransformerTts};
