//! Configuration for the TransformerTTS acoustic model.
//!
//! Defaults follow the usual LJSpeech recipe (`num_hidden = 256`, 4 heads,
//! 3 encoder and 3 decoder layers, 80 mel bins).
//! Every field can be omitted from a JSON config and falls back to its default.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerTtsConfig {
    /// Size of the input symbol table (id 0 is padding).
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    /// Width of the symbol embedding fed into the encoder prenet.
    #[serde(default = "default_embedding_size")]
    pub embedding_size: usize,

    /// Hidden width used throughout encoder and decoder.
    #[serde(default = "default_num_hidden")]
    pub num_hidden: usize,

    /// Attention heads in every encoder layer.
    #[serde(default = "default_num_head")]
    pub encoder_num_head: usize,

    /// Number of encoder layers.
    #[serde(default = "default_n_layers")]
    pub encoder_n_layers: usize,

    /// Attention heads in every decoder layer.
    #[serde(default = "default_num_head")]
    pub decoder_num_head: usize,

    /// Number of decoder layers.
    #[serde(default = "default_n_layers")]
    pub decoder_n_layers: usize,

    /// Mel channels per output frame.
    #[serde(default = "default_n_mels")]
    pub n_mels: usize,

    /// Mel frames predicted per decoder step.
    #[serde(default = "default_outputs_per_step")]
    pub outputs_per_step: usize,

    /// Rows in the sinusoidal positional table (row 0 is the padding position).
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,

    /// Convolutions in the PostNet.
    #[serde(default = "default_postnet_num_conv")]
    pub postnet_num_conv: usize,

    /// Kernel width of every PostNet convolution.
    #[serde(default = "default_postnet_kernel_size")]
    pub postnet_kernel_size: usize,

    /// Feed the attention query into the output projection alongside the
    /// attended context (`Linear(2 * num_hidden, num_hidden)`).
    #[serde(default = "default_concat_query")]
    pub concat_query: bool,

    /// Layer-norm epsilon.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,

    /// Dropout rate in attention, feed-forward and PostNet (training only).
    #[serde(default = "default_dropout")]
    pub dropout: f32,

    /// Dropout rate in the encoder and decoder prenets (training only).
    #[serde(default = "default_prenet_dropout")]
    pub prenet_dropout: f32,
}

impl Default for TransformerTtsConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            embedding_size: default_embedding_size(),
            num_hidden: default_num_hidden(),
            encoder_num_head: default_num_head(),
            encoder_n_layers: default_n_layers(),
            decoder_num_head: default_num_head(),
            decoder_n_layers: default_n_layers(),
            n_mels: default_n_mels(),
            outputs_per_step: default_outputs_per_step(),
            max_positions: default_max_positions(),
            postnet_num_conv: default_postnet_num_conv(),
            postnet_kernel_size: default_postnet_kernel_size(),
            concat_query: default_concat_query(),
            layer_norm_eps: default_layer_norm_eps(),
            dropout: default_dropout(),
            prenet_dropout: default_prenet_dropout(),
        }
    }
}

impl TransformerTtsConfig {
    /// Read a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Mel values produced per decoder step (`outputs_per_step * n_mels`).
    pub fn frame_dim(&self) -> usize {
        self.outputs_per_step * self.n_mels
    }

    /// Inner width of the position-wise feed-forward in the encoder.
    pub fn encoder_ffn_dim(&self) -> usize {
        self.num_hidden * self.encoder_num_head
    }

    /// Inner width of the position-wise feed-forward in the decoder.
    pub fn decoder_ffn_dim(&self) -> usize {
        self.num_hidden * self.decoder_num_head
    }

    /// Check that the configuration is internally consistent.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("embedding_size", self.embedding_size),
            ("num_hidden", self.num_hidden),
            ("encoder_num_head", self.encoder_num_head),
            ("encoder_n_layers", self.encoder_n_layers),
            ("decoder_num_head", self.decoder_num_head),
            ("decoder_n_layers", self.decoder_n_layers),
            ("n_mels", self.n_mels),
            ("outputs_per_step", self.outputs_per_step),
            ("max_positions", self.max_positions),
            ("postnet_kernel_size", self.postnet_kernel_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(Error::Config(format!("{name} must be positive")));
        }
        if !self.num_hidden.is_multiple_of(self.encoder_num_head) {
            return Err(Error::Config(format!(
                "num_hidden {} not divisible by encoder_num_head {}",
                self.num_hidden, self.encoder_num_head
            )));
        }
        if !self.num_hidden.is_multiple_of(self.decoder_num_head) {
            return Err(Error::Config(format!(
                "num_hidden {} not divisible by decoder_num_head {}",
                self.num_hidden, self.decoder_num_head
            )));
        }
        if self.postnet_num_conv < 2 {
            return Err(Error::Config(format!(
                "postnet_num_conv must be at least 2, got {}",
                self.postnet_num_conv
            )));
        }
        for (name, p) in [("dropout", self.dropout), ("prenet_dropout", self.prenet_dropout)] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Config(format!("{name} must be in [0, 1), got {p}")));
            }
        }
        Ok(())
    }
}

fn default_vocab_size() -> usize {
    150
}
fn default_embedding_size() -> usize {
    512
}
fn default_num_hidden() -> usize {
    256
}
fn default_num_head() -> usize {
    4
}
fn default_n_layers() -> usize {
    3
}
fn default_n_mels() -> usize {
    80
}
fn default_outputs_per_step() -> usize {
    1
}
fn default_max_positions() -> usize {
    1024
}
fn default_postnet_num_conv() -> usize {
    5
}
fn default_postnet_kernel_size() -> usize {
    5
}
fn default_concat_query() -> bool {
    true
}
fn default_layer_norm_eps() -> f64 {
    1e-5
}
fn default_dropout() -> f32 {
    0.1
}
fn default_prenet_dropout() -> f32 {
    0.2
}
