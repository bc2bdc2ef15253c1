//! Convolutional PostNet refining the coarse mel prediction.
//!
//! ```text
//! [B, T, C] ─► Conv1d(C→H) ─► BN ─► tanh ─► dropout
//!           ─► (num_conv - 2) × [Conv1d(H→H) ─► BN ─► tanh ─► dropout]
//!           ─► Conv1d(H→C) ─► [B, T, C]
//! ```
//!
//! Every convolution is padded by `kernel - 1` on both sides and truncated to
//! the first `T` outputs, so frame `t` only sees frames `≤ t`.

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use crate::Result;

const BATCH_NORM_EPS: f64 = 1e-5;

pub struct PostNet {
    convs: Vec<candle_nn::Conv1d>,
    norms: Vec<candle_nn::BatchNorm>,
    dropout: f32,
}

impl PostNet {
    pub fn load(
        vb: VarBuilder,
        channels: usize,
        hidden: usize,
        num_conv: usize,
        kernel_size: usize,
        dropout: f32,
    ) -> Result<Self> {
        let cfg = candle_nn::Conv1dConfig {
            padding: kernel_size - 1,
            ..Default::default()
        };
        let mut convs = Vec::with_capacity(num_conv);
        let mut norms = Vec::with_capacity(num_conv - 1);
        for i in 0..num_conv {
            let in_c = if i == 0 { channels } else { hidden };
            let out_c = if i == num_conv - 1 { channels } else { hidden };
            convs.push(candle_nn::conv1d(
                in_c,
                out_c,
                kernel_size,
                cfg,
                vb.pp(format!("convs.{i}")),
            )?);
            if i < num_conv - 1 {
                norms.push(candle_nn::batch_norm(
                    hidden,
                    BATCH_NORM_EPS,
                    vb.pp(format!("norms.{i}")),
                )?);
            }
        }
        Ok(Self {
            convs,
            norms,
            dropout,
        })
    }

    /// `mel`: `[B, T, C]` → residual `[B, T, C]` (not yet added to `mel`).
    pub fn forward(&self, mel: &Tensor, train: bool) -> Result<Tensor> {
        let len = mel.dim(1)?;
        let mut x = mel.transpose(1, 2)?.contiguous()?;
        for (i, conv) in self.convs.iter().enumerate() {
            x = conv.forward(&x)?.narrow(2, 0, len)?;
            if let Some(norm) = self.norms.get(i) {
                x = x.contiguous()?.apply_t(norm, train)?.tanh()?;
                if train && self.dropout > 0.0 {
                    x = candle_nn::ops::dropout(&x, self.dropout)?;
                }
            }
        }
        Ok(x.transpose(1, 2)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn postnet() -> (VarMap, PostNet) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = PostNet::load(vb, 6, 8, 5, 5, 0.1).unwrap();
        (varmap, net)
    }

    #[test]
    fn preserves_shape() {
        let (_vm, net) = postnet();
        let mel = Tensor::randn(0f32, 1.0, (2, 7, 6), &Device::Cpu).unwrap();
        assert_eq!(net.forward(&mel, false).unwrap().dims(), &[2, 7, 6]);
    }

    #[test]
    fn causal_over_frames() {
        let (_vm, net) = postnet();
        let mel = Tensor::randn(0f32, 1.0, (1, 6, 6), &Device::Cpu).unwrap();
        let tail = Tensor::randn(0f32, 1.0, (1, 3, 6), &Device::Cpu).unwrap();
        let changed = Tensor::cat(&[&mel.narrow(1, 0, 3).unwrap(), &tail], 1).unwrap();
        let a = net.forward(&mel, false).unwrap().narrow(1, 0, 3).unwrap();
        let b = net.forward(&changed, false).unwrap().narrow(1, 0, 3).unwrap();
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
    }
}
