//! Position-wise feed-forward block.
//!
//! `x → Conv1d(k=1, D→F) → ReLU → Conv1d(k=1, F→D) → dropout → + x → LayerNorm`

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use crate::Result;

pub struct FeedForward {
    w_1: candle_nn::Conv1d,
    w_2: candle_nn::Conv1d,
    layer_norm: candle_nn::LayerNorm,
    dropout: f32,
}

impl FeedForward {
    pub fn load(
        vb: VarBuilder,
        dim: usize,
        inner_dim: usize,
        layer_norm_eps: f64,
        dropout: f32,
    ) -> Result<Self> {
        let cfg = candle_nn::Conv1dConfig {
            padding: 0,
            stride: 1,
            dilation: 1,
            groups: 1,
            ..Default::default()
        };
        let w_1 = candle_nn::conv1d(dim, inner_dim, 1, cfg, vb.pp("w_1"))?;
        let w_2 = candle_nn::conv1d(inner_dim, dim, 1, cfg, vb.pp("w_2"))?;
        let layer_norm = candle_nn::layer_norm(dim, layer_norm_eps, vb.pp("layer_norm"))?;
        Ok(Self {
            w_1,
            w_2,
            layer_norm,
            dropout,
        })
    }

    /// `x`: `[B, T, D]` → `[B, T, D]`.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        // Conv1d runs channels-first: [B, D, T]
        let h = x.transpose(1, 2)?.contiguous()?;
        let h = self.w_1.forward(&h)?.relu()?;
        let h = self.w_2.forward(&h)?.transpose(1, 2)?;
        let h = if train && self.dropout > 0.0 {
            candle_nn::ops::dropout(&h, self.dropout)?
        } else {
            h
        };
        Ok(self.layer_norm.forward(&(h + x)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn preserves_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ffn = FeedForward::load(vb, 16, 64, 1e-5, 0.1).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 5, 16), &Device::Cpu).unwrap();
        let y = ffn.forward(&x, false).unwrap();
        assert_eq!(y.dims(), &[2, 5, 16]);
    }

    #[test]
    fn zero_weights_reduce_to_layer_norm_of_input() {
        // With zero convs the block is LayerNorm(x) with zero gain and bias.
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let ffn = FeedForward::load(vb, 8, 32, 1e-5, 0.0).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 3, 8), &Device::Cpu).unwrap();
        let y: Vec<f32> = ffn.forward(&x, false).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(y.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn position_wise() {
        // Each frame is transformed independently.
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ffn = FeedForward::load(vb, 8, 16, 1e-5, 0.1).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 4, 8), &Device::Cpu).unwrap();
        let full = ffn.forward(&x, false).unwrap();
        let head = ffn.forward(&x.narrow(1, 0, 2).unwrap(), false).unwrap();
        let diff = (full.narrow(1, 0, 2).unwrap() - head)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
    }
}
