//! Multi-head scaled dot-product attention with residual and layer norm.
//!
//! ```text
//! query ──┬─► W_q (no bias) ─┐
//!         │                  ├─► QKᵀ/√d_k ─► mask logits ─► softmax ─► dropout
//! key ────┼─► W_k (no bias) ─┘                                            │
//! value ──┼─► W_v ───────────────────────────────► zero query rows ◄──────┘
//!         │                                              │ × V, concat heads
//!         └────────► [query ‖ context] ─► W_o ─► dropout ─► + query ─► LayerNorm
//! ```
//!
//! With `concat_query = false` the output projection sees only the context.

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::mask;
use crate::{Error, Result};

pub struct MultiHeadAttention {
    key: candle_nn::Linear,
    value: candle_nn::Linear,
    query: candle_nn::Linear,
    final_linear: candle_nn::Linear,
    layer_norm: candle_nn::LayerNorm,
    num_heads: usize,
    head_dim: usize,
    dim: usize,
    concat_query: bool,
    dropout: f32,
}

impl MultiHeadAttention {
    pub fn load(
        vb: VarBuilder,
        dim: usize,
        num_heads: usize,
        concat_query: bool,
        layer_norm_eps: f64,
        dropout: f32,
    ) -> Result<Self> {
        if num_heads == 0 || !dim.is_multiple_of(num_heads) {
            return Err(Error::Config(format!(
                "attention width {dim} not divisible by {num_heads} heads"
            )));
        }
        let key = candle_nn::linear_no_bias(dim, dim, vb.pp("key"))?;
        let value = candle_nn::linear(dim, dim, vb.pp("value"))?;
        let query = candle_nn::linear_no_bias(dim, dim, vb.pp("query"))?;
        let out_in = if concat_query { dim * 2 } else { dim };
        let final_linear = candle_nn::linear(out_in, dim, vb.pp("final_linear"))?;
        let layer_norm = candle_nn::layer_norm(dim, layer_norm_eps, vb.pp("layer_norm"))?;
        Ok(Self {
            key,
            value,
            query,
            final_linear,
            layer_norm,
            num_heads,
            head_dim: dim / num_heads,
            dim,
            concat_query,
            dropout,
        })
    }

    /// Forward pass.
    ///
    /// - `query`: `[B, T_q, D]`
    /// - `key`, `value`: `[B, T_k, D]`
    /// - `attn_mask`: `[B, T_q, T_k]`, nonzero = attend
    /// - `query_mask`: `[B, T_q, 1]`, nonzero = valid query
    ///
    /// Returns `(output [B, T_q, D], weights [B, H, T_q, T_k])`.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attn_mask: Option<&Tensor>,
        query_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (batch, q_len, q_dim) = query.dims3()?;
        let (k_batch, k_len, k_dim) = key.dims3()?;
        let (v_batch, v_len, v_dim) = value.dims3()?;
        if q_dim != self.dim {
            return Err(Error::shape("attention query", &[batch, q_len, self.dim], query.dims()));
        }
        if (k_batch, k_dim) != (batch, self.dim) {
            return Err(Error::shape("attention key", &[batch, k_len, self.dim], key.dims()));
        }
        if (v_batch, v_len, v_dim) != (batch, k_len, self.dim) {
            return Err(Error::shape("attention value", &[batch, k_len, self.dim], value.dims()));
        }
        if let Some(m) = attn_mask {
            mask::check_mask("attn_mask", m, &[batch, q_len, k_len])?;
        }
        if let Some(m) = query_mask {
            mask::check_mask("query_mask", m, &[batch, q_len, 1])?;
        }

        // [B, T, D] → [B, H, T, d_k]
        let q = self.split_heads(&self.query.forward(query)?, q_len)?;
        let k = self.split_heads(&self.key.forward(key)?, k_len)?;
        let v = self.split_heads(&self.value.forward(value)?, k_len)?;

        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? / scale)?; // [B, H, T_q, T_k]
        let scores = match attn_mask {
            Some(m) => mask::mask_logits(&scores, m)?,
            None => scores,
        };

        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let weights = self.maybe_dropout(&weights, train)?;
        let weights = match query_mask {
            Some(m) => mask::zero_query_rows(&weights, m)?,
            None => weights,
        };

        // [B, H, T_q, d_k] → [B, T_q, D]
        let context = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, q_len, self.dim))?;

        let projected = if self.concat_query {
            let joined = Tensor::cat(&[query, &context], 2)?;
            self.final_linear.forward(&joined)?
        } else {
            self.final_linear.forward(&context)?
        };
        let projected = self.maybe_dropout(&projected, train)?;
        let out = self.layer_norm.forward(&(projected + query)?)?;
        Ok((out, weights))
    }

    fn split_heads(&self, x: &Tensor, len: usize) -> Result<Tensor> {
        let batch = x.dim(0)?;
        Ok(x.reshape((batch, len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn maybe_dropout(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        if train && self.dropout > 0.0 {
            Ok(candle_nn::ops::dropout(x, self.dropout)?)
        } else {
            Ok(x.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn make_attn(concat_query: bool) -> (VarMap, MultiHeadAttention) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = MultiHeadAttention::load(vb, 16, 4, concat_query, 1e-5, 0.1).unwrap();
        (varmap, attn)
    }

    fn randn(shape: (usize, usize, usize)) -> Tensor {
        Tensor::randn(0f32, 1.0, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn output_and_weight_shapes() {
        for concat_query in [true, false] {
            let (_vm, attn) = make_attn(concat_query);
            let q = randn((2, 7, 16));
            let kv = randn((2, 5, 16));
            let (out, w) = attn.forward(&q, &kv, &kv, None, None, false).unwrap();
            assert_eq!(out.dims(), &[2, 7, 16]);
            assert_eq!(w.dims(), &[2, 4, 7, 5]);
        }
    }

    #[test]
    fn weights_sum_to_one_and_vanish_at_masked_keys() {
        let (_vm, attn) = make_attn(true);
        let q = randn((2, 3, 16));
        let kv = randn((2, 4, 16));
        let lengths = [4, 2];
        let m = mask::key_padding_mask(&lengths, 3, 4, &Device::Cpu).unwrap();
        let (_, w) = attn.forward(&q, &kv, &kv, Some(&m), None, false).unwrap();
        let w: Vec<Vec<Vec<Vec<f32>>>> = (0..2)
            .map(|b| {
                let wb = w.get(b).unwrap();
                (0..4).map(|h| wb.get(h).unwrap().to_vec2().unwrap()).collect()
            })
            .collect();
        for (b, &len) in lengths.iter().enumerate() {
            for head in &w[b] {
                for row in head {
                    let total: f32 = row[..len].iter().sum();
                    assert!((total - 1.0).abs() < 1e-5);
                    assert!(row[len..].iter().all(|&v| v == 0.0));
                }
            }
        }
    }

    #[test]
    fn padded_query_rows_are_zero() {
        let (_vm, attn) = make_attn(true);
        let x = randn((1, 4, 16));
        let qm = mask::query_mask(&[2], 4, &Device::Cpu).unwrap();
        let am = mask::key_padding_mask(&[2], 4, 4, &Device::Cpu).unwrap();
        let (_, w) = attn.forward(&x, &x, &x, Some(&am), Some(&qm), false).unwrap();
        let rows: Vec<f32> = w.narrow(2, 2, 2).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(rows.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn values_past_length_do_not_leak() {
        let (_vm, attn) = make_attn(true);
        let q = randn((1, 3, 16));
        let kv = randn((1, 5, 16));
        let noise = Tensor::cat(
            &[
                Tensor::zeros((1, 3, 16), DType::F32, &Device::Cpu).unwrap(),
                randn((1, 2, 16)),
            ],
            1,
        )
        .unwrap();
        let kv_noisy = (&kv + noise).unwrap();
        let m = mask::key_padding_mask(&[3], 3, 5, &Device::Cpu).unwrap();
        let (a, _) = attn.forward(&q, &kv, &kv, Some(&m), None, false).unwrap();
        let (b, _) = attn.forward(&q, &kv_noisy, &kv_noisy, Some(&m), None, false).unwrap();
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-5);
    }

    #[test]
    fn all_attend_mask_matches_no_mask() {
        let (_vm, attn) = make_attn(true);
        let q = randn((2, 3, 16));
        let kv = randn((2, 4, 16));
        let ones = Tensor::ones((2, 3, 4), DType::U8, &Device::Cpu).unwrap();
        let qm = Tensor::ones((2, 3, 1), DType::U8, &Device::Cpu).unwrap();
        let (a, wa) = attn.forward(&q, &kv, &kv, None, None, false).unwrap();
        let (b, wb) = attn.forward(&q, &kv, &kv, Some(&ones), Some(&qm), false).unwrap();
        let d_out = (a - b).unwrap().abs().unwrap().max_all().unwrap();
        let d_w = (wa - wb).unwrap().abs().unwrap().max_all().unwrap();
        assert_eq!(d_out.to_scalar::<f32>().unwrap(), 0.0);
        assert_eq!(d_w.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn mismatched_key_width_rejected() {
        let (_vm, attn) = make_attn(true);
        let q = randn((1, 3, 16));
        let kv = randn((1, 4, 8));
        let err = attn.forward(&q, &kv, &kv, None, None, false).err().unwrap();
        assert!(matches!(err, Error::ShapeMismatch { context: "attention key", .. }));
    }

    #[test]
    fn mismatched_mask_rejected() {
        let (_vm, attn) = make_attn(true);
        let q = randn((1, 3, 16));
        let kv = randn((1, 4, 16));
        let m = Tensor::ones((1, 3, 5), DType::U8, &Device::Cpu).unwrap();
        let err = attn.forward(&q, &kv, &kv, Some(&m), None, false).err().unwrap();
        assert!(matches!(err, Error::MaskShapeMismatch { .. }));
    }
}
