//! Boolean attention masks and the six mask roles of the model.
//!
//! Masks are `u8` tensors: nonzero = attend, zero = block. Two kinds exist:
//!
//! ```text
//! attention mask  [B, T_q, T_k]   gates which keys a query may see (pre-softmax)
//! query mask      [B, T_q, 1]     gates which query rows are valid (post-softmax)
//! ```
//!
//! Attention masks are applied by replacing blocked logits with the most
//! negative finite value of the compute dtype, so blocked keys get probability
//! exactly 0 and a fully blocked row still yields a finite softmax. Query masks
//! zero whole weight rows afterwards, which removes those finite-but-meaningless
//! rows before they reach any residual sum.

use candle_core::{DType, Device, Tensor};

use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Key-padding mask `[B, q_len, k_len]`: key `k` visible iff `k < lengths[b]`.
pub fn key_padding_mask(
    lengths: &[usize],
    q_len: usize,
    k_len: usize,
    device: &Device,
) -> Result<Tensor> {
    let batch = lengths.len();
    let mut data = vec![0u8; batch * q_len * k_len];
    for (b, &len) in lengths.iter().enumerate() {
        let valid = len.min(k_len);
        for q in 0..q_len {
            let row = (b * q_len + q) * k_len;
            data[row..row + valid].fill(1);
        }
    }
    Ok(Tensor::from_vec(data, (batch, q_len, k_len), device)?)
}

/// Causal + padding mask `[B, len, len]`: key `k` visible from query `q`
/// iff `k <= q` and `k < lengths[b]`.
pub fn causal_mask(lengths: &[usize], len: usize, device: &Device) -> Result<Tensor> {
    let batch = lengths.len();
    let mut data = vec![0u8; batch * len * len];
    for (b, &valid) in lengths.iter().enumerate() {
        let valid = valid.min(len);
        for q in 0..len {
            let row = (b * len + q) * len;
            let visible = (q + 1).min(valid);
            data[row..row + visible].fill(1);
        }
    }
    Ok(Tensor::from_vec(data, (batch, len, len), device)?)
}

/// Query mask `[B, len, 1]`: 1 at valid query positions, 0 at padding.
pub fn query_mask(lengths: &[usize], len: usize, device: &Device) -> Result<Tensor> {
    let batch = lengths.len();
    let mut data = vec![0u8; batch * len];
    for (b, &valid) in lengths.iter().enumerate() {
        let valid = valid.min(len);
        data[b * len..b * len + valid].fill(1);
    }
    Ok(Tensor::from_vec(data, (batch, len, 1), device)?)
}

/// Sequence lengths from position ids `[B, T]`, where 0 marks padding.
pub fn lengths_from_positions(positions: &Tensor) -> Result<Vec<usize>> {
    let rows: Vec<Vec<u32>> = positions.to_dtype(DType::U32)?.to_vec2()?;
    Ok(rows
        .iter()
        .map(|row| row.iter().filter(|&&p| p != 0).count())
        .collect())
}

// ---------------------------------------------------------------------------
// Mask roles
// ---------------------------------------------------------------------------

/// The six masks consumed by one forward pass.
///
/// Every optional field follows the same contract: `None` means the role is
/// unrestricted, exactly as if an all-ones mask of the right shape had been
/// supplied.
///
/// | field | shape | stage | gates |
/// |---|---|---|---|
/// | `dec_slf_mask` | `[B, T_mel, T_mel]` | decoder self-attn logits | causal ∧ padding |
/// | `enc_slf_mask` | `[B, T_text, T_text]` | encoder self-attn logits | text padding |
/// | `enc_query_mask` | `[B, T_text, 1]` | encoder self-attn rows | text padding |
/// | `enc_dec_mask` | `[B, T_mel, T_text]` | cross-attn logits | text padding |
/// | `dec_query_slf_mask` | `[B, T_mel, 1]` | decoder self-attn rows | mel padding |
/// | `dec_query_mask` | `[B, T_mel, 1]` | cross-attn rows | mel padding |
#[derive(Debug, Clone)]
pub struct MaskSet {
    pub dec_slf_mask: Tensor,
    pub enc_slf_mask: Option<Tensor>,
    pub enc_query_mask: Option<Tensor>,
    pub enc_dec_mask: Option<Tensor>,
    pub dec_query_slf_mask: Option<Tensor>,
    pub dec_query_mask: Option<Tensor>,
}

impl MaskSet {
    /// Only the strict causal decoder mask; every other role unrestricted.
    pub fn causal(batch: usize, t_mel: usize, device: &Device) -> Result<Self> {
        let lengths = vec![t_mel; batch];
        Ok(Self {
            dec_slf_mask: causal_mask(&lengths, t_mel, device)?,
            enc_slf_mask: None,
            enc_query_mask: None,
            enc_dec_mask: None,
            dec_query_slf_mask: None,
            dec_query_mask: None,
        })
    }

    /// All six roles from per-example text and mel lengths.
    pub fn from_lengths(
        text_lengths: &[usize],
        mel_lengths: &[usize],
        t_text: usize,
        t_mel: usize,
        device: &Device,
    ) -> Result<Self> {
        if text_lengths.len() != mel_lengths.len() {
            return Err(Error::shape(
                "mask lengths batch",
                &[text_lengths.len()],
                &[mel_lengths.len()],
            ));
        }
        Ok(Self {
            dec_slf_mask: causal_mask(mel_lengths, t_mel, device)?,
            enc_slf_mask: Some(key_padding_mask(text_lengths, t_text, t_text, device)?),
            enc_query_mask: Some(query_mask(text_lengths, t_text, device)?),
            enc_dec_mask: Some(key_padding_mask(text_lengths, t_mel, t_text, device)?),
            dec_query_slf_mask: Some(query_mask(mel_lengths, t_mel, device)?),
            dec_query_mask: Some(query_mask(mel_lengths, t_mel, device)?),
        })
    }

    /// All six roles from position ids (`pos_text [B, T_text]`,
    /// `pos_mel [B, T_mel]`), where position 0 marks padding.
    pub fn from_positions(pos_text: &Tensor, pos_mel: &Tensor) -> Result<Self> {
        let (_, t_text) = pos_text.dims2()?;
        let (_, t_mel) = pos_mel.dims2()?;
        let text_lengths = lengths_from_positions(pos_text)?;
        let mel_lengths = lengths_from_positions(pos_mel)?;
        Self::from_lengths(
            &text_lengths,
            &mel_lengths,
            t_text,
            t_mel,
            pos_text.device(),
        )
    }

    /// Check every supplied mask against the batch and sequence sizes.
    pub fn validate(&self, batch: usize, t_text: usize, t_mel: usize) -> Result<()> {
        check_mask("dec_slf_mask", &self.dec_slf_mask, &[batch, t_mel, t_mel])?;
        let optional = [
            ("enc_slf_mask", &self.enc_slf_mask, [batch, t_text, t_text]),
            ("enc_query_mask", &self.enc_query_mask, [batch, t_text, 1]),
            ("enc_dec_mask", &self.enc_dec_mask, [batch, t_mel, t_text]),
            ("dec_query_slf_mask", &self.dec_query_slf_mask, [batch, t_mel, 1]),
            ("dec_query_mask", &self.dec_query_mask, [batch, t_mel, 1]),
        ];
        for (role, mask, expected) in optional {
            if let Some(mask) = mask {
                check_mask(role, mask, &expected)?;
            }
        }
        Ok(())
    }
}

/// A mask is accepted when it has rank 3 and each dim equals the expected one
/// or is 1 (broadcast).
pub(crate) fn check_mask(role: &'static str, mask: &Tensor, expected: &[usize]) -> Result<()> {
    let dims = mask.dims();
    let ok = dims.len() == expected.len()
        && dims
            .iter()
            .zip(expected)
            .all(|(&got, &want)| got == want || got == 1);
    if ok {
        Ok(())
    } else {
        Err(Error::mask(role, expected, dims))
    }
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Most negative finite value representable in `dtype`.
pub fn min_value(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => f64::from(half::f16::MIN),
        DType::BF16 => f64::from(half::bf16::MIN),
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    }
}

/// Replace logits at blocked keys with [`min_value`].
///
/// - `scores`: `[B, H, T_q, T_k]`
/// - `mask`: `[B, T_q, T_k]` (dims of 1 broadcast)
pub fn mask_logits(scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let shape = scores.shape();
    let keep = mask.ne(&mask.zeros_like()?)?.unsqueeze(1)?.broadcast_as(shape)?;
    let fill = Tensor::new(min_value(scores.dtype()), scores.device())?
        .to_dtype(scores.dtype())?
        .broadcast_as(shape)?;
    Ok(keep.where_cond(scores, &fill)?)
}

/// Zero the weight rows of invalid queries.
///
/// - `weights`: `[B, H, T_q, T_k]`
/// - `query_mask`: `[B, T_q, 1]`
pub fn zero_query_rows(weights: &Tensor, query_mask: &Tensor) -> Result<Tensor> {
    let keep = query_mask
        .ne(&query_mask.zeros_like()?)?
        .to_dtype(weights.dtype())?
        .unsqueeze(1)?;
    Ok(weights.broadcast_mul(&keep)?)
}
