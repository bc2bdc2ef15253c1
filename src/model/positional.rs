//! Sinusoidal positional encoding with a learnable scale.
//!
//! ```text
//! angle(pos, i) = pos / 10000^(2 * (i / 2) / dim)
//! PE[pos, 2j]   = sin(angle)
//! PE[pos, 2j+1] = cos(angle)
//! PE[0, :]      = 0            (padding position)
//! ```
//!
//! The looked-up rows are multiplied by a scalar `alpha` (initialised to 1.0)
//! before being added to the prenet output.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::{Error, Result};

/// Build the `[max_positions, dim]` sinusoid table, row-major.
pub fn sinusoid_table(max_positions: usize, dim: usize) -> Vec<f32> {
    let mut table = vec![0f32; max_positions * dim];
    for pos in 1..max_positions {
        for i in 0..dim {
            let exponent = (2 * (i / 2)) as f64 / dim as f64;
            let angle = pos as f64 / 10000f64.powf(exponent);
            table[pos * dim + i] = (if i % 2 == 0 { angle.sin() } else { angle.cos() }) as f32;
        }
    }
    table
}

/// Position ids for symbol sequences `[B, T]`: `t + 1` for real symbols,
/// 0 where the id is the padding symbol 0.
pub fn text_positions(characters: &Tensor) -> Result<Tensor> {
    let (batch, len) = characters.dims2()?;
    let ramp = Tensor::arange(1u32, len as u32 + 1, characters.device())?
        .unsqueeze(0)?
        .broadcast_as((batch, len))?;
    let ids = characters.to_dtype(DType::U32)?;
    let keep = ids.ne(&ids.zeros_like()?)?;
    Ok(keep.where_cond(&ramp, &ramp.zeros_like()?)?)
}

/// Position ids `1..=len` for every row of a batch of frames.
pub fn frame_positions(batch: usize, len: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::arange(1u32, len as u32 + 1, device)?
        .unsqueeze(0)?
        .repeat((batch, 1))?)
}

#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    table: Tensor,
    alpha: Tensor,
    max_positions: usize,
}

impl PositionalEncoding {
    pub fn new(max_positions: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        let table = Self::table(max_positions, dim, vb.dtype(), vb.device())?;
        let alpha = vb.get_with_hints(1, "alpha", Init::Const(1.0))?;
        Ok(Self {
            table,
            alpha,
            max_positions,
        })
    }

    fn table(max_positions: usize, dim: usize, dtype: DType, dev: &Device) -> Result<Tensor> {
        let data = sinusoid_table(max_positions, dim);
        Ok(Tensor::from_vec(data, (max_positions, dim), dev)?.to_dtype(dtype)?)
    }

    /// Scaled encodings `alpha * PE[positions]`.
    ///
    /// `positions`: `[B, T]` integer ids → returns `[B, T, dim]`.
    pub fn forward(&self, positions: &Tensor) -> Result<Tensor> {
        let (batch, len) = positions.dims2()?;
        let ids = positions.to_dtype(DType::U32)?.flatten_all()?;
        if ids.elem_count() > 0 {
            let max = ids.max(0)?.to_scalar::<u32>()?;
            if max as usize >= self.max_positions {
                return Err(Error::PositionOutOfRange {
                    position: max,
                    max: self.max_positions,
                });
            }
        }
        let dim = self.table.dim(1)?;
        let pe = self.table.index_select(&ids, 0)?.reshape((batch, len, dim))?;
        Ok(pe.broadcast_mul(&self.alpha)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn encoding(max_positions: usize, dim: usize) -> PositionalEncoding {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        PositionalEncoding::new(max_positions, dim, vb).unwrap()
    }

    #[test]
    fn table_row_zero_is_padding() {
        let table = sinusoid_table(4, 6);
        assert!(table[..6].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn table_matches_closed_form() {
        let dim = 8;
        let table = sinusoid_table(3, dim);
        // pos 1, column 0: sin(1)
        assert!((table[dim] - 1f32.sin()).abs() < 1e-6);
        // pos 1, column 1: cos(1)
        assert!((table[dim + 1] - 1f32.cos()).abs() < 1e-6);
        // pos 2, column 2: sin(2 / 10000^(2/8))
        let expected = (2.0 / 10000f64.powf(0.25)).sin() as f32;
        assert!((table[2 * dim + 2] - expected).abs() < 1e-6);
    }

    #[test]
    fn alpha_starts_at_one() {
        let pe = encoding(16, 4);
        let pos = Tensor::new(&[[1u32, 2, 0]], &Device::Cpu).unwrap();
        let out = pe.forward(&pos).unwrap();
        assert_eq!(out.dims(), &[1, 3, 4]);
        let rows: Vec<Vec<f32>> = out.squeeze(0).unwrap().to_vec2().unwrap();
        assert!((rows[0][0] - 1f32.sin()).abs() < 1e-6);
        assert!(rows[2].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn text_positions_skip_padding() {
        let ids = Tensor::new(&[[5u32, 9, 0, 0], [3, 1, 4, 1]], &Device::Cpu).unwrap();
        let pos: Vec<Vec<u32>> = text_positions(&ids).unwrap().to_vec2().unwrap();
        assert_eq!(pos, vec![vec![1, 2, 0, 0], vec![1, 2, 3, 4]]);
    }

    #[test]
    fn frame_positions_start_at_one() {
        let pos: Vec<Vec<u32>> = frame_positions(2, 3, &Device::Cpu).unwrap().to_vec2().unwrap();
        assert_eq!(pos, vec![vec![1, 2, 3], vec![1, 2, 3]]);
    }

    #[test]
    fn position_past_table_rejected() {
        let pe = encoding(8, 4);
        let pos = Tensor::new(&[[1u32, 8]], &Device::Cpu).unwrap();
        let err = pe.forward(&pos).unwrap_err();
        assert!(matches!(
            err,
            Error::PositionOutOfRange {
                position: 8,
                max: 8
            }
        ));
    }
}
