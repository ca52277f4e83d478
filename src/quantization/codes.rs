//! Conversion between grid-aligned weights and integer codes.

use candle_core::{DType, Tensor};

use crate::GptqError;

struct GroupParams {
    scale: Vec<f32>,
    zero: Vec<f32>,
    g_idx: Vec<u32>,
    ngroups: usize,
    rows: usize,
}

impl GroupParams {
    fn load(scale: &Tensor, zero: &Tensor, g_idx: &Tensor, rows: usize, cols: usize) -> crate::Result<Self> {
        let (ngroups, scale_rows) = scale.dims2()?;
        if scale_rows != rows || zero.dims() != scale.dims() {
            return Err(GptqError::Config(format!(
                "scale {:?} / zero {:?} do not match {} rows",
                scale.dims(),
                zero.dims(),
                rows
            )));
        }
        let g_idx: Vec<u32> = g_idx.to_dtype(DType::U32)?.to_vec1()?;
        if g_idx.len() != cols {
            return Err(GptqError::Config(format!(
                "g_idx has {} entries for {} columns",
                g_idx.len(),
                cols
            )));
        }
        if let Some(bad) = g_idx.iter().find(|g| **g as usize >= ngroups) {
            return Err(GptqError::Config(format!(
                "group index {} out of range for {} groups",
                bad, ngroups
            )));
        }
        Ok(Self {
            scale: scale.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?,
            zero: zero.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?,
            g_idx,
            ngroups,
            rows,
        })
    }

    fn at(&self, row: usize, col: usize) -> (f32, f32) {
        let idx = self.g_idx[col] as usize * self.rows + row;
        (self.scale[idx], self.zero[idx])
    }
}

/// Integer codes `(rows, cols)` U32 of a grid-aligned `(rows, cols)` matrix
pub fn weight_codes(
    matrix: &Tensor,
    scale: &Tensor,
    zero: &Tensor,
    g_idx: &Tensor,
    maxq: u32,
) -> crate::Result<Tensor> {
    let (rows, cols) = matrix.dims2()?;
    let params = GroupParams::load(scale, zero, g_idx, rows, cols)?;
    let data: Vec<Vec<f32>> = matrix.to_dtype(DType::F32)?.to_vec2()?;

    let mut codes = Vec::with_capacity(rows * cols);
    for (r, row) in data.iter().enumerate() {
        for (c, &x) in row.iter().enumerate() {
            let (s, z) = params.at(r, c);
            codes.push(((x / s).round_ties_even() + z).clamp(0.0, maxq as f32) as u32);
        }
    }
    Ok(Tensor::from_vec(codes, (rows, cols), matrix.device())?)
}

/// F32 matrix `scale * (code - zero)` for integer codes `(rows, cols)`
pub fn dequantize(codes: &Tensor, scale: &Tensor, zero: &Tensor, g_idx: &Tensor) -> crate::Result<Tensor> {
    let (rows, cols) = codes.dims2()?;
    let params = GroupParams::load(scale, zero, g_idx, rows, cols)?;
    tracing::trace!("Dequantizing {}x{} over {} groups", rows, cols, params.ngroups);
    let data: Vec<Vec<u32>> = codes.to_dtype(DType::U32)?.to_vec2()?;

    let mut out = Vec::with_capacity(rows * cols);
    for (r, row) in data.iter().enumerate() {
        for (c, &code) in row.iter().enumerate() {
            let (s, z) = params.at(r, c);
            out.push(s * (code as f32 - z));
        }
    }
    Ok(Tensor::from_vec(out, (rows, cols), codes.device())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_codes_and_back() {
        let device = Device::Cpu;
        // two groups of two columns, one row
        let scale = Tensor::new(&[[0.5f32], [0.25]], &device).unwrap();
        let zero = Tensor::new(&[[8f32], [2.0]], &device).unwrap();
        let g_idx = Tensor::new(&[0u32, 0, 1, 1], &device).unwrap();
        let w = Tensor::new(&[[-1.0f32, 0.5, 0.25, -0.5]], &device).unwrap();

        let codes = weight_codes(&w, &scale, &zero, &g_idx, 15).unwrap();
        assert_eq!(codes.to_vec2::<u32>().unwrap(), vec![vec![6, 9, 3, 0]]);

        let back = dequantize(&codes, &scale, &zero, &g_idx).unwrap();
        assert_eq!(back.to_vec2::<f32>().unwrap(), w.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_bad_group_index() {
        let device = Device::Cpu;
        let scale = Tensor::ones((1, 1), DType::F32, &device).unwrap();
        let g_idx = Tensor::new(&[0u32, 1], &device).unwrap();
        let codes = Tensor::zeros((1, 2), DType::U32, &device).unwrap();
        assert!(dequantize(&codes, &scale, &scale, &g_idx).is_err());
    }
}
