//! Uniform grid quantizer with optional shrink search.

/// Default number of shrink candidates considered by the search
pub const DEFAULT_GRID: usize = 100;
/// Default largest fraction of the range the search may shrink away
pub const DEFAULT_MAXSHRINK: f32 = 0.8;

/// Search options applied through [`Quantizer::configure`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantizerOptions {
    /// One scale/zero pair per row instead of one for the whole matrix
    pub perchannel: bool,
    pub grid: usize,
    pub maxshrink: f32,
}

impl Default for QuantizerOptions {
    fn default() -> Self {
        Self {
            perchannel: true,
            grid: DEFAULT_GRID,
            maxshrink: DEFAULT_MAXSHRINK,
        }
    }
}

/// Per-row asymmetric or symmetric uniform quantizer.
///
/// Values map to `scale * (clamp(round(x / scale) + zero, 0, maxq) - zero)`,
/// with ties rounded to even.
#[derive(Debug, Clone)]
pub struct Quantizer {
    maxq: f32,
    sym: bool,
    /// Error norm of the shrink search, 0 disables it
    norm: f32,
    options: QuantizerOptions,
    scale: Vec<f32>,
    zero: Vec<f32>,
}

impl Quantizer {
    pub fn new(bits: u8, sym: bool, mse: f32) -> Self {
        Self {
            maxq: ((1u32 << bits) - 1) as f32,
            sym,
            norm: mse,
            options: QuantizerOptions::default(),
            scale: Vec::new(),
            zero: Vec::new(),
        }
    }

    pub fn configure(&mut self, options: QuantizerOptions) {
        self.options = options;
    }

    /// Search options in effect
    pub fn options(&self) -> &QuantizerOptions {
        &self.options
    }

    /// Largest code, `2^bits - 1`
    pub fn maxq(&self) -> f32 {
        self.maxq
    }

    /// True once `find_params` produced a usable nonzero scale for every row
    pub fn ready(&self) -> bool {
        !self.scale.is_empty() && self.scale.iter().all(|s| *s != 0.0)
    }

    pub fn scale(&self) -> &[f32] {
        &self.scale
    }

    pub fn zero(&self) -> &[f32] {
        &self.zero
    }

    /// Fit scale/zero to columns `start..end` of a row-major `rows x width`
    /// matrix. The range is clipped to the matrix width.
    pub fn find_params(&mut self, w: &[f32], rows: usize, width: usize, start: usize, end: usize) {
        let end = end.min(width);
        let row_slice = |r: usize| &w[r * width + start..r * width + end];

        let (mut xmin, mut xmax): (Vec<f32>, Vec<f32>) = if self.options.perchannel {
            (0..rows)
                .map(|r| {
                    row_slice(r)
                        .iter()
                        .fold((0f32, 0f32), |(lo, hi), &x| (lo.min(x), hi.max(x)))
                })
                .unzip()
        } else {
            let (lo, hi) = (0..rows)
                .flat_map(row_slice)
                .fold((0f32, 0f32), |(lo, hi), &x| (lo.min(x), hi.max(x)));
            (vec![lo], vec![hi])
        };

        for (lo, hi) in xmin.iter_mut().zip(xmax.iter_mut()) {
            if self.sym {
                *hi = lo.abs().max(*hi);
                if *lo < 0.0 {
                    *lo = -*hi;
                }
            }
            if *lo == 0.0 && *hi == 0.0 {
                *lo = -1.0;
                *hi = 1.0;
            }
        }

        let sym_zero = (self.maxq + 1.0) / 2.0;
        let mut scale: Vec<f32> = xmin
            .iter()
            .zip(xmax.iter())
            .map(|(lo, hi)| (hi - lo) / self.maxq)
            .collect();
        let mut zero: Vec<f32> = if self.sym {
            vec![sym_zero; scale.len()]
        } else {
            xmin.iter()
                .zip(scale.iter())
                .map(|(lo, s)| (-lo / s).round_ties_even())
                .collect()
        };

        if self.norm > 0.0 {
            let steps = (self.options.maxshrink * self.options.grid as f32) as usize;
            for (k, (s, z)) in scale.iter_mut().zip(zero.iter_mut()).enumerate() {
                let values: Vec<f32> = if self.options.perchannel {
                    row_slice(k).to_vec()
                } else {
                    (0..rows).flat_map(row_slice).copied().collect()
                };
                let mut best = f32::INFINITY;
                for i in 0..steps {
                    let p = 1.0 - i as f32 / self.options.grid as f32;
                    let lo = p * xmin[k];
                    let hi = p * xmax[k];
                    let s1 = (hi - lo) / self.maxq;
                    let z1 = if self.sym { *z } else { (-lo / s1).round_ties_even() };
                    let err: f32 = values
                        .iter()
                        .map(|&x| (quantize_one(x, s1, z1, self.maxq) - x).abs().powf(self.norm))
                        .sum();
                    if err < best {
                        best = err;
                        *s = s1;
                        *z = z1;
                    }
                }
            }
        }

        if !self.options.perchannel {
            scale = vec![scale[0]; rows];
            zero = vec![zero[0]; rows];
        }

        self.scale = scale;
        self.zero = zero;
    }

    /// Integer grid code of `x` for `row`
    pub fn code(&self, x: f32, row: usize) -> f32 {
        code_one(x, self.scale[row], self.zero[row], self.maxq)
    }

    /// Grid value nearest to `x` for `row`
    pub fn quantize(&self, x: f32, row: usize) -> f32 {
        quantize_one(x, self.scale[row], self.zero[row], self.maxq)
    }
}

fn code_one(x: f32, scale: f32, zero: f32, maxq: f32) -> f32 {
    ((x / scale).round_ties_even() + zero).clamp(0.0, maxq)
}

fn quantize_one(x: f32, scale: f32, zero: f32, maxq: f32) -> f32 {
    scale * (code_one(x, scale, zero, maxq) - zero)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_params() {
        let w = [-1.0f32, 0.5, 2.0, 0.25, -0.5, 1.0];
        let mut q = Quantizer::new(4, true, 0.0);
        q.find_params(&w, 2, 3, 0, 3);

        assert_eq!(q.zero(), &[8.0, 8.0]);
        assert!((q.scale()[0] - 4.0 / 15.0).abs() < 1e-6);
        assert!((q.scale()[1] - 2.0 / 15.0).abs() < 1e-6);
        assert!(q.ready());
    }

    #[test]
    fn test_asymmetric_grid_is_idempotent() {
        let w = [0.1f32, 0.7, -0.3, 1.9];
        let mut q = Quantizer::new(3, false, 0.0);
        q.find_params(&w, 1, 4, 0, 4);

        for &x in &w {
            let once = q.quantize(x, 0);
            assert_eq!(q.quantize(once, 0), once);
            let code = q.code(x, 0);
            assert!((0.0..=7.0).contains(&code));
            assert_eq!(code, code.round());
        }
    }

    #[test]
    fn test_all_zero_rows_get_unit_range() {
        let w = [0f32; 4];
        let mut q = Quantizer::new(4, false, 0.0);
        q.find_params(&w, 2, 2, 0, 2);
        assert!((q.scale()[0] - 2.0 / 15.0).abs() < 1e-6);
        assert_eq!(q.quantize(0.0, 1), 0.0);
    }

    #[test]
    fn test_mse_search_never_worse() {
        let w: Vec<f32> = (0..32).map(|i| ((i * 37 % 17) as f32 - 8.0) / 3.0).collect();
        let w = [w.clone(), vec![12.0]].concat();

        let err = |q: &Quantizer| -> f32 {
            w.iter().map(|&x| (q.quantize(x, 0) - x).powi(2)).sum()
        };

        let mut plain = Quantizer::new(4, true, 0.0);
        plain.find_params(&w, 1, w.len(), 0, w.len());
        let mut searched = Quantizer::new(4, true, 2.0);
        searched.find_params(&w, 1, w.len(), 0, w.len());

        assert!(err(&searched) <= err(&plain) + 1e-4);
    }

    #[test]
    fn test_per_tensor_mode_shares_params() {
        let w = [1.0f32, -4.0, 0.5, 2.0];
        let mut q = Quantizer::new(4, true, 0.0);
        q.configure(QuantizerOptions {
            perchannel: false,
            ..Default::default()
        });
        assert!(!q.options().perchannel);
        assert_eq!(q.options().grid, DEFAULT_GRID);
        q.find_params(&w, 2, 2, 0, 2);
        assert_eq!(q.scale()[0], q.scale()[1]);
    }

    #[test]
    fn test_ties_round_to_even() {
        let mut q = Quantizer::new(4, true, 0.0);
        q.scale = vec![1.0];
        q.zero = vec![8.0];

        assert_eq!(q.code(2.5, 0), 10.0);
        assert_eq!(q.code(3.5, 0), 12.0);
        assert_eq!(q.code(-0.5, 0), 8.0);
        assert_eq!(q.code(-1.5, 0), 6.0);
        assert_eq!(q.quantize(2.5, 0), 2.0);
        // out of range still clamps
        assert_eq!(q.code(100.0, 0), 15.0);
    }
}
