//! Per-layer GPTQ task.
//!
//! A [`GptqTask`] accumulates the second-moment matrix `H = 2/n * sum(x x^T)`
//! of one layer's inputs during calibration, then runs the GPTQ column sweep:
//! every column is rounded onto the quantization grid and the rounding error is
//! propagated into the not yet quantized columns through the upper Cholesky
//! factor of `H^-1`.

use std::cmp::Ordering;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};

use super::linalg;
use super::quantizer::{Quantizer, QuantizerOptions};
use crate::config::{QuantMethod, QuantizeConfig};
use crate::nn_modules::Layer;
use crate::utils::StreamedTensor;
use crate::GptqError;

/// Columns processed per lazy-update block
pub const DEFAULT_BLOCKSIZE: usize = 128;

/// Result of quantizing one layer
#[derive(Debug, Clone)]
pub struct QuantizeOutput {
    /// Quantized weight, same shape and dtype as the layer weight
    pub weight: Tensor,
    /// `(ngroups, rows)` F32
    pub scale: Tensor,
    /// `(ngroups, rows)` F32
    pub zero: Tensor,
    /// `(columns,)` U32 group of every weight column
    pub g_idx: Tensor,
    /// `(1, rows)` F32 second-level channel scale (QQQ only)
    pub scale_extra: Option<Tensor>,
    /// Wall time in seconds
    pub duration: f64,
    /// Hessian-weighted reconstruction loss per sample
    pub avg_loss: f64,
    /// Damping actually applied
    pub damp_percent: f64,
    pub nsamples: usize,
}

/// Statistics and quantization state for one layer.
///
/// One task, one [`GptqTask::quantize`] call: the statistics matrix is
/// consumed by the first call and a second call returns an error.
pub struct GptqTask {
    name: String,
    layer: Layer,
    config: QuantizeConfig,
    rows: usize,
    columns: usize,
    hessian: Option<StreamedTensor>,
    nsamples: usize,
    fwd_counter: usize,
    fwd_inputs_buffered: bool,
    buffered_inputs: Vec<Tensor>,
    quantizer: Quantizer,
    blocksize: usize,
    consumed: bool,
}

impl GptqTask {
    /// Create a task for `layer` with an owned configuration snapshot
    pub fn new(name: impl Into<String>, layer: Layer, config: QuantizeConfig) -> crate::Result<Self> {
        layer.check_quantizable()?;
        config.validate()?;
        let (rows, columns) = layer.matrix_shape();
        let quantizer = Quantizer::new(config.bits, config.sym, config.mse);
        Ok(Self {
            name: name.into(),
            layer,
            config,
            rows,
            columns,
            hessian: None,
            nsamples: 0,
            fwd_counter: 0,
            fwd_inputs_buffered: false,
            buffered_inputs: Vec::new(),
            quantizer,
            blocksize: DEFAULT_BLOCKSIZE,
            consumed: false,
        })
    }

    /// Full dotted name of the layer, used in logs and errors
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The wrapped layer; its weight handle is shared with the model tree
    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    /// Resolved configuration this task quantizes with
    pub fn config(&self) -> &QuantizeConfig {
        &self.config
    }

    /// `(rows, columns)` of the quantized matrix
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.columns)
    }

    /// Calibration samples folded into the statistics so far
    pub fn nsamples(&self) -> usize {
        self.nsamples
    }

    /// Number of forward passes observed, buffered or not
    pub fn fwd_counter(&self) -> usize {
        self.fwd_counter
    }

    /// Statistics matrix handle, if any batch has been accumulated
    pub fn statistics(&self) -> Option<&StreamedTensor> {
        self.hessian.as_ref()
    }

    /// Whether forward inputs are parked on the host until `quantize`
    pub fn fwd_inputs_buffered(&self) -> bool {
        self.fwd_inputs_buffered
    }

    /// Keep forward inputs on the host and fold them into the statistics only
    /// when [`GptqTask::quantize`] runs
    pub fn set_fwd_inputs_buffered(&mut self, buffered: bool) {
        self.fwd_inputs_buffered = buffered;
    }

    /// Columns per lazy-update block, at least one
    pub fn set_blocksize(&mut self, blocksize: usize) {
        self.blocksize = blocksize.max(1);
    }

    /// Apply quantizer search options. Only valid before the first batch.
    pub fn configure(&mut self, options: QuantizerOptions) -> crate::Result<()> {
        if self.fwd_counter > 0 || self.nsamples > 0 {
            return Err(GptqError::Config(format!(
                "cannot configure `{}` after {} batches were accumulated",
                self.name, self.fwd_counter
            )));
        }
        self.quantizer.configure(options);
        Ok(())
    }

    /// Feed one intercepted forward pass
    pub fn add_batch(&mut self, input: &Tensor, _output: &Tensor) -> crate::Result<()> {
        self.fwd_counter += 1;
        if self.fwd_inputs_buffered {
            self.buffered_inputs.push(input.to_device(&Device::Cpu)?);
            Ok(())
        } else {
            self.process_batch(input)
        }
    }

    fn process_batch(&mut self, input: &Tensor) -> crate::Result<()> {
        let (samples, cols) = self.layer.input_columns(input)?;
        if samples == 0 {
            return Ok(());
        }
        if cols.dim(0)? != self.columns {
            return Err(GptqError::Config(format!(
                "input of `{}` has {} features, expected {}",
                self.name,
                cols.dim(0)?,
                self.columns
            )));
        }

        let h = match &self.hessian {
            Some(h) => h.get()?,
            None => Tensor::zeros((self.columns, self.columns), DType::F32, cols.device())?,
        };
        let cols = cols.to_device(h.device())?;

        let total = self.nsamples + samples;
        let decay = self.nsamples as f64 / total as f64;
        let update = cols.matmul(&cols.t()?)?.affine(2.0 / total as f64, 0.0)?;
        let h = (h.affine(decay, 0.0)? + update)?;
        self.nsamples = total;

        match &self.hessian {
            Some(slot) => slot.set(h)?,
            None => self.hessian = Some(StreamedTensor::new(h)),
        }
        Ok(())
    }

    /// Smallest damping in the configured escalation that makes `h`
    /// positive definite, with the upper Cholesky factor of the damped inverse
    fn damped_inverse(&self, h: &[f64]) -> crate::Result<(Vec<f32>, f64)> {
        let n = self.columns;
        let mean_diag = (0..n).map(|i| h[i * n + i]).sum::<f64>() / n as f64;
        let increment = self.config.damp_auto_increment;

        let mut damp_percent = self.config.damp_percent;
        let mut retries = 0;
        while damp_percent > 0.0 && damp_percent < 1.0 {
            let mut damped = h.to_vec();
            let damp = damp_percent * mean_diag;
            for i in 0..n {
                damped[i * n + i] += damp;
            }

            if let Some(upper) = linalg::inverse_upper_cholesky(&damped, n) {
                return Ok((upper.into_iter().map(|x| x as f32).collect(), damp_percent));
            }
            if increment == 0.0 || retries >= self.config.damp_max_retries {
                break;
            }
            tracing::warn!(
                "Quantization: `damp_percent = {:.5}` is too low for `{}`, auto-incrementing by `{:.5}`",
                damp_percent,
                self.name,
                increment
            );
            damp_percent += increment;
            retries += 1;
        }

        Err(GptqError::NumericalInstability {
            layer: self.name.clone(),
            damp_percent,
            retries,
        })
    }

    /// Quantize the layer weight against the accumulated statistics.
    ///
    /// The layer weight itself is left untouched; the caller decides where
    /// the returned weight is written.
    pub fn quantize(&mut self) -> crate::Result<QuantizeOutput> {
        let start = Instant::now();
        if self.consumed {
            return Err(GptqError::Config(format!(
                "statistics of `{}` were already consumed by an earlier quantize",
                self.name
            )));
        }

        let original = self.layer.weight().get()?;
        let device = original.device().clone();
        for input in std::mem::take(&mut self.buffered_inputs) {
            let input = input.to_device(&device)?;
            self.process_batch(&input)?;
        }

        let hessian = match self.hessian.take() {
            Some(h) if self.nsamples > 0 => h.get()?,
            _ => {
                return Err(GptqError::Config(format!(
                    "no calibration samples reached `{}`",
                    self.name
                )))
            }
        };
        self.consumed = true;

        let (rows, n) = (self.rows, self.columns);
        let mut w: Vec<f32> = self.layer.weight_matrix()?.flatten_all()?.to_vec1()?;
        let mut h: Vec<f64> = hessian.to_dtype(DType::F64)?.flatten_all()?.to_vec1()?;
        drop(hessian);

        self.quantizer.find_params(&w, rows, n, 0, n);

        // dead inputs never fire; pin them so H stays invertible
        for i in 0..n {
            if h[i * n + i] == 0.0 {
                h[i * n + i] = 1.0;
                for r in 0..rows {
                    w[r * n + i] = 0.0;
                }
            }
        }

        let grouped = self.config.group_size != -1;
        let static_groups = self.config.static_groups && grouped;
        let group_size = self.config.group_columns(n);
        let mut scales: Vec<Vec<f32>> = Vec::new();
        let mut zeros: Vec<Vec<f32>> = Vec::new();

        let mut fixed_groups = Vec::new();
        if static_groups {
            for g in (0..n).step_by(group_size) {
                let mut q = self.quantizer.clone();
                q.find_params(&w, rows, n, g, g + group_size);
                scales.push(q.scale().to_vec());
                zeros.push(q.zero().to_vec());
                fixed_groups.push(q);
            }
        }

        let perm = if self.config.desc_act {
            let mut perm: Vec<usize> = (0..n).collect();
            perm.sort_by(|&a, &b| {
                h[b * n + b]
                    .partial_cmp(&h[a * n + a])
                    .unwrap_or(Ordering::Equal)
            });
            w = permute_columns(&w, rows, n, &perm);
            h = (0..n * n)
                .map(|idx| h[perm[idx / n] * n + perm[idx % n]])
                .collect();
            Some(perm)
        } else {
            None
        };

        let (hinv, damp_percent) = self.damped_inverse(&h)?;
        drop(h);

        let mut q = vec![0f32; rows * n];
        let mut loss_sum = 0f64;
        let mut now_idx = 1usize;

        for i1 in (0..n).step_by(self.blocksize) {
            let i2 = (i1 + self.blocksize).min(n);
            let count = i2 - i1;

            let mut w1: Vec<f32> = (0..rows)
                .flat_map(|r| w[r * n + i1..r * n + i2].iter().copied())
                .collect();
            let mut err1 = vec![0f32; rows * count];

            for i in 0..count {
                let col = i1 + i;
                let d = hinv[col * n + col];

                if grouped && !static_groups {
                    if col % group_size == 0 {
                        self.quantizer.find_params(&w, rows, n, col, col + group_size);
                    }
                    if col / group_size + 1 == now_idx {
                        scales.push(self.quantizer.scale().to_vec());
                        zeros.push(self.quantizer.zero().to_vec());
                        now_idx += 1;
                    }
                }
                let quantizer = if static_groups {
                    let idx = perm.as_ref().map_or(col, |p| p[col]);
                    &fixed_groups[idx / group_size]
                } else {
                    &self.quantizer
                };

                let hinv_row = &hinv[col * n + i1..col * n + i2];
                for r in 0..rows {
                    let row = &mut w1[r * count..(r + 1) * count];
                    let wv = row[i];
                    let qv = quantizer.quantize(wv, r);
                    q[r * n + col] = qv;
                    loss_sum += f64::from((wv - qv) * (wv - qv) / (d * d)) / 2.0;

                    let e = (wv - qv) / d;
                    err1[r * count + i] = e;
                    for j in i..count {
                        row[j] -= e * hinv_row[j];
                    }
                }
            }

            // push the block error into the remaining columns
            for r in 0..rows {
                let err_row = &err1[r * count..(r + 1) * count];
                for j in i2..n {
                    let mut acc = 0f32;
                    for (k, e) in err_row.iter().enumerate() {
                        acc += e * hinv[(i1 + k) * n + j];
                    }
                    w[r * n + j] -= acc;
                }
            }
        }

        let avg_loss = loss_sum / self.nsamples as f64;
        if !avg_loss.is_finite() {
            return Err(GptqError::NanLoss(self.name.clone()));
        }

        let mut g_idx: Vec<u32> = (0..n)
            .map(|i| match (&perm, static_groups) {
                (Some(p), true) => (p[i] / group_size) as u32,
                _ => (i / group_size) as u32,
            })
            .collect();
        if let Some(perm) = &perm {
            let mut invperm = vec![0usize; n];
            for (i, &p) in perm.iter().enumerate() {
                invperm[p] = i;
            }
            q = permute_columns(&q, rows, n, &invperm);
            g_idx = invperm.iter().map(|&i| g_idx[i]).collect();
        }

        if scales.is_empty() {
            scales.push(self.quantizer.scale().to_vec());
            zeros.push(self.quantizer.zero().to_vec());
        }
        let ngroups = scales.len();

        let scale_extra = if self.config.quant_method == QuantMethod::Qqq && grouped {
            let extra: Vec<f32> = (0..rows)
                .map(|r| {
                    q[r * n..(r + 1) * n]
                        .iter()
                        .fold(0f32, |m, v| m.max(v.abs()))
                        / 127.0
                })
                .collect();
            Some(Tensor::from_vec(extra, (1, rows), &device)?)
        } else {
            None
        };

        let q_matrix = Tensor::from_vec(q, (rows, n), &device)?;
        let weight = self.layer.matrix_to_weight(&q_matrix, &original)?;

        Ok(QuantizeOutput {
            weight,
            scale: Tensor::from_vec(scales.concat(), (ngroups, rows), &device)?,
            zero: Tensor::from_vec(zeros.concat(), (ngroups, rows), &device)?,
            g_idx: Tensor::from_vec(g_idx, n, &device)?,
            scale_extra,
            duration: start.elapsed().as_secs_f64(),
            avg_loss,
            damp_percent,
            nsamples: self.nsamples,
        })
    }
}

impl std::fmt::Debug for GptqTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GptqTask")
            .field("name", &self.name)
            .field("shape", &(self.rows, self.columns))
            .field("nsamples", &self.nsamples)
            .field("fwd_counter", &self.fwd_counter)
            .field("buffered", &self.fwd_inputs_buffered)
            .finish()
    }
}

/// `out[:, j] = m[:, order[j]]` for a row-major `rows x n` matrix
fn permute_columns(m: &[f32], rows: usize, n: usize, order: &[usize]) -> Vec<f32> {
    let mut out = vec![0f32; rows * n];
    for r in 0..rows {
        for (j, &src) in order.iter().enumerate() {
            out[r * n + j] = m[r * n + src];
        }
    }
    out
}
