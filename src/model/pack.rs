//! Packing of quantized layers into integer word tensors.
//!
//! The reference [`GptqPacker`] stores, per layer:
//! - `qweight`: codes packed as a bitstream along the input dimension,
//!   `(ceil(columns * bits / word), rows)`
//! - `qzeros`: zero points packed along the output dimension,
//!   `(ngroups, ceil(rows * bits / word))`; the legacy `gptq` format stores
//!   `zero - 1`
//! - `scales`, `g_idx`, optional `scale_extra` and `bias` as-is
//!
//! Words are held in the narrowest candle integer dtype that fits the
//! configured pack width (`u8` for int8, `u32` for int16/int32, `i64` for
//! int64, bit pattern preserved).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use rayon::prelude::*;

use crate::config::{Backend, DynamicOverrides, FormatKind, PackDtype, QuantMethod, QuantizeConfig};
use crate::looper::QuantResult;
use crate::nn_modules::Module;
use crate::quantization::weight_codes;
use crate::GptqError;

/// File name of the packed checkpoint written by `QuantModel::save_quantized`
pub const MODEL_FILENAME: &str = "model.safetensors";

/// Run configuration handed to a packing backend
#[derive(Debug, Clone)]
pub struct PackOptions {
    pub bits: u8,
    pub group_size: i32,
    pub sym: bool,
    pub desc_act: bool,
    pub backend: Backend,
    pub format: FormatKind,
    pub quant_method: QuantMethod,
    pub lm_head: Option<String>,
    pub dynamic: DynamicOverrides,
    pub parallel_packing: bool,
    pub pack_dtype: PackDtype,
}

impl PackOptions {
    /// Snapshot of the packing-relevant fields of `config`
    pub fn from_config(config: &QuantizeConfig, lm_head: Option<&str>) -> Self {
        Self {
            bits: config.bits,
            group_size: config.group_size,
            sym: config.sym,
            desc_act: config.desc_act,
            backend: config.backend,
            format: config.format,
            quant_method: config.quant_method,
            lm_head: lm_head.map(str::to_string),
            dynamic: config.dynamic.clone(),
            parallel_packing: config.parallel_packing,
            pack_dtype: config.pack_dtype,
        }
    }
}

/// Deployable representation produced by a [`PackBackend`]
pub trait PackedKernel: fmt::Debug + Send + Sync {
    /// Full names of the layers this kernel replaces
    fn layer_names(&self) -> Vec<String>;

    /// Named tensors to persist, keyed `<layer>.<tensor>`
    fn tensors(&self) -> crate::Result<HashMap<String, Tensor>>;
}

/// Turns per-layer quantization results into a [`PackedKernel`]
pub trait PackBackend: Send + Sync {
    fn pack(
        &self,
        root: &Module,
        results: &BTreeMap<String, QuantResult>,
        options: &PackOptions,
    ) -> crate::Result<Arc<dyn PackedKernel>>;
}

/// Packed tensors of one layer
#[derive(Debug, Clone)]
pub struct PackedLayer {
    /// `(ceil(columns * bits / word), rows)` code words
    pub qweight: Tensor,
    /// `(ngroups, ceil(rows * bits / word))` zero-point words
    pub qzeros: Tensor,
    pub scales: Tensor,
    pub g_idx: Tensor,
    pub scale_extra: Option<Tensor>,
    pub bias: Option<Tensor>,
    pub bits: u8,
    pub group_size: i32,
}

/// Output of [`GptqPacker`]
#[derive(Debug, Clone)]
pub struct PackedModel {
    layers: BTreeMap<String, PackedLayer>,
    format: FormatKind,
    pack_dtype: PackDtype,
    backend: Backend,
}

impl PackedModel {
    /// Packed layers keyed by full module name
    pub fn layers(&self) -> &BTreeMap<String, PackedLayer> {
        &self.layers
    }

    pub fn layer(&self, name: &str) -> Option<&PackedLayer> {
        self.layers.get(name)
    }

    /// Checkpoint format the zero points were stored for
    pub fn format(&self) -> FormatKind {
        self.format
    }

    pub fn pack_dtype(&self) -> PackDtype {
        self.pack_dtype
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Write every packed tensor to a single safetensors file
    pub fn save_safetensors(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        candle_core::safetensors::save(&self.tensors()?, path)?;
        Ok(())
    }
}

impl PackedKernel for PackedModel {
    fn layer_names(&self) -> Vec<String> {
        self.layers.keys().cloned().collect()
    }

    fn tensors(&self) -> crate::Result<HashMap<String, Tensor>> {
        let mut tensors = HashMap::new();
        for (name, layer) in &self.layers {
            tensors.insert(format!("{name}.qweight"), layer.qweight.clone());
            tensors.insert(format!("{name}.qzeros"), layer.qzeros.clone());
            tensors.insert(format!("{name}.scales"), layer.scales.clone());
            tensors.insert(format!("{name}.g_idx"), layer.g_idx.clone());
            if let Some(extra) = &layer.scale_extra {
                tensors.insert(format!("{name}.scale_extra"), extra.clone());
            }
            if let Some(bias) = &layer.bias {
                tensors.insert(format!("{name}.bias"), bias.clone());
            }
        }
        Ok(tensors)
    }
}

/// Host-resident inputs of one layer's packing job
struct PackJob {
    name: String,
    matrix: Tensor,
    bias: Option<Tensor>,
    scale: Tensor,
    zero: Tensor,
    g_idx: Tensor,
    scale_extra: Option<Tensor>,
    bits: u8,
    group_size: i32,
}

/// Reference bitstream packer
#[derive(Debug, Clone, Copy, Default)]
pub struct GptqPacker;

impl GptqPacker {
    pub fn new() -> Self {
        Self
    }

    fn collect_job(root: &Module, name: &str, result: &QuantResult) -> crate::Result<PackJob> {
        let layer = root
            .layer(name)
            .ok_or_else(|| GptqError::ModuleNotFound(name.to_string()))?;
        let cpu = Device::Cpu;
        Ok(PackJob {
            name: name.to_string(),
            matrix: layer.weight_matrix()?.to_device(&cpu)?,
            bias: layer
                .bias()
                .map(|b| b.get().and_then(|t| Ok(t.to_device(&cpu)?)))
                .transpose()?,
            scale: result.scale.get()?.to_device(&cpu)?,
            zero: result.zero.get()?.to_device(&cpu)?,
            g_idx: result.g_idx.get()?.to_device(&cpu)?,
            scale_extra: result
                .scale_extra
                .as_ref()
                .map(|t| t.get().and_then(|t| Ok(t.to_device(&cpu)?)))
                .transpose()?,
            bits: result.bits,
            group_size: result.group_size,
        })
    }

    fn pack_job(job: PackJob, options: &PackOptions) -> crate::Result<(String, PackedLayer)> {
        let bits = job.bits as usize;
        let word = options.pack_dtype.bits();
        let maxq = (1u32 << job.bits) - 1;

        let codes: Vec<Vec<u32>> = weight_codes(&job.matrix, &job.scale, &job.zero, &job.g_idx, maxq)?.to_vec2()?;
        let (rows, cols) = job.matrix.dims2()?;
        let nwords = (cols * bits).div_ceil(word);
        let mut qweight = vec![0u64; nwords * rows];
        for (r, row) in codes.iter().enumerate() {
            let words = pack_bits(row.iter().map(|&c| u64::from(c)), bits, word, nwords);
            for (w, value) in words.into_iter().enumerate() {
                qweight[w * rows + r] = value;
            }
        }

        let zeros: Vec<Vec<f32>> = job.zero.to_vec2()?;
        let mask = (1u64 << bits) - 1;
        let zero_words = (rows * bits).div_ceil(word);
        let mut qzeros = Vec::with_capacity(zeros.len() * zero_words);
        for group in &zeros {
            let stored = group.iter().map(|&z| {
                let z = z as i64;
                let z = if options.format == FormatKind::Gptq { z - 1 } else { z };
                (z as u64) & mask
            });
            qzeros.extend(pack_bits(stored, bits, word, zero_words));
        }

        let device = job.matrix.device().clone();
        let packed = PackedLayer {
            qweight: word_tensor(qweight, (nwords, rows), options.pack_dtype, &device)?,
            qzeros: word_tensor(qzeros, (zeros.len(), zero_words), options.pack_dtype, &device)?,
            scales: job.scale,
            g_idx: job.g_idx,
            scale_extra: job.scale_extra,
            bias: job.bias,
            bits: job.bits,
            group_size: job.group_size,
        };
        tracing::debug!("Packed `{}` into {} x {} words", job.name, nwords, rows);
        Ok((job.name, packed))
    }
}

impl GptqPacker {
    /// Pack every result into a concrete [`PackedModel`]
    pub fn pack_model(
        &self,
        root: &Module,
        results: &BTreeMap<String, QuantResult>,
        options: &PackOptions,
    ) -> crate::Result<PackedModel> {
        if options.pack_dtype.bits() < 8 {
            return Err(GptqError::Pack("pack word narrower than a byte".to_string()));
        }
        let jobs = results
            .iter()
            .map(|(name, result)| Self::collect_job(root, name, result))
            .collect::<crate::Result<Vec<_>>>()?;

        let packed: Vec<(String, PackedLayer)> = if options.parallel_packing {
            jobs.into_par_iter()
                .map(|job| Self::pack_job(job, options))
                .collect::<crate::Result<_>>()?
        } else {
            jobs.into_iter()
                .map(|job| Self::pack_job(job, options))
                .collect::<crate::Result<_>>()?
        };

        tracing::info!(
            "Packed {} layers ({:?}, {:?} words, backend {:?})",
            packed.len(),
            options.format,
            options.pack_dtype,
            options.backend
        );
        Ok(PackedModel {
            layers: packed.into_iter().collect(),
            format: options.format,
            pack_dtype: options.pack_dtype,
            backend: options.backend,
        })
    }
}

impl PackBackend for GptqPacker {
    fn pack(
        &self,
        root: &Module,
        results: &BTreeMap<String, QuantResult>,
        options: &PackOptions,
    ) -> crate::Result<Arc<dyn PackedKernel>> {
        Ok(Arc::new(self.pack_model(root, results, options)?))
    }
}

/// Little-endian bitstream of `bits`-wide values into `nwords` words of
/// `word_bits` each; values may straddle word boundaries.
fn pack_bits(values: impl Iterator<Item = u64>, bits: usize, word_bits: usize, nwords: usize) -> Vec<u64> {
    let word_mask = if word_bits == 64 { u64::MAX } else { (1u64 << word_bits) - 1 };
    let mut words = vec![0u64; nwords];
    let mut pos = 0;
    for value in values {
        let idx = pos / word_bits;
        let offset = pos % word_bits;
        words[idx] |= (value << offset) & word_mask;
        if offset + bits > word_bits {
            words[idx + 1] |= value >> (word_bits - offset);
        }
        pos += bits;
    }
    words
}

fn word_tensor(words: Vec<u64>, shape: (usize, usize), dtype: PackDtype, device: &Device) -> crate::Result<Tensor> {
    let tensor = match dtype {
        PackDtype::Int8 => Tensor::from_vec(words.into_iter().map(|w| w as u8).collect::<Vec<_>>(), shape, device)?,
        PackDtype::Int16 | PackDtype::Int32 => {
            Tensor::from_vec(words.into_iter().map(|w| w as u32).collect::<Vec<_>>(), shape, device)?
        }
        PackDtype::Int64 => Tensor::from_vec(words.into_iter().map(|w| w as i64).collect::<Vec<_>>(), shape, device)?,
    };
    Ok(tensor)
}

/// Words of a packed tensor widened to `u64`
pub fn tensor_words(tensor: &Tensor) -> crate::Result<Vec<u64>> {
    let flat = tensor.flatten_all()?;
    let words = match tensor.dtype() {
        DType::U8 => flat.to_vec1::<u8>()?.into_iter().map(u64::from).collect(),
        DType::U32 => flat.to_vec1::<u32>()?.into_iter().map(u64::from).collect(),
        DType::I64 => flat.to_vec1::<i64>()?.into_iter().map(|w| w as u64).collect(),
        other => {
            return Err(GptqError::Pack(format!("{:?} is not a packed word dtype", other)));
        }
    };
    Ok(words)
}

/// Inverse of the packing bitstream: the first `count` values
pub fn unpack_bits(words: &[u64], bits: usize, word_bits: usize, count: usize) -> Vec<u64> {
    let mask = (1u64 << bits) - 1;
    (0..count)
        .map(|i| {
            let pos = i * bits;
            let idx = pos / word_bits;
            let offset = pos % word_bits;
            let mut value = words[idx] >> offset;
            if offset + bits > word_bits {
                value |= words[idx + 1] << (word_bits - offset);
            }
            value & mask
        })
        .collect()
}
