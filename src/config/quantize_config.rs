//! Quantization run configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::dynamic::DynamicOverrides;

/// File name used when a quantized model's config is written next to its weights.
pub const QUANT_CONFIG_FILENAME: &str = "quantize_config.json";

/// Algorithm that produced the quantized weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantMethod {
    /// Hessian-aware GPTQ
    #[default]
    Gptq,
    /// GPTQ with an additional per-channel int8 scale (QQQ)
    Qqq,
}

impl QuantMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantMethod::Gptq => "gptq",
            QuantMethod::Qqq => "qqq",
        }
    }
}

/// On-disk checkpoint format of packed weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatKind {
    /// Legacy GPTQ layout: stored zero points are offset by one
    #[default]
    Gptq,
    /// GPTQ v2 layout: zero points stored as-is
    GptqV2,
    /// QQQ layout
    Qqq,
}

/// Kernel backend identifier handed to the packer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Auto,
    Torch,
    Triton,
    ExllamaV2,
    Marlin,
    Qqq,
}

/// Integer word type used to pack low-bit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackDtype {
    Int8,
    Int16,
    #[default]
    Int32,
    Int64,
}

impl PackDtype {
    /// Width of one packed word in bits
    pub fn bits(&self) -> usize {
        match self {
            PackDtype::Int8 => 8,
            PackDtype::Int16 => 16,
            PackDtype::Int32 => 32,
            PackDtype::Int64 => 64,
        }
    }
}

/// Per-run quantization configuration.
///
/// Tasks never hold a reference to this value; the processor resolves a fully
/// owned per-layer snapshot through [`super::LayerConfigResolver`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizeConfig {
    /// Bit width of quantized weights
    #[serde(default = "default_bits")]
    pub bits: u8,

    /// Columns sharing one scale/zero pair (-1 = one group per full row)
    #[serde(default = "default_group_size")]
    pub group_size: i32,

    /// Damping added to the statistics diagonal, as a fraction of its mean
    #[serde(default = "default_damp_percent")]
    pub damp_percent: f64,

    /// Step used when damping has to be raised for an ill-conditioned matrix
    #[serde(default = "default_damp_auto_increment")]
    pub damp_auto_increment: f64,

    /// Maximum number of damping increases before giving up
    #[serde(default = "default_damp_max_retries")]
    pub damp_max_retries: usize,

    /// Quantize columns in order of decreasing activation energy
    #[serde(default = "default_true")]
    pub desc_act: bool,

    /// Compute all group parameters up front instead of on the fly
    #[serde(default)]
    pub static_groups: bool,

    /// Symmetric quantization grid
    #[serde(default = "default_true")]
    pub sym: bool,

    /// Norm of the shrink search error (0 disables the search)
    #[serde(default)]
    pub mse: f32,

    /// Quantize layer sub-modules in sequential subsets
    #[serde(default = "default_true")]
    pub true_sequential: bool,

    /// Also quantize the lm_head module
    #[serde(default)]
    pub lm_head: bool,

    #[serde(default)]
    pub quant_method: QuantMethod,

    #[serde(default)]
    pub format: FormatKind,

    #[serde(default)]
    pub backend: Backend,

    #[serde(default)]
    pub pack_dtype: PackDtype,

    #[serde(default = "default_true")]
    pub parallel_packing: bool,

    /// Subsets with at least this many modules buffer forward inputs on host
    #[serde(default = "default_buffered_fwd_threshold")]
    pub buffered_fwd_threshold: usize,

    /// Ordered per-layer override table keyed by layer name pattern
    #[serde(default, skip_serializing_if = "DynamicOverrides::is_empty")]
    pub dynamic: DynamicOverrides,
}

fn default_bits() -> u8 {
    4
}

fn default_group_size() -> i32 {
    128
}

fn default_damp_percent() -> f64 {
    0.01
}

fn default_damp_auto_increment() -> f64 {
    0.0015
}

fn default_damp_max_retries() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_buffered_fwd_threshold() -> usize {
    256
}

impl Default for QuantizeConfig {
    fn default() -> Self {
        Self {
            bits: default_bits(),
            group_size: default_group_size(),
            damp_percent: default_damp_percent(),
            damp_auto_increment: default_damp_auto_increment(),
            damp_max_retries: default_damp_max_retries(),
            desc_act: true,
            static_groups: false,
            sym: true,
            mse: 0.0,
            true_sequential: true,
            lm_head: false,
            quant_method: QuantMethod::default(),
            format: FormatKind::default(),
            backend: Backend::default(),
            pack_dtype: PackDtype::default(),
            parallel_packing: true,
            buffered_fwd_threshold: default_buffered_fwd_threshold(),
            dynamic: DynamicOverrides::default(),
        }
    }
}

impl QuantizeConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: QuantizeConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration as pretty JSON
    pub fn to_file(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check value ranges
    pub fn validate(&self) -> crate::Result<()> {
        if !matches!(self.bits, 2 | 3 | 4 | 8) {
            return Err(crate::GptqError::Config(format!(
                "bits must be one of 2, 3, 4, 8 (got {})",
                self.bits
            )));
        }
        if self.group_size != -1 && self.group_size <= 0 {
            return Err(crate::GptqError::Config(format!(
                "group_size must be -1 or positive (got {})",
                self.group_size
            )));
        }
        if !(self.damp_percent > 0.0 && self.damp_percent < 1.0) {
            return Err(crate::GptqError::Config(format!(
                "damp_percent must be between 0 and 1 (got {})",
                self.damp_percent
            )));
        }
        if self.damp_auto_increment < 0.0 {
            return Err(crate::GptqError::Config(format!(
                "damp_auto_increment must not be negative (got {})",
                self.damp_auto_increment
            )));
        }
        if self.mse < 0.0 {
            return Err(crate::GptqError::Config(format!(
                "mse must not be negative (got {})",
                self.mse
            )));
        }
        Ok(())
    }

    /// Largest code on the quantization grid
    pub fn maxq(&self) -> u32 {
        (1u32 << self.bits) - 1
    }

    /// Effective number of columns per group for a matrix with `columns` columns
    pub fn group_columns(&self, columns: usize) -> usize {
        if self.group_size == -1 {
            columns
        } else {
            self.group_size as usize
        }
    }
}
