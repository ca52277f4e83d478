//! # rs-gptqmodel
//!
//! Post-training weight quantization (GPTQ and QQQ) for candle module trees.
//!
//! ## Core Concept
//!
//! Quantization runs one decoder layer at a time:
//! - **Hook capture**: quantizable layers are wrapped in place so every forward
//!   pass feeds the layer's inputs into a per-layer statistics accumulator
//! - **Column sweep**: each layer's weight is quantized column by column with
//!   error compensation driven by the accumulated input statistics
//! - **Write-back**: the dequantized weight replaces the original before the
//!   layer's outputs become the next layer's inputs
//! - **Packing**: integer codes, scales and zero points are packed into a
//!   deployable kernel and saved as safetensors
//!
//! ## Example
//!
//! ```ignore
//! use rs_gptqmodel::{CalibrationDataset, GptqProcessor, LoopOptions, ModuleLooper, QuantModel, QuantizeConfig};
//!
//! fn main() -> rs_gptqmodel::Result<()> {
//!     let mut model = QuantModel::new(root, "model.layers", subsets, QuantizeConfig::default())?
//!         .with_base_modules(vec!["model.embed_tokens".to_string()]);
//!     let processor = GptqProcessor::new(CalibrationDataset::new(batches));
//!     let mut looper = ModuleLooper::new(vec![Box::new(processor)], LoopOptions::default());
//!     looper.run(&mut model)?;
//!     model.save_quantized("out")?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod looper;
pub mod model;
pub mod nn_modules;
pub mod quantization;
pub mod utils;

// Re-exports for convenience
pub use config::{DynamicOverrides, LayerOverrides, QuantMethod, QuantizeConfig};
pub use looper::{CalibrationDataset, GptqProcessor, LayerStat, LoopOptions, LoopProcessor, ModuleLooper};
pub use model::{GptqPacker, PackBackend, PackedKernel, QuantModel};
pub use nn_modules::{HookedLayer, Layer, Module, Sequential};
pub use quantization::{GptqTask, QuantizeOutput};

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum GptqError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Numerical instability in `{layer}`: no positive definite factorization after {retries} damping retries (damp_percent {damp_percent})")]
    NumericalInstability {
        layer: String,
        damp_percent: f64,
        retries: usize,
    },

    #[error("Quantization loss is not finite for `{0}`")]
    NanLoss(String),

    #[error("Unsupported layer: {0}")]
    UnsupportedLayer(String),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Packing error: {0}")]
    Pack(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    CandleError(#[from] candle_core::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid layer pattern: {0}")]
    RegexError(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, GptqError>;
