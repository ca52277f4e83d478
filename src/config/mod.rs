//! Quantization configuration and per-layer override resolution.

mod dynamic;
mod quantize_config;

pub use dynamic::{DynamicOverrides, LayerConfigResolver, LayerOverrides, Resolved};
pub use quantize_config::{
    Backend, FormatKind, PackDtype, QuantMethod, QuantizeConfig, QUANT_CONFIG_FILENAME,
};
