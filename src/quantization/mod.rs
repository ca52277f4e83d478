//! GPTQ weight quantization.
//!
//! This module provides:
//! - `Quantizer`: uniform min/max grid with optional shrink search
//! - `GptqTask`: per-layer statistics accumulation and the GPTQ column sweep
//! - `weight_codes` / `dequantize`: mapping between grid values and codes
//! - `linalg`: the host Cholesky routines the sweep relies on

mod codes;
mod gptq;
pub mod linalg;
mod quantizer;

pub use codes::{dequantize, weight_codes};
pub use gptq::{GptqTask, QuantizeOutput, DEFAULT_BLOCKSIZE};
pub use quantizer::{Quantizer, QuantizerOptions, DEFAULT_GRID, DEFAULT_MAXSHRINK};
