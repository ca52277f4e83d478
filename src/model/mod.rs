//! Model container and packing backends.
//!
//! This module provides:
//! - [`QuantModel`]: module tree, decoder-layer layout and quantization state
//! - [`PackBackend`] / [`PackedKernel`]: the seam between quantization results
//!   and a deployable representation
//! - [`GptqPacker`]: reference bitstream packer

mod base;
mod pack;

pub use base::QuantModel;
pub use pack::{
    tensor_words, unpack_bits, GptqPacker, PackBackend, PackOptions, PackedKernel, PackedLayer,
    PackedModel, MODEL_FILENAME,
};
