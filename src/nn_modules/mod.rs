//! Quantizable layers and the hook-instrumented module tree.
//!
//! This module provides:
//! - `Layer`: closed set of quantizable layers (`Linear`, `Conv`, `Conv1D`)
//! - `HookedLayer`: forward-intercepting wrapper sharing the layer's weights
//! - `Module`/`Sequential`: named model tree with in-place hook installation

mod hooked;
mod layer;
mod tree;

pub use hooked::{ForwardHook, HookedLayer};
pub use layer::{Conv, Conv1D, ConvConfig, Layer, Linear, Param};
pub use tree::{join_path, Module, Sequential};
