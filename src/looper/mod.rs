//! Layer-by-layer quantization loop.
//!
//! This module provides:
//! - `ModuleLooper`: drives processors over decoder layers with hook capture
//! - `LoopProcessor`: the per-module processing protocol
//! - `GptqProcessor`: GPTQ/QQQ implementation of that protocol
//! - `NamedModule`: a layer bound to its name, device and transfer stream

mod gptq_processor;
mod module_looper;
mod named_module;
mod processor;

pub use gptq_processor::{GptqProcessor, QuantResult};
pub use module_looper::{LoopOptions, ModuleLooper};
pub use named_module::NamedModule;
pub use processor::{CalibrationDataset, LayerStat, LoopProcessor, PlotSink, ProcessorState};
