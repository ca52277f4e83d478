//! Processor protocol driven by the module looper.

use std::fmt;

use candle_core::Tensor;
use serde::Serialize;

use super::NamedModule;
use crate::model::QuantModel;
use crate::nn_modules::ForwardHook;
use crate::utils::MemoryStats;
use crate::GptqError;

/// Ordered calibration batches
#[derive(Debug, Clone, Default)]
pub struct CalibrationDataset {
    batches: Vec<Tensor>,
}

impl CalibrationDataset {
    /// Batches are fed to the model in this order
    pub fn new(batches: Vec<Tensor>) -> Self {
        Self { batches }
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn batches(&self) -> &[Tensor] {
        &self.batches
    }
}

impl From<Vec<Tensor>> for CalibrationDataset {
    fn from(batches: Vec<Tensor>) -> Self {
        Self::new(batches)
    }
}

/// One structured per-module record of a processing pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerStat {
    pub process: String,
    pub layer: usize,
    pub module: String,
    pub loss: f64,
    pub samples: usize,
    pub damp: f64,
    /// Quantization time in seconds
    pub time: f64,
    /// Time of the forward pass that fed this module
    pub fwd_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic: Option<String>,
}

impl fmt::Display for LayerStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | layer {} | {} | loss {:.10} | samples {} | damp {:.5} | time {:.3} | fwd_time {:.3}",
            self.process, self.layer, self.module, self.loss, self.samples, self.damp, self.time, self.fwd_time
        )?;
        if let Some(dynamic) = &self.dynamic {
            write!(f, " | dynamic {}", dynamic)?;
        }
        Ok(())
    }
}

/// Optional receiver of per-run series, e.g. a dashboard.
pub trait PlotSink {
    fn report(&self, title: &str, x: &[String], y: &[f64]);
}

/// State every processor carries: calibration data, the current layer
/// inputs, run time series and the process log.
#[derive(Debug, Default)]
pub struct ProcessorState {
    calibration: CalibrationDataset,
    inputs: Vec<Tensor>,
    pub fwd_time: f64,
    pub layer_count: usize,
    pub durations: Vec<f64>,
    pub avg_losses: Vec<f64>,
    pub module_names: Vec<String>,
    pub gpu_memory: Vec<f64>,
    pub cpu_memory: Vec<f64>,
    pub log: Vec<LayerStat>,
}

impl ProcessorState {
    pub fn new(calibration: CalibrationDataset) -> Self {
        Self {
            calibration,
            ..Default::default()
        }
    }

    pub fn calibration(&self) -> &CalibrationDataset {
        &self.calibration
    }

    /// Drop calibration batches once the first layer inputs are captured
    pub fn release_calibration(&mut self) {
        self.calibration.batches.clear();
    }
}

/// One quantization-style pass over the model, driven layer by layer by the
/// [`super::ModuleLooper`].
///
/// Per module the looper calls `preprocess`, `is_skipped`,
/// `pre_process_fwd_hook`, `pre_process_streaming`, `process` and, once all
/// downstream work for the layer is done, `submodule_finalize`. `finalize`
/// runs once at the end of the pass.
pub trait LoopProcessor {
    /// Label used in logs and in the per-process log key, e.g. `gptq`
    fn name(&self) -> &'static str;

    /// Shared per-run state
    fn state(&self) -> &ProcessorState;

    fn state_mut(&mut self) -> &mut ProcessorState;

    /// Bind to the model configuration before the first layer
    fn begin(&mut self, _model: &QuantModel) -> crate::Result<()> {
        Ok(())
    }

    fn verify_calibration_dataset(&self) -> crate::Result<()> {
        if self.state().calibration.is_empty() {
            return Err(GptqError::Config(format!(
                "{} processor requires a non-empty calibration dataset",
                self.name()
            )));
        }
        Ok(())
    }

    fn set_calibration_dataset(&mut self, _dataset: CalibrationDataset) -> crate::Result<()> {
        Err(GptqError::Config(format!(
            "{} processor's calibration dataset cannot be modified",
            self.name()
        )))
    }

    /// Inputs of the layer about to be processed
    fn inputs(&self) -> &[Tensor] {
        &self.state().inputs
    }

    fn receive_layer_inputs(&mut self, inputs: Vec<Tensor>) {
        self.state_mut().inputs = inputs;
    }

    fn set_fwd_time(&mut self, secs: f64) {
        self.state_mut().fwd_time = secs;
    }

    fn collect_memory_info(&mut self, layer_index: usize) {
        let stats = MemoryStats::current();
        tracing::debug!(
            "Layer {}: gpu {:.2} GB, cpu {:.2} GB",
            layer_index,
            stats.gpu_gb(),
            stats.cpu_gb()
        );
        let state = self.state_mut();
        state.gpu_memory.push(stats.gpu_gb());
        state.cpu_memory.push(stats.cpu_gb());
    }

    /// Decide whether `module` is processed and set up its task
    fn preprocess(&mut self, module: &NamedModule, buffered_fwd: bool) -> crate::Result<()>;

    /// True when `preprocess` left no task for `module`
    fn is_skipped(&self, module: &NamedModule) -> bool;

    /// Hook feeding the module's forward passes into its task
    fn pre_process_fwd_hook(&self, module: &NamedModule) -> crate::Result<ForwardHook>;

    /// Forward passes the module's task has observed
    fn fwd_count(&self, module: &NamedModule) -> usize;

    /// Drop the task of a module that will not be processed
    fn discard(&mut self, _module: &NamedModule) {}

    /// Start moving the module's working tensors onto its target device
    fn pre_process_streaming(&mut self, module: &NamedModule) -> crate::Result<()>;

    /// Quantize `module` and write the result back into the shared weight
    fn process(&mut self, module: &mut NamedModule, auto_gc: bool) -> crate::Result<()>;

    /// Release per-module state once the layer's outputs are captured
    fn submodule_finalize(&mut self, module: &mut NamedModule) -> crate::Result<()>;

    /// Wait for outstanding transfers and attach the packed kernel to `model`
    fn finalize(&mut self, model: &mut QuantModel) -> crate::Result<()>;

    fn log(&self) -> &[LayerStat] {
        &self.state().log
    }

    fn log_plot(&self, sink: &dyn PlotSink) {
        let state = self.state();
        let layers: Vec<String> = (0..state.gpu_memory.len()).map(|i| i.to_string()).collect();
        sink.report("GPU Memory", &layers, &state.gpu_memory);
        sink.report("CPU Memory", &layers, &state.cpu_memory);
        sink.report("avg_loss", &state.module_names, &state.avg_losses);
        sink.report("quant_time", &state.module_names, &state.durations);
    }
}
