//! GPTQ / QQQ layer processor.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use parking_lot::Mutex;

use super::processor::{CalibrationDataset, LayerStat, LoopProcessor, ProcessorState};
use super::NamedModule;
use crate::config::{LayerConfigResolver, QuantMethod, Resolved};
use crate::model::{GptqPacker, PackBackend, PackOptions, QuantModel};
use crate::nn_modules::{ForwardHook, Layer};
use crate::quantization::{GptqTask, QuantizerOptions};
use crate::utils::{clean_memory, diff_dtype, DeviceStream, StreamedTensor};
use crate::GptqError;

/// Quantization parameters of one layer, resident on the host.
///
/// Tensors may still be in flight to the host when stored; readers resolve
/// them through [`StreamedTensor::get`].
#[derive(Debug, Clone)]
pub struct QuantResult {
    /// `(ngroups, rows)`
    pub scale: StreamedTensor,
    /// `(ngroups, rows)`
    pub zero: StreamedTensor,
    /// `(columns,)`
    pub g_idx: StreamedTensor,
    pub scale_extra: Option<StreamedTensor>,
    pub bits: u8,
    pub group_size: i32,
    pub sym: bool,
    pub desc_act: bool,
    pub duration: f64,
    pub avg_loss: f64,
    pub damp_percent: f64,
    pub nsamples: usize,
}

impl QuantResult {
    /// Block until every tensor has reached the host
    pub fn wait(&self) -> crate::Result<()> {
        self.scale.wait()?;
        self.zero.wait()?;
        self.g_idx.wait()?;
        if let Some(extra) = &self.scale_extra {
            extra.wait()?;
        }
        Ok(())
    }
}

/// Drives [`GptqTask`]s for every non-skipped module and packs the model at
/// the end of the pass.
pub struct GptqProcessor {
    state: ProcessorState,
    resolver: Option<LayerConfigResolver>,
    tasks: HashMap<String, Arc<Mutex<GptqTask>>>,
    results: BTreeMap<String, QuantResult>,
    streams: Vec<Arc<DeviceStream>>,
    packer: Arc<dyn PackBackend>,
    calculate_w_wq_diff: bool,
}

impl GptqProcessor {
    pub fn new(calibration: CalibrationDataset) -> Self {
        Self {
            state: ProcessorState::new(calibration),
            resolver: None,
            tasks: HashMap::new(),
            results: BTreeMap::new(),
            streams: Vec::new(),
            packer: Arc::new(GptqPacker::new()),
            calculate_w_wq_diff: false,
        }
    }

    /// Use a different packing backend in `finalize`
    pub fn with_packer(mut self, packer: Arc<dyn PackBackend>) -> Self {
        self.packer = packer;
        self
    }

    /// Keep `original - quantized` in each module's state as `w_wq_diff`
    pub fn with_w_wq_diff(mut self, enabled: bool) -> Self {
        self.calculate_w_wq_diff = enabled;
        self
    }

    /// Results collected so far, keyed by full module name
    pub fn results(&self) -> &BTreeMap<String, QuantResult> {
        &self.results
    }

    /// Whether `full_name` has a live task that has not been processed yet
    pub fn has_task(&self, full_name: &str) -> bool {
        self.tasks.contains_key(full_name)
    }

    fn resolver(&self) -> crate::Result<&LayerConfigResolver> {
        self.resolver.as_ref().ok_or_else(|| {
            GptqError::Config("processor used before being bound to a model".to_string())
        })
    }

    fn method(&self) -> QuantMethod {
        self.resolver
            .as_ref()
            .map(|r| r.base().quant_method)
            .unwrap_or_default()
    }

    /// Keep `stream` for the final barrier while it has work in flight.
    /// Streams already synchronized by the looper are dropped here.
    fn track_stream(&mut self, stream: &Arc<DeviceStream>) {
        self.streams.retain(|s| s.pending() > 0);
        if stream.pending() > 0 && !self.streams.iter().any(|s| Arc::ptr_eq(s, stream)) {
            self.streams.push(stream.clone());
        }
    }

    fn record_w_wq_diff(module: &mut NamedModule, original: &Tensor, quantized: &Tensor) -> crate::Result<()> {
        let dtype = diff_dtype(original.dtype(), quantized.dtype());
        let diff = (original.to_dtype(dtype)? - quantized.to_dtype(dtype)?.to_device(original.device())?)?;
        module.state.insert("w_wq_diff".to_string(), diff);
        Ok(())
    }
}

fn to_host(tensor: Tensor, stream: &DeviceStream) -> crate::Result<StreamedTensor> {
    let streamed = StreamedTensor::new(tensor);
    streamed.move_to(&Device::Cpu, Some(stream))?;
    Ok(streamed)
}

impl LoopProcessor for GptqProcessor {
    fn name(&self) -> &'static str {
        self.method().as_str()
    }

    fn state(&self) -> &ProcessorState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProcessorState {
        &mut self.state
    }

    fn begin(&mut self, model: &QuantModel) -> crate::Result<()> {
        self.resolver = Some(LayerConfigResolver::new(model.quantize_config())?);
        self.state.layer_count = model.num_layers()?;
        Ok(())
    }

    fn preprocess(&mut self, module: &NamedModule, buffered_fwd: bool) -> crate::Result<()> {
        let config = match self.resolver()?.resolve(&module.full_name) {
            Resolved::Skip => {
                tracing::debug!("Skipping `{}` by dynamic override", module.full_name);
                return Ok(());
            }
            Resolved::Quantize(config) => *config,
        };

        let mut task = GptqTask::new(module.full_name.clone(), module.layer().clone(), config)?;
        // very wide layers keep every sibling's inputs alive; park them on the host
        if buffered_fwd {
            tracing::info!("Quantize: Enabling fwd buffered mode for: `{}`", module.name);
            task.set_fwd_inputs_buffered(true);
        }
        task.configure(QuantizerOptions {
            perchannel: true,
            ..Default::default()
        })?;

        self.tasks
            .insert(module.full_name.clone(), Arc::new(Mutex::new(task)));
        Ok(())
    }

    fn is_skipped(&self, module: &NamedModule) -> bool {
        !self.tasks.contains_key(&module.full_name)
    }

    fn pre_process_fwd_hook(&self, module: &NamedModule) -> crate::Result<ForwardHook> {
        let task = self.tasks.get(&module.full_name).cloned().ok_or_else(|| {
            GptqError::Config(format!("no quantization task for `{}`", module.full_name))
        })?;
        let name = module.full_name.clone();
        Ok(Arc::new(move |_: &Layer, inputs: &[Tensor], output: &Tensor| -> crate::Result<()> {
            let input = inputs.first().ok_or_else(|| {
                GptqError::Config(format!("forward of `{}` had no input", name))
            })?;
            task.lock().add_batch(input, output)
        }))
    }

    fn fwd_count(&self, module: &NamedModule) -> usize {
        self.tasks
            .get(&module.full_name)
            .map_or(0, |task| task.lock().fwd_counter())
    }

    fn discard(&mut self, module: &NamedModule) {
        self.tasks.remove(&module.full_name);
    }

    fn pre_process_streaming(&mut self, module: &NamedModule) -> crate::Result<()> {
        let Some(task) = self.tasks.get(&module.full_name) else {
            return Ok(());
        };
        if let Some(statistics) = task.lock().statistics() {
            statistics.move_to(&module.target_device, Some(&module.stream))?;
        }
        module
            .weight()
            .move_to(&module.target_device, Some(&module.stream))?;
        self.track_stream(&module.stream);
        Ok(())
    }

    fn process(&mut self, module: &mut NamedModule, auto_gc: bool) -> crate::Result<()> {
        let task = self.tasks.remove(&module.full_name).ok_or_else(|| {
            GptqError::Config(format!("no quantization task for `{}`", module.full_name))
        })?;
        let (output, config) = {
            let mut task = task.lock();
            (task.quantize()?, task.config().clone())
        };
        drop(task);

        self.state.durations.push(output.duration);
        self.state.avg_losses.push(output.avg_loss);
        self.state
            .module_names
            .push(format!("layer-{}-{}", module.layer_index, module.name));

        let dynamic = self
            .resolver()?
            .overrides_for(&module.full_name)
            .map(|o| o.to_string());
        let stat = LayerStat {
            process: self.name().to_string(),
            layer: module.layer_index,
            module: module.name.clone(),
            loss: output.avg_loss,
            samples: output.nsamples,
            damp: output.damp_percent,
            time: output.duration,
            fwd_time: self.state.fwd_time,
            dynamic,
        };
        tracing::info!(
            layer = stat.layer,
            module = %stat.module,
            kind = module.layer().kind_name(),
            loss = stat.loss,
            samples = stat.samples,
            damp = stat.damp,
            time = stat.time,
            fwd_time = stat.fwd_time,
            "Quantized `{}`",
            module.full_name
        );
        self.state.log.push(stat);

        let stream = module.stream.clone();
        let result = QuantResult {
            scale: to_host(output.scale, &stream)?,
            zero: to_host(output.zero, &stream)?,
            g_idx: to_host(output.g_idx, &stream)?,
            scale_extra: output
                .scale_extra
                .map(|t| to_host(t, &stream))
                .transpose()?,
            bits: config.bits,
            group_size: config.group_size,
            sym: config.sym,
            desc_act: config.desc_act,
            duration: output.duration,
            avg_loss: output.avg_loss,
            damp_percent: output.damp_percent,
            nsamples: output.nsamples,
        };
        self.results.insert(module.full_name.clone(), result);
        self.track_stream(&stream);

        let original = module.weight().get()?;
        if self.calculate_w_wq_diff {
            if let Err(e) = Self::record_w_wq_diff(module, &original, &output.weight) {
                tracing::warn!("Could not compute w_wq_diff for `{}`: {}", module.full_name, e);
            }
            module.state.insert("w".to_string(), original);
        }

        // later layers' forward passes must see the quantized weight
        module.weight().set(output.weight)?;
        module
            .weight()
            .move_to(&module.target_device, Some(&stream))?;

        if auto_gc {
            clean_memory();
        }
        Ok(())
    }

    fn submodule_finalize(&mut self, module: &mut NamedModule) -> crate::Result<()> {
        module.weight().move_to(&Device::Cpu, Some(&module.stream))?;
        module.state.remove("w");
        self.track_stream(&module.stream);
        Ok(())
    }

    fn finalize(&mut self, model: &mut QuantModel) -> crate::Result<()> {
        for stream in self.streams.drain(..) {
            stream.synchronize()?;
        }
        for result in self.results.values() {
            result.wait()?;
        }
        if !self.tasks.is_empty() {
            tracing::warn!("{} quantization tasks were never processed", self.tasks.len());
            self.tasks.clear();
        }

        let options = PackOptions::from_config(model.quantize_config(), model.lm_head());
        let kernel = self.packer.pack(model.root(), &self.results, &options)?;
        model.set_qlinear_kernel(kernel);
        model.set_quantized(true);
        model.quantize_config_mut().quant_method = self.method();
        tracing::info!(
            "Packed {} modules with `{}`",
            self.results.len(),
            self.method().as_str()
        );
        Ok(())
    }
}

impl std::fmt::Debug for GptqProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GptqProcessor")
            .field("method", &self.method())
            .field("tasks", &self.tasks.len())
            .field("results", &self.results.len())
            .finish()
    }
}
