//! Layer-by-layer driver for loop processors.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use candle_core::{Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};

use super::processor::{LayerStat, LoopProcessor, PlotSink};
use super::NamedModule;
use crate::model::QuantModel;
use crate::nn_modules::{ForwardHook, Layer};
use crate::utils::{clean_memory, get_device, StreamPool};
use crate::GptqError;

/// Run-level switches of a [`ModuleLooper`] pass
#[derive(Debug, Clone)]
pub struct LoopOptions {
    /// Release host allocator caches after every layer
    pub auto_gc: bool,
    /// Force buffered forward inputs for every module
    pub buffered_fwd: bool,
    /// Keep cached layer inputs on the compute device instead of the host
    pub calibration_enable_gpu_cache: bool,
    /// Compute device for the layer being quantized
    pub device: Device,
    /// Show a progress bar
    pub progress: bool,
}

impl LoopOptions {
    /// Defaults on the best available accelerator (CUDA, then Metal, then CPU)
    pub fn with_best_device(device_id: Option<usize>) -> crate::Result<Self> {
        Ok(Self {
            device: get_device(device_id)?,
            ..Default::default()
        })
    }

    fn data_device(&self) -> Device {
        if self.calibration_enable_gpu_cache {
            self.device.clone()
        } else {
            Device::Cpu
        }
    }
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            auto_gc: true,
            buffered_fwd: false,
            calibration_enable_gpu_cache: true,
            device: Device::Cpu,
            progress: true,
        }
    }
}

/// Walks the decoder layers of a [`QuantModel`] (plus lm_head when enabled),
/// feeding every processor the same layer inputs and advancing them with the
/// outputs of the quantized layer.
pub struct ModuleLooper {
    processors: Vec<Box<dyn LoopProcessor>>,
    options: LoopOptions,
    streams: StreamPool,
    plot_sink: Option<Box<dyn PlotSink>>,
}

impl ModuleLooper {
    pub fn new(processors: Vec<Box<dyn LoopProcessor>>, options: LoopOptions) -> Self {
        Self {
            processors,
            options,
            streams: StreamPool::new(),
            plot_sink: None,
        }
    }

    /// Run queued device copies on a dedicated pool of `threads` workers
    /// instead of the process-wide transfer pool
    pub fn with_transfer_threads(mut self, threads: usize) -> crate::Result<Self> {
        self.streams = StreamPool::with_threads(threads)?;
        Ok(self)
    }

    pub fn with_plot_sink(mut self, sink: Box<dyn PlotSink>) -> Self {
        self.plot_sink = Some(sink);
        self
    }

    pub fn processors(&self) -> &[Box<dyn LoopProcessor>] {
        &self.processors
    }

    /// Run calibration batches through the base modules to get the inputs of
    /// the first decoder layer
    fn cache_inputs(options: &LoopOptions, model: &QuantModel, batches: &[Tensor]) -> crate::Result<Vec<Tensor>> {
        let device = &options.device;
        let data_device = options.data_device();
        for name in model.base_modules() {
            if let Some(module) = model.root().get(name) {
                module.move_to(device, None)?;
            }
        }

        let mut inputs = Vec::with_capacity(batches.len());
        for batch in batches {
            let batch = if batch.rank() == 1 {
                batch.unsqueeze(0)?
            } else {
                batch.clone()
            };
            let hidden = model.embed(&batch.to_device(device)?)?;
            inputs.push(hidden.to_device(&data_device)?);
        }

        for name in model.base_modules() {
            if let Some(module) = model.root().get(name) {
                module.move_to(&Device::Cpu, None)?;
            }
        }
        if options.auto_gc {
            clean_memory();
        }
        Ok(inputs)
    }

    fn progress_bar(&self, total: usize) -> ProgressBar {
        if !self.options.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style);
        }
        pb
    }

    /// Forward every input through `path`, returning the outputs on `out_device`
    fn forward_all(
        model: &QuantModel,
        path: &str,
        inputs: &[Tensor],
        device: &Device,
        out_device: Option<&Device>,
    ) -> crate::Result<Vec<Tensor>> {
        let module = model
            .root()
            .get(path)
            .ok_or_else(|| GptqError::ModuleNotFound(path.to_string()))?;
        let mut outputs = Vec::with_capacity(inputs.len());
        for input in inputs {
            let output = module.forward(&input.to_device(device)?)?;
            if let Some(out_device) = out_device {
                outputs.push(output.to_device(out_device)?);
            }
        }
        Ok(outputs)
    }

    fn set_hook(model: &mut QuantModel, module: &NamedModule, hook: Option<ForwardHook>) -> crate::Result<()> {
        model
            .root_mut()
            .hooked_mut(&module.full_name)
            .ok_or_else(|| GptqError::ModuleNotFound(module.full_name.clone()))?
            .set_forward_hook(hook);
        Ok(())
    }

    /// Quantize `model` in place and finalize every processor.
    ///
    /// Returns the process log of every processor keyed by processor name.
    pub fn run(&mut self, model: &mut QuantModel) -> crate::Result<BTreeMap<String, Vec<LayerStat>>> {
        if model.quantize_config().lm_head {
            model.prepare_lm_head()?;
        }

        let layer_count = model.num_layers()?;
        for processor in self.processors.iter_mut() {
            processor.verify_calibration_dataset()?;
            let inputs =
                Self::cache_inputs(&self.options, model, processor.state().calibration().batches())?;
            processor.receive_layer_inputs(inputs);
            processor.state_mut().release_calibration();
            processor.begin(model)?;
        }

        let config = model.quantize_config().clone();
        let mut layer_modules = model.layer_modules().to_vec();
        if !config.true_sequential {
            layer_modules = vec![layer_modules.concat()];
        }

        let converted = model.root_mut().replace_with_hooked();
        tracing::debug!("Installed hooked wrappers on {} layers", converted);

        let lm_head = if config.lm_head { model.lm_head().map(str::to_string) } else { None };
        let total = layer_count + usize::from(lm_head.is_some());
        let pb = self.progress_bar(total);
        let device = self.options.device.clone();
        let data_device = self.options.data_device();

        for layer_index in 0..total {
            let is_lm_head = layer_index >= layer_count;
            let module_path = match (&lm_head, is_lm_head) {
                (Some(name), true) => name.clone(),
                _ => model.layer_path(layer_index),
            };
            pb.set_message(if is_lm_head {
                "Quantizing lm_head".to_string()
            } else {
                format!("Quantizing layer {} of {}", layer_index, layer_count - 1)
            });

            let full: HashMap<String, Layer> = {
                let node = model
                    .root()
                    .get(&module_path)
                    .ok_or_else(|| GptqError::ModuleNotFound(module_path.clone()))?;
                node.move_to(&device, None)?;
                if is_lm_head {
                    node.find_layers("")
                        .into_iter()
                        .map(|(_, layer)| (module_path.clone(), layer))
                        .collect()
                } else {
                    node.find_layers("").into_iter().collect()
                }
            };
            let subsets = if is_lm_head {
                vec![vec![module_path.clone()]]
            } else {
                layer_modules.clone()
            };

            let processor_count = self.processors.len();
            let mut processed: Vec<NamedModule> = Vec::new();

            for p_index in 0..processor_count {
                let processor = &mut self.processors[p_index];
                processor.collect_memory_info(layer_index);
                let layer_inputs = processor.inputs().to_vec();
                processed.clear();

                for names in &subsets {
                    let mut subset: Vec<NamedModule> = Vec::new();
                    for name in names {
                        let Some(layer) = full.get(name) else {
                            continue;
                        };
                        let full_name = if is_lm_head {
                            name.clone()
                        } else {
                            format!("{}.{}", module_path, name)
                        };
                        subset.push(NamedModule::new(
                            layer.clone(),
                            name.clone(),
                            full_name,
                            layer_index,
                            self.streams.create(&device),
                        ));
                    }

                    let buffered = self.options.buffered_fwd
                        || subset.len() >= config.buffered_fwd_threshold;
                    for module in &subset {
                        processor.preprocess(module, buffered)?;
                    }
                    subset.retain(|m| !processor.is_skipped(m));
                    if subset.is_empty() {
                        continue;
                    }

                    for module in &subset {
                        let hook = processor.pre_process_fwd_hook(module)?;
                        Self::set_hook(model, module, Some(hook))?;
                    }

                    let fwd_start = Instant::now();
                    let forward = Self::forward_all(model, &module_path, &layer_inputs, &device, None);
                    processor.set_fwd_time(fwd_start.elapsed().as_secs_f64());

                    for module in &subset {
                        Self::set_hook(model, module, None)?;
                    }
                    forward?;

                    subset.retain(|m| {
                        if processor.fwd_count(m) == 0 {
                            tracing::error!(
                                "`{}` was not invoked, it may lack sufficient calibration data routed to it.",
                                m.full_name
                            );
                            processor.discard(m);
                            false
                        } else {
                            true
                        }
                    });

                    for module in &subset {
                        processor.pre_process_streaming(module)?;
                    }
                    self.streams.synchronize_all()?;

                    for mut module in subset {
                        processor.process(&mut module, self.options.auto_gc)?;
                        processed.push(module);
                    }
                    self.streams.synchronize_all()?;
                }

                let is_last_module = layer_index + 1 == total;
                if !is_last_module {
                    let mut outputs = Self::forward_all(
                        model,
                        &module_path,
                        &layer_inputs,
                        &device,
                        Some(&data_device),
                    )?;
                    if lm_head.is_some() && layer_index + 1 == layer_count {
                        let mut normed = Vec::with_capacity(outputs.len());
                        for hidden in &outputs {
                            let hidden = model.lm_head_inputs(&hidden.to_device(&device)?)?;
                            normed.push(hidden.to_device(&data_device)?);
                        }
                        outputs = normed;
                    }
                    processor.receive_layer_inputs(outputs);
                }
            }

            self.streams.synchronize_all()?;
            // release device residency after every consumer of this layer ran
            for processor in self.processors.iter_mut().rev() {
                for module in processed.iter_mut().rev() {
                    processor.submodule_finalize(module)?;
                }
            }
            self.streams.synchronize_all()?;
            self.streams.prune();

            if let Some(node) = model.root().get(&module_path) {
                node.move_to(&Device::Cpu, None)?;
            }
            if self.options.auto_gc {
                clean_memory();
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        let mut total_log = BTreeMap::new();
        for processor in self.processors.iter_mut().rev() {
            for stat in processor.log() {
                tracing::info!("{}", stat);
            }
            if let Some(sink) = &self.plot_sink {
                processor.log_plot(sink.as_ref());
            }
            let name = processor.name();
            if matches!(name, "gptq" | "qqq") {
                model.set_quant_log(processor.log().to_vec());
            }
            total_log.insert(name.to_string(), processor.log().to_vec());
            processor.finalize(model)?;
        }

        if self.options.auto_gc {
            clean_memory();
        }
        Ok(total_log)
    }
}

impl std::fmt::Debug for ModuleLooper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLooper")
            .field("processors", &self.processors.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DynamicOverrides, QuantMethod, QuantizeConfig, QUANT_CONFIG_FILENAME};
    use crate::looper::{CalibrationDataset, GptqProcessor};
    use crate::model::MODEL_FILENAME;
    use crate::nn_modules::{Conv, Conv1D, Linear, Module, Sequential};
    use candle_nn::{Activation, Conv1dConfig};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::cell::RefCell;
    use std::collections::HashSet;

    fn random(rng: &mut StdRng, shape: (usize, usize)) -> Tensor {
        let data: Vec<f32> = (0..shape.0 * shape.1).map(|_| rng.gen_range(-1.0..1.0)).collect();
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    fn linear(rng: &mut StdRng, out: usize, inp: usize) -> Layer {
        Layer::Linear(Linear::new(random(rng, (out, inp)), None).unwrap())
    }

    fn toy_model(rng: &mut StdRng, config: QuantizeConfig, with_head: bool) -> QuantModel {
        let mut layers = Sequential::new();
        for i in 0..2 {
            layers.push(
                i.to_string(),
                Sequential::new()
                    .add("fc1", linear(rng, 16, 16))
                    .add("act", Activation::Relu)
                    .add("fc2", linear(rng, 16, 16)),
            );
        }
        let model = Sequential::new()
            .add("embed", linear(rng, 16, 16))
            .add("layers", layers);
        let root = Module::Sequential(
            Sequential::new()
                .add("model", model)
                .add("lm_head", linear(rng, 8, 16)),
        );
        let subsets = vec![vec!["fc1".to_string()], vec!["fc2".to_string()]];
        let model = QuantModel::new(root, "model.layers", subsets, config)
            .unwrap()
            .with_base_modules(vec!["model.embed".to_string()]);
        if with_head {
            model.with_lm_head("lm_head", vec![])
        } else {
            model
        }
    }

    fn looper(rng: &mut StdRng) -> ModuleLooper {
        looper_with(
            rng,
            LoopOptions {
                progress: false,
                ..Default::default()
            },
        )
    }

    fn looper_with(rng: &mut StdRng, options: LoopOptions) -> ModuleLooper {
        let batches: Vec<Tensor> = (0..8).map(|_| random(rng, (4, 16))).collect();
        let processor = GptqProcessor::new(CalibrationDataset::new(batches));
        ModuleLooper::new(vec![Box::new(processor)], options)
    }

    fn layer_weights(model: &QuantModel, names: &[&str]) -> Vec<Vec<Vec<f32>>> {
        names
            .iter()
            .map(|name| {
                model
                    .root()
                    .layer(name)
                    .unwrap()
                    .weight()
                    .get()
                    .unwrap()
                    .to_vec2()
                    .unwrap()
            })
            .collect()
    }

    fn config() -> QuantizeConfig {
        QuantizeConfig {
            bits: 4,
            group_size: 16,
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        titles: RefCell<Vec<String>>,
    }

    impl PlotSink for std::rc::Rc<RecordingSink> {
        fn report(&self, title: &str, _x: &[String], _y: &[f64]) {
            self.titles.borrow_mut().push(title.to_string());
        }
    }

    #[test]
    fn test_quantizes_every_layer() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut model = toy_model(&mut rng, config(), false);
        let sink = std::rc::Rc::new(RecordingSink::default());
        let mut looper = looper(&mut rng).with_plot_sink(Box::new(sink.clone()));

        let logs = looper.run(&mut model).unwrap();
        let stats = &logs["gptq"];
        assert_eq!(stats.len(), 4);
        assert!(stats.iter().all(|s| s.samples == 32 && s.loss >= 0.0));
        assert_eq!(stats[0].module, "fc1");
        assert_eq!(stats[1].module, "fc2");
        assert_eq!(model.quant_log().len(), 4);
        assert!(sink.titles.borrow().iter().any(|t| t == "avg_loss"));

        assert!(model.is_quantized());
        assert_eq!(model.root().count_hooked(), 6);
        let kernel = model.qlinear_kernel().unwrap();
        assert_eq!(kernel.layer_names().len(), 4);
        let tensors = kernel.tensors().unwrap();
        assert_eq!(tensors["model.layers.0.fc1.scales"].dims(), &[1, 16]);
        assert_eq!(tensors["model.layers.1.fc2.qweight"].dims(), &[2, 16]);

        // a single 4-bit group leaves at most 16 distinct values per row
        let weight: Vec<Vec<f32>> = model
            .root()
            .layer("model.layers.1.fc2")
            .unwrap()
            .weight()
            .get()
            .unwrap()
            .to_vec2()
            .unwrap();
        for row in weight {
            let distinct: HashSet<u32> = row.iter().map(|v| v.to_bits()).collect();
            assert!(distinct.len() <= 16);
        }
    }

    #[test]
    fn test_two_layer_scenario() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut layers = Sequential::new();
        for i in 0..2 {
            layers.push(i.to_string(), Sequential::new().add("fc", linear(&mut rng, 16, 16)));
        }
        let root = Module::Sequential(Sequential::new().add("model", Sequential::new().add("layers", layers)));
        let mut model = QuantModel::new(root, "model.layers", vec![vec!["fc".to_string()]], config()).unwrap();

        let logs = looper(&mut rng).run(&mut model).unwrap();
        let stats = &logs["gptq"];
        assert_eq!(stats.len(), 2);
        for stat in stats {
            assert_eq!(stat.samples, 32);
            assert!(stat.loss >= 0.0);
        }

        let kernel = model.qlinear_kernel().unwrap();
        assert_eq!(kernel.layer_names(), vec!["model.layers.0.fc".to_string(), "model.layers.1.fc".to_string()]);
        let tensors = kernel.tensors().unwrap();
        assert_eq!(tensors["model.layers.0.fc.scales"].dims(), &[1, 16]);
        assert_eq!(tensors["model.layers.1.fc.scales"].dims(), &[1, 16]);
    }

    #[test]
    fn test_skipped_layer_is_untouched() {
        let mut rng = StdRng::seed_from_u64(6);
        let cfg = QuantizeConfig {
            dynamic: DynamicOverrides::new().with_skip(r"model\.layers\.1\."),
            ..config()
        };
        let mut model = toy_model(&mut rng, cfg, false);
        let before: Vec<Vec<f32>> = model
            .root()
            .layer("model.layers.1.fc1")
            .unwrap()
            .weight()
            .get()
            .unwrap()
            .to_vec2()
            .unwrap();

        let logs = looper(&mut rng).run(&mut model).unwrap();
        assert_eq!(logs["gptq"].len(), 2);
        assert!(logs["gptq"].iter().all(|s| s.layer == 0));

        let after: Vec<Vec<f32>> = model
            .root()
            .layer("model.layers.1.fc1")
            .unwrap()
            .weight()
            .get()
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(before, after);
        let names = model.qlinear_kernel().unwrap().layer_names();
        assert!(names.iter().all(|n| n.starts_with("model.layers.0.")));
    }

    #[test]
    fn test_merged_subsets() {
        let mut rng = StdRng::seed_from_u64(7);
        let cfg = QuantizeConfig {
            true_sequential: false,
            ..config()
        };
        let mut model = toy_model(&mut rng, cfg, false);
        let logs = looper(&mut rng).run(&mut model).unwrap();
        assert_eq!(logs["gptq"].len(), 4);
        assert!(logs["gptq"].iter().all(|s| s.samples == 32));
    }

    #[test]
    fn test_lm_head_quantized_with_default_override() {
        let mut rng = StdRng::seed_from_u64(8);
        let cfg = QuantizeConfig {
            lm_head: true,
            ..config()
        };
        let mut model = toy_model(&mut rng, cfg, true);
        let logs = looper(&mut rng).run(&mut model).unwrap();

        let stats = &logs["gptq"];
        assert_eq!(stats.len(), 5);
        let head = &stats[4];
        assert_eq!(head.module, "lm_head");
        assert_eq!(head.layer, 2);
        assert_eq!(head.samples, 32);
        assert!(head.dynamic.is_some());

        let tensors = model.qlinear_kernel().unwrap().tensors().unwrap();
        // 8-bit codes, four per 32-bit word
        assert_eq!(tensors["lm_head.qweight"].dims(), &[4, 8]);
        assert_eq!(tensors["lm_head.scales"].dims(), &[1, 8]);
    }

    #[test]
    fn test_save_quantized() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut model = toy_model(&mut rng, config(), false);
        looper(&mut rng).run(&mut model).unwrap();

        let dir = tempfile::tempdir().unwrap();
        model.save_quantized(dir.path()).unwrap();
        let tensors = candle_core::safetensors::load(dir.path().join(MODEL_FILENAME), &Device::Cpu).unwrap();
        assert!(tensors.contains_key("model.layers.0.fc1.qweight"));
        assert!(tensors.contains_key("model.layers.1.fc2.qzeros"));
        assert!(tensors.contains_key("model.embed.weight"));
        assert!(tensors.contains_key("lm_head.weight"));
        assert!(!tensors.contains_key("model.layers.0.fc1.weight"));

        let saved = QuantizeConfig::from_file(dir.path().join(QUANT_CONFIG_FILENAME)).unwrap();
        assert_eq!(saved.bits, 4);
        assert_eq!(saved.group_size, 16);
    }

    #[test]
    fn test_lm_head_requested_without_head() {
        let mut rng = StdRng::seed_from_u64(10);
        let cfg = QuantizeConfig {
            lm_head: true,
            ..config()
        };
        let mut model = toy_model(&mut rng, cfg, false);
        assert!(looper(&mut rng).run(&mut model).is_err());
        assert!(!model.is_quantized());
    }

    #[test]
    fn test_buffered_inputs_do_not_change_weights() {
        let names = [
            "model.layers.0.fc1",
            "model.layers.0.fc2",
            "model.layers.1.fc1",
            "model.layers.1.fc2",
        ];
        let run = |threshold: usize, forced: bool| {
            let mut rng = StdRng::seed_from_u64(12);
            let cfg = QuantizeConfig {
                buffered_fwd_threshold: threshold,
                ..config()
            };
            let mut model = toy_model(&mut rng, cfg, false);
            let options = LoopOptions {
                buffered_fwd: forced,
                progress: false,
                ..Default::default()
            };
            let logs = looper_with(&mut rng, options).run(&mut model).unwrap();
            assert!(logs["gptq"].iter().all(|s| s.samples == 32));
            layer_weights(&model, &names)
        };

        let direct = run(usize::MAX, false);
        // every subset has one module, so a threshold of 1 buffers them all
        assert_eq!(run(1, false), direct);
        assert_eq!(run(usize::MAX, true), direct);
    }

    #[test]
    fn test_qqq_pass_tags_model_and_packs_channel_scale() {
        let mut rng = StdRng::seed_from_u64(13);
        let cfg = QuantizeConfig {
            quant_method: QuantMethod::Qqq,
            ..config()
        };
        let mut model = toy_model(&mut rng, cfg, false);
        let logs = looper(&mut rng).run(&mut model).unwrap();

        assert!(!logs.contains_key("gptq"));
        assert_eq!(logs["qqq"].len(), 4);
        assert!(logs["qqq"].iter().all(|s| s.process == "qqq"));
        assert_eq!(model.quant_log().len(), 4);
        assert_eq!(model.quantize_config().quant_method, QuantMethod::Qqq);

        let tensors = model.qlinear_kernel().unwrap().tensors().unwrap();
        assert_eq!(tensors["model.layers.0.fc1.scale_extra"].dims(), &[1, 16]);
        assert_eq!(tensors["model.layers.1.fc2.scale_extra"].dims(), &[1, 16]);
    }

    #[test]
    fn test_mixed_layer_kinds() {
        let mut rng = StdRng::seed_from_u64(14);
        let mut layers = Sequential::new();
        for i in 0..2 {
            let weight = random(&mut rng, (4, 4 * 3)).reshape((4, 4, 3)).unwrap();
            let conv = Conv1dConfig {
                padding: 1,
                ..Default::default()
            };
            let conv = Conv::new_1d(weight, None, conv).unwrap();
            let mix = Conv1D::new(random(&mut rng, (8, 8)), None).unwrap();
            layers.push(
                i.to_string(),
                Sequential::new()
                    .add("conv", Layer::Conv(conv))
                    .add("proj", linear(&mut rng, 8, 8))
                    .add("mix", Layer::Conv1D(mix)),
            );
        }
        let root = Module::Sequential(Sequential::new().add("model", Sequential::new().add("layers", layers)));
        let subsets = vec![
            vec!["conv".to_string()],
            vec!["proj".to_string()],
            vec!["mix".to_string()],
        ];
        let cfg = QuantizeConfig {
            group_size: 4,
            ..config()
        };
        let mut model = QuantModel::new(root, "model.layers", subsets, cfg).unwrap();

        // (batch, channels, length) with length matching the linear width
        let batches: Vec<Tensor> = (0..8)
            .map(|_| random(&mut rng, (2, 4 * 8)).reshape((2, 4, 8)).unwrap())
            .collect();
        let processor = GptqProcessor::new(CalibrationDataset::new(batches));
        let options = LoopOptions {
            progress: false,
            ..Default::default()
        };
        let logs = ModuleLooper::new(vec![Box::new(processor)], options)
            .with_transfer_threads(2)
            .unwrap()
            .run(&mut model)
            .unwrap();

        let stats = &logs["gptq"];
        assert_eq!(stats.len(), 6);
        assert!(stats.iter().all(|s| s.samples == 16));
        let modules: Vec<&str> = stats[..3].iter().map(|s| s.module.as_str()).collect();
        assert_eq!(modules, vec!["conv", "proj", "mix"]);

        let tensors = model.qlinear_kernel().unwrap().tensors().unwrap();
        // conv: 4 rows x 12 unfolded columns, 3 groups
        assert_eq!(tensors["model.layers.0.conv.scales"].dims(), &[3, 4]);
        assert_eq!(tensors["model.layers.0.conv.qweight"].dims(), &[2, 4]);
        assert_eq!(tensors["model.layers.1.proj.scales"].dims(), &[2, 8]);
        assert_eq!(tensors["model.layers.1.mix.scales"].dims(), &[2, 8]);

        let conv = model.root().layer("model.layers.1.conv").unwrap();
        assert_eq!(conv.weight().get().unwrap().dims(), &[4, 4, 3]);
        let mix = model.root().layer("model.layers.1.mix").unwrap();
        assert_eq!(mix.weight().get().unwrap().dims(), &[8, 8]);
    }
}
