//! Model container driven by the quantization loop.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use candle_core::{Device, Tensor};

use super::pack::{PackedKernel, MODEL_FILENAME};
use crate::config::{LayerConfigResolver, LayerOverrides, QuantizeConfig, QUANT_CONFIG_FILENAME};
use crate::looper::LayerStat;
use crate::nn_modules::Module;
use crate::GptqError;

/// A module tree plus the layout the looper needs to walk it:
/// where the decoder layers live, which modules run before them, which run
/// between the last layer and the lm_head, and how each layer's quantizable
/// modules are grouped for sequential processing.
pub struct QuantModel {
    root: Module,
    layers_node: String,
    base_modules: Vec<String>,
    pre_lm_head: Vec<String>,
    lm_head: Option<String>,
    layer_modules: Vec<Vec<String>>,
    quantize_config: QuantizeConfig,
    quantized: bool,
    qlinear_kernel: Option<Arc<dyn PackedKernel>>,
    quant_log: Vec<LayerStat>,
}

impl QuantModel {
    /// Wrap `root`; `layers_node` must name a sequential container of
    /// decoder layers and `layer_modules` lists per-layer module subsets
    /// by relative name, in execution order.
    pub fn new(
        root: Module,
        layers_node: impl Into<String>,
        layer_modules: Vec<Vec<String>>,
        quantize_config: QuantizeConfig,
    ) -> crate::Result<Self> {
        quantize_config.validate()?;
        let layers_node = layers_node.into();
        match root.get(&layers_node) {
            Some(Module::Sequential(_)) => {}
            Some(_) => {
                return Err(GptqError::Config(format!(
                    "`{}` is not a container of decoder layers",
                    layers_node
                )));
            }
            None => return Err(GptqError::ModuleNotFound(layers_node)),
        }

        Ok(Self {
            root,
            layers_node,
            base_modules: Vec::new(),
            pre_lm_head: Vec::new(),
            lm_head: None,
            layer_modules,
            quantize_config,
            quantized: false,
            qlinear_kernel: None,
            quant_log: Vec::new(),
        })
    }

    /// Modules run, in order, on raw calibration batches before layer 0
    pub fn with_base_modules(mut self, names: Vec<String>) -> Self {
        self.base_modules = names;
        self
    }

    /// The output projection and the modules (e.g. a final norm) feeding it
    pub fn with_lm_head(mut self, name: impl Into<String>, pre_lm_head: Vec<String>) -> Self {
        self.lm_head = Some(name.into());
        self.pre_lm_head = pre_lm_head;
        self
    }

    /// The module tree, hooked wrappers included once a pass has started
    pub fn root(&self) -> &Module {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Module {
        &mut self.root
    }

    pub fn base_modules(&self) -> &[String] {
        &self.base_modules
    }

    /// Full name of the output projection, if one was registered
    pub fn lm_head(&self) -> Option<&str> {
        self.lm_head.as_deref()
    }

    /// Per-layer module subsets in execution order
    pub fn layer_modules(&self) -> &[Vec<String>] {
        &self.layer_modules
    }

    pub fn quantize_config(&self) -> &QuantizeConfig {
        &self.quantize_config
    }

    pub fn quantize_config_mut(&mut self) -> &mut QuantizeConfig {
        &mut self.quantize_config
    }

    /// Set by the processor's finalize once a kernel is attached
    pub fn is_quantized(&self) -> bool {
        self.quantized
    }

    pub fn set_quantized(&mut self, quantized: bool) {
        self.quantized = quantized;
    }

    /// Packed replacement for every quantized layer
    pub fn qlinear_kernel(&self) -> Option<&Arc<dyn PackedKernel>> {
        self.qlinear_kernel.as_ref()
    }

    pub fn set_qlinear_kernel(&mut self, kernel: Arc<dyn PackedKernel>) {
        self.qlinear_kernel = Some(kernel);
    }

    /// Per-module records of the last gptq or qqq pass
    pub fn quant_log(&self) -> &[LayerStat] {
        &self.quant_log
    }

    pub fn set_quant_log(&mut self, log: Vec<LayerStat>) {
        self.quant_log = log;
    }

    /// Number of decoder layers under the layers node
    pub fn num_layers(&self) -> crate::Result<usize> {
        match self.root.get(&self.layers_node) {
            Some(Module::Sequential(layers)) => Ok(layers.len()),
            _ => Err(GptqError::ModuleNotFound(self.layers_node.clone())),
        }
    }

    /// Dotted path of decoder layer `index`
    pub fn layer_path(&self, index: usize) -> String {
        format!("{}.{}", self.layers_node, index)
    }

    fn run_chain(&self, names: &[String], xs: &Tensor) -> crate::Result<Tensor> {
        let mut xs = xs.clone();
        for name in names {
            let module = self
                .root
                .get(name)
                .ok_or_else(|| GptqError::ModuleNotFound(name.clone()))?;
            xs = module.forward(&xs)?;
        }
        Ok(xs)
    }

    /// Inputs of the first decoder layer for a calibration batch
    pub fn embed(&self, xs: &Tensor) -> crate::Result<Tensor> {
        self.run_chain(&self.base_modules, xs)
    }

    /// Inputs of the lm_head given the last decoder layer's output
    pub fn lm_head_inputs(&self, xs: &Tensor) -> crate::Result<Tensor> {
        self.run_chain(&self.pre_lm_head, xs)
    }

    /// Register the default lm_head override unless a rule already covers it.
    pub fn prepare_lm_head(&mut self) -> crate::Result<()> {
        let name = self
            .lm_head
            .clone()
            .ok_or_else(|| GptqError::Config("lm_head quantization requested but the model has no lm_head".to_string()))?;
        match self.root.get(&name) {
            None => return Err(GptqError::ModuleNotFound(name)),
            Some(_) if self.root.layer(&name).is_none() => {
                return Err(GptqError::UnsupportedLayer(format!("lm_head `{}` is not a quantizable layer", name)));
            }
            Some(_) => {}
        }

        let resolver = LayerConfigResolver::new(&self.quantize_config)?;
        if !resolver.has_rule_for(&name) {
            let overrides = LayerOverrides {
                bits: Some(8),
                group_size: Some(32),
                sym: Some(true),
                desc_act: Some(false),
                mse: Some(2.4),
                ..Default::default()
            };
            tracing::info!("Quantizing `{}` with default overrides {}", name, overrides);
            self.quantize_config
                .dynamic
                .push(format!("+:{}$", regex::escape(&name)), overrides);
        }
        Ok(())
    }

    /// Write the packed kernel tensors, the weights of every layer that was
    /// not quantized, and the quantization config into `dir`.
    pub fn save_quantized(&self, dir: impl AsRef<Path>) -> crate::Result<()> {
        let dir = dir.as_ref();
        let kernel = match (&self.qlinear_kernel, self.quantized) {
            (Some(kernel), true) => kernel,
            _ => return Err(GptqError::Config("model has not been quantized".to_string())),
        };
        std::fs::create_dir_all(dir)?;

        let mut tensors = kernel.tensors()?;
        let packed: HashSet<String> = kernel.layer_names().into_iter().collect();
        for (name, layer) in self.root.find_layers("") {
            if packed.contains(&name) {
                continue;
            }
            tensors.insert(format!("{name}.weight"), layer.weight().get()?.to_device(&Device::Cpu)?);
            if let Some(bias) = layer.bias() {
                tensors.insert(format!("{name}.bias"), bias.get()?.to_device(&Device::Cpu)?);
            }
        }

        candle_core::safetensors::save(&tensors, dir.join(MODEL_FILENAME))?;
        self.quantize_config.to_file(dir.join(QUANT_CONFIG_FILENAME))?;
        tracing::info!("Saved {} tensors to {}", tensors.len(), dir.display());
        Ok(())
    }
}

impl fmt::Debug for QuantModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuantModel")
            .field("layers_node", &self.layers_node)
            .field("base_modules", &self.base_modules)
            .field("lm_head", &self.lm_head)
            .field("layer_modules", &self.layer_modules)
            .field("quantized", &self.quantized)
            .finish()
    }
}
