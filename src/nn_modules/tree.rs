//! Named module tree.
//!
//! Models are described as nested [`Sequential`] containers whose leaves are
//! quantizable layers, hooked layers, or parameter-free activations. Paths use
//! dotted child names (`model.layers.0.mlp.up_proj`).

use candle_core::{Device, Tensor};
use candle_nn::{Activation, Module as CandleModule};

use super::{HookedLayer, Layer};
use crate::utils::DeviceStream;

/// Ordered container of named children, run in insertion order
#[derive(Debug, Clone, Default)]
pub struct Sequential {
    children: Vec<(String, Module)>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append
    pub fn add(mut self, name: impl Into<String>, module: impl Into<Module>) -> Self {
        self.push(name, module);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, module: impl Into<Module>) {
        self.children.push((name.into(), module.into()));
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &Module)> {
        self.children.iter().map(|(n, m)| (n.as_str(), m))
    }

    pub fn child(&self, name: &str) -> Option<&Module> {
        self.children.iter().find(|(n, _)| n == name).map(|(_, m)| m)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Module> {
        self.children
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m)
    }

    pub fn forward(&self, xs: &Tensor) -> crate::Result<Tensor> {
        let mut xs = xs.clone();
        for (_, child) in &self.children {
            xs = child.forward(&xs)?;
        }
        Ok(xs)
    }
}

/// Node of a model tree
#[derive(Debug, Clone)]
pub enum Module {
    Layer(Layer),
    Hooked(HookedLayer),
    Activation(Activation),
    Sequential(Sequential),
}

impl From<Layer> for Module {
    fn from(layer: Layer) -> Self {
        Module::Layer(layer)
    }
}

impl From<HookedLayer> for Module {
    fn from(layer: HookedLayer) -> Self {
        Module::Hooked(layer)
    }
}

impl From<Activation> for Module {
    fn from(act: Activation) -> Self {
        Module::Activation(act)
    }
}

impl From<Sequential> for Module {
    fn from(seq: Sequential) -> Self {
        Module::Sequential(seq)
    }
}

impl Module {
    pub fn forward(&self, xs: &Tensor) -> crate::Result<Tensor> {
        match self {
            Module::Layer(layer) => layer.forward(xs),
            Module::Hooked(hooked) => hooked.forward(xs),
            Module::Activation(act) => Ok(act.forward(xs)?),
            Module::Sequential(seq) => seq.forward(xs),
        }
    }

    /// Look up a descendant by dotted path; the empty path is `self`
    pub fn get(&self, path: &str) -> Option<&Module> {
        if path.is_empty() {
            return Some(self);
        }
        let mut node = self;
        for part in path.split('.') {
            match node {
                Module::Sequential(seq) => node = seq.child(part)?,
                _ => return None,
            }
        }
        Some(node)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Module> {
        if path.is_empty() {
            return Some(self);
        }
        let mut node = self;
        for part in path.split('.') {
            match node {
                Module::Sequential(seq) => node = seq.child_mut(part)?,
                _ => return None,
            }
        }
        Some(node)
    }

    /// Quantizable layer at `path`, whether hooked or not
    pub fn layer(&self, path: &str) -> Option<&Layer> {
        match self.get(path)? {
            Module::Layer(layer) => Some(layer),
            Module::Hooked(hooked) => Some(hooked.layer()),
            _ => None,
        }
    }

    /// Hooked wrapper at `path`; `None` before `replace_with_hooked`
    pub fn hooked_mut(&mut self, path: &str) -> Option<&mut HookedLayer> {
        match self.get_mut(path)? {
            Module::Hooked(hooked) => Some(hooked),
            _ => None,
        }
    }

    /// All quantizable layers below this node, depth first, with full names
    /// rooted at `prefix`
    pub fn find_layers(&self, prefix: &str) -> Vec<(String, Layer)> {
        let mut found = Vec::new();
        self.collect_layers(prefix, &mut found);
        found
    }

    fn collect_layers(&self, prefix: &str, found: &mut Vec<(String, Layer)>) {
        match self {
            Module::Layer(layer) => found.push((prefix.to_string(), layer.clone())),
            Module::Hooked(hooked) => found.push((prefix.to_string(), hooked.layer().clone())),
            Module::Activation(_) => {}
            Module::Sequential(seq) => {
                for (name, child) in &seq.children {
                    child.collect_layers(&join_path(prefix, name), found);
                }
            }
        }
    }

    /// Replace every plain layer in the tree with a hooked wrapper.
    ///
    /// Already-hooked nodes are left alone, so repeated calls never double
    /// wrap. Returns the number of layers converted by this call.
    pub fn replace_with_hooked(&mut self) -> usize {
        match self {
            Module::Layer(layer) => {
                *self = Module::Hooked(HookedLayer::from_layer(layer.clone()));
                1
            }
            Module::Sequential(seq) => seq
                .children
                .iter_mut()
                .map(|(_, child)| child.replace_with_hooked())
                .sum(),
            Module::Hooked(_) | Module::Activation(_) => 0,
        }
    }

    /// Number of hooked wrappers in the tree
    pub fn count_hooked(&self) -> usize {
        match self {
            Module::Hooked(_) => 1,
            Module::Sequential(seq) => seq.children.iter().map(|(_, c)| c.count_hooked()).sum(),
            _ => 0,
        }
    }

    /// Relocate every parameter under this node to `device`
    pub fn move_to(&self, device: &Device, stream: Option<&DeviceStream>) -> crate::Result<()> {
        for (_, layer) in self.find_layers("") {
            layer.weight().move_to(device, stream)?;
            if let Some(bias) = layer.bias() {
                bias.move_to(device, stream)?;
            }
        }
        Ok(())
    }
}

/// Join a dotted prefix and a child name
pub fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn_modules::{Conv, Conv1D, Linear};
    use candle_core::DType;
    use candle_nn::Conv1dConfig;

    fn toy_tree() -> Module {
        let device = Device::Cpu;
        let fc = Linear::new(Tensor::ones((4, 4), DType::F32, &device).unwrap(), None).unwrap();
        let conv = Conv::new_1d(
            Tensor::ones((4, 4, 1), DType::F32, &device).unwrap(),
            None,
            Conv1dConfig::default(),
        )
        .unwrap();
        let c_attn = Conv1D::new(Tensor::ones((4, 4), DType::F32, &device).unwrap(), None).unwrap();

        let block = Sequential::new()
            .add("fc", Layer::Linear(fc))
            .add("act", Activation::Relu)
            .add("c_attn", Layer::Conv1D(c_attn));
        Module::Sequential(
            Sequential::new()
                .add("layers", Sequential::new().add("0", block))
                .add("conv", Layer::Conv(conv)),
        )
    }

    #[test]
    fn test_replace_with_hooked_is_idempotent() {
        let mut tree = toy_tree();
        assert_eq!(tree.replace_with_hooked(), 3);
        assert_eq!(tree.replace_with_hooked(), 0);
        assert_eq!(tree.count_hooked(), 3);
        assert_eq!(tree.find_layers("").len(), 3);
    }

    #[test]
    fn test_paths_and_lookup() {
        let mut tree = toy_tree();
        let names: Vec<String> = tree.find_layers("model").into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["model.layers.0.fc", "model.layers.0.c_attn", "model.conv"]
        );

        assert!(tree.layer("layers.0.fc").is_some());
        assert!(tree.layer("layers.0.act").is_none());
        assert!(tree.get("layers.9").is_none());
        assert!(tree.hooked_mut("layers.0.fc").is_none());

        tree.replace_with_hooked();
        assert!(tree.hooked_mut("layers.0.fc").is_some());
    }

    #[test]
    fn test_hooked_tree_forward_unchanged() {
        let mut tree = toy_tree();
        let block = tree.get("layers.0").unwrap().clone();
        let x = Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap();
        let before = block.forward(&x).unwrap().to_vec2::<f32>().unwrap();

        tree.replace_with_hooked();
        let after = tree
            .get("layers.0")
            .unwrap()
            .forward(&x)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(before, after);
    }
}
