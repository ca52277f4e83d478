//! A quantizable layer bound to its place in the model.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{Device, Tensor};

use crate::nn_modules::{Layer, Param};
use crate::utils::DeviceStream;

/// Layer handle plus identity, target device and per-layer transfer stream.
///
/// `state` carries per-module scratch tensors between processor phases
/// (e.g. the original weight or the `w_wq_diff` diagnostic).
#[derive(Debug)]
pub struct NamedModule {
    layer: Layer,
    /// Name relative to its decoder layer, e.g. `self_attn.q_proj`
    pub name: String,
    /// Dotted path from the model root; unique within a pass
    pub full_name: String,
    pub layer_index: usize,
    pub target_device: Device,
    pub stream: Arc<DeviceStream>,
    pub state: HashMap<String, Tensor>,
}

impl NamedModule {
    pub fn new(
        layer: Layer,
        name: impl Into<String>,
        full_name: impl Into<String>,
        layer_index: usize,
        stream: Arc<DeviceStream>,
    ) -> Self {
        Self {
            layer,
            name: name.into(),
            full_name: full_name.into(),
            layer_index,
            target_device: stream.device().clone(),
            stream,
            state: HashMap::new(),
        }
    }

    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    /// Weight handle shared with the model tree
    pub fn weight(&self) -> &Param {
        self.layer.weight()
    }
}
