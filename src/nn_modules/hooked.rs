//! Forward-intercepting wrapper around a quantizable layer.

use std::fmt;
use std::sync::Arc;

use candle_core::Tensor;

use super::Layer;

/// Callback invoked after every forward pass with `(layer, inputs, output)`
pub type ForwardHook = Arc<dyn Fn(&Layer, &[Tensor], &Tensor) -> crate::Result<()> + Send + Sync>;

/// Drop-in replacement for a [`Layer`] with an optional forward hook.
///
/// Parameters are shared with the wrapped layer, never copied: an update made
/// through either handle is visible through both.
#[derive(Clone)]
pub struct HookedLayer {
    layer: Layer,
    forward_hook: Option<ForwardHook>,
}

impl HookedLayer {
    /// Wrap `layer`, sharing its parameter handles
    pub fn from_layer(layer: Layer) -> Self {
        Self {
            layer,
            forward_hook: None,
        }
    }

    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    /// Drop the hook and hand back the wrapped layer
    pub fn into_inner(self) -> Layer {
        self.layer
    }

    /// Install (`Some`) or remove (`None`) the forward hook
    pub fn set_forward_hook(&mut self, hook: Option<ForwardHook>) {
        self.forward_hook = hook;
    }

    pub fn has_forward_hook(&self) -> bool {
        self.forward_hook.is_some()
    }

    /// Run the wrapped layer, then the hook if one is installed.
    ///
    /// A hook error aborts the forward pass.
    pub fn forward(&self, xs: &Tensor) -> crate::Result<Tensor> {
        let output = self.layer.forward(xs)?;
        if let Some(hook) = &self.forward_hook {
            hook(&self.layer, std::slice::from_ref(xs), &output)?;
        }
        Ok(output)
    }
}

impl fmt::Debug for HookedLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookedLayer")
            .field("layer", &self.layer)
            .field("has_forward_hook", &self.forward_hook.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn_modules::Linear;
    use candle_core::{DType, Device};
    use parking_lot::Mutex;

    fn linear() -> Layer {
        let w = Tensor::arange(0f32, 12., &Device::Cpu).unwrap().reshape((3, 4)).unwrap();
        let b = Tensor::new(&[0.5f32, -0.5, 1.0], &Device::Cpu).unwrap();
        Layer::Linear(Linear::new(w, Some(b)).unwrap())
    }

    #[test]
    fn test_forward_parity_with_and_without_hook() {
        let plain = linear();
        let mut hooked = HookedLayer::from_layer(plain.clone());
        let x = Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap();

        let expected = plain.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(hooked.forward(&x).unwrap().to_vec2::<f32>().unwrap(), expected);

        let calls = Arc::new(Mutex::new(0usize));
        let counter = calls.clone();
        let hook: ForwardHook = Arc::new(
            move |_: &Layer, inputs: &[Tensor], output: &Tensor| -> crate::Result<()> {
                assert_eq!(inputs.len(), 1);
                assert_eq!(output.dims(), &[2, 3]);
                *counter.lock() += 1;
                Ok(())
            },
        );
        hooked.set_forward_hook(Some(hook));

        assert_eq!(hooked.forward(&x).unwrap().to_vec2::<f32>().unwrap(), expected);
        assert_eq!(*calls.lock(), 1);

        hooked.set_forward_hook(None);
        hooked.forward(&x).unwrap();
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn test_weight_is_shared() {
        let plain = linear();
        let hooked = HookedLayer::from_layer(plain.clone());
        assert!(hooked.layer().weight().ptr_eq(plain.weight()));

        plain
            .weight()
            .set(Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        let x = Tensor::ones((1, 4), DType::F32, &Device::Cpu).unwrap();
        let y = hooked.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(y, vec![vec![0.5, -0.5, 1.0]]);

        let inner = hooked.into_inner();
        assert!(inner.weight().ptr_eq(plain.weight()));
        assert_eq!(inner.kind_name(), "linear");
    }

    #[test]
    fn test_hook_error_propagates() {
        let mut hooked = HookedLayer::from_layer(linear());
        hooked.set_forward_hook(Some(Arc::new(
            |_: &Layer, _: &[Tensor], _: &Tensor| -> crate::Result<()> {
                Err(crate::GptqError::Config("no task".to_string()))
            },
        )));
        let x = Tensor::ones((1, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(hooked.forward(&x).is_err());
    }
}
