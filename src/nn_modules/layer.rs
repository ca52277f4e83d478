//! Quantizable layer types.
//!
//! The set is closed: plain linear, N-dimensional convolution, and the
//! transposed-linear `Conv1D` used by GPT-2 style models. Parameters are
//! [`StreamedTensor`] handles, so cloning a layer shares its weights rather
//! than copying them.

use candle_core::{DType, Tensor};
use candle_nn::{Conv1dConfig, Conv2dConfig, Module as _};

use crate::utils::StreamedTensor;
use crate::GptqError;

/// Shared, relocatable parameter tensor
pub type Param = StreamedTensor;

/// Dense layer computing `x @ W^T + b` with `W` of shape `(out, in)`
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Param,
    bias: Option<Param>,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> crate::Result<Self> {
        let (out_features, in_features) = weight.dims2()?;
        Ok(Self {
            weight: Param::new(weight),
            bias: bias.map(Param::new),
            in_features,
            out_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    fn forward(&self, xs: &Tensor) -> crate::Result<Tensor> {
        let weight = self.weight.get()?;
        let bias = self.bias.as_ref().map(|b| b.get()).transpose()?;
        Ok(candle_nn::Linear::new(weight, bias).forward(xs)?)
    }
}

/// Convolution hyper-parameters for the supported dimensionalities
#[derive(Debug, Clone, Copy)]
pub enum ConvConfig {
    D1(Conv1dConfig),
    D2(Conv2dConfig),
}

impl ConvConfig {
    fn geometry(&self) -> (usize, usize, usize, usize) {
        match self {
            ConvConfig::D1(c) => (c.padding, c.stride, c.dilation, c.groups),
            ConvConfig::D2(c) => (c.padding, c.stride, c.dilation, c.groups),
        }
    }

    pub fn groups(&self) -> usize {
        self.geometry().3
    }
}

/// 1-D or 2-D convolution with weight `(out, in / groups, k...)`
#[derive(Debug, Clone)]
pub struct Conv {
    weight: Param,
    bias: Option<Param>,
    config: ConvConfig,
    in_channels: usize,
    out_channels: usize,
    kernel_size: Vec<usize>,
}

impl Conv {
    pub fn new_1d(weight: Tensor, bias: Option<Tensor>, config: Conv1dConfig) -> crate::Result<Self> {
        let (out_channels, in_per_group, k) = weight.dims3()?;
        Ok(Self {
            weight: Param::new(weight),
            bias: bias.map(Param::new),
            config: ConvConfig::D1(config),
            in_channels: in_per_group * config.groups,
            out_channels,
            kernel_size: vec![k],
        })
    }

    pub fn new_2d(weight: Tensor, bias: Option<Tensor>, config: Conv2dConfig) -> crate::Result<Self> {
        let (out_channels, in_per_group, kh, kw) = weight.dims4()?;
        Ok(Self {
            weight: Param::new(weight),
            bias: bias.map(Param::new),
            config: ConvConfig::D2(config),
            in_channels: in_per_group * config.groups,
            out_channels,
            kernel_size: vec![kh, kw],
        })
    }

    pub fn config(&self) -> &ConvConfig {
        &self.config
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel_size(&self) -> &[usize] {
        &self.kernel_size
    }

    fn forward(&self, xs: &Tensor) -> crate::Result<Tensor> {
        let weight = self.weight.get()?;
        let bias = self.bias.as_ref().map(|b| b.get()).transpose()?;
        let out = match self.config {
            ConvConfig::D1(c) => candle_nn::Conv1d::new(weight, bias, c).forward(xs)?,
            ConvConfig::D2(c) => candle_nn::Conv2d::new(weight, bias, c).forward(xs)?,
        };
        Ok(out)
    }

    /// im2col view of the input: `(in_channels * prod(kernel), batch * positions)`
    fn unfold(&self, input: &Tensor) -> crate::Result<Tensor> {
        let (padding, stride, dilation, _) = self.config.geometry();
        let (input, kernel, pad, stride, dilation) = match self.config {
            ConvConfig::D1(_) => (
                input.unsqueeze(2)?,
                (1, self.kernel_size[0]),
                (0, padding),
                (1, stride),
                (1, dilation),
            ),
            ConvConfig::D2(_) => (
                input.clone(),
                (self.kernel_size[0], self.kernel_size[1]),
                (padding, padding),
                (stride, stride),
                (dilation, dilation),
            ),
        };
        unfold_2d(&input, kernel, pad, stride, dilation)
    }
}

/// Transposed linear layer: `x @ W + b` with `W` of shape `(in, out)`
#[derive(Debug, Clone)]
pub struct Conv1D {
    weight: Param,
    bias: Option<Param>,
    nx: usize,
    nf: usize,
}

impl Conv1D {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> crate::Result<Self> {
        let (nx, nf) = weight.dims2()?;
        Ok(Self {
            weight: Param::new(weight),
            bias: bias.map(Param::new),
            nx,
            nf,
        })
    }

    pub fn nx(&self) -> usize {
        self.nx
    }

    pub fn nf(&self) -> usize {
        self.nf
    }

    fn forward(&self, xs: &Tensor) -> crate::Result<Tensor> {
        let weight = self.weight.get()?;
        let out = xs.broadcast_matmul(&weight)?;
        match &self.bias {
            Some(bias) => Ok(out.broadcast_add(&bias.get()?)?),
            None => Ok(out),
        }
    }
}

/// One quantizable layer
#[derive(Debug, Clone)]
pub enum Layer {
    Linear(Linear),
    Conv(Conv),
    Conv1D(Conv1D),
}

impl Layer {
    pub fn forward(&self, xs: &Tensor) -> crate::Result<Tensor> {
        match self {
            Layer::Linear(l) => l.forward(xs),
            Layer::Conv(c) => c.forward(xs),
            Layer::Conv1D(c) => c.forward(xs),
        }
    }

    pub fn weight(&self) -> &Param {
        match self {
            Layer::Linear(l) => &l.weight,
            Layer::Conv(c) => &c.weight,
            Layer::Conv1D(c) => &c.weight,
        }
    }

    pub fn bias(&self) -> Option<&Param> {
        match self {
            Layer::Linear(l) => l.bias.as_ref(),
            Layer::Conv(c) => c.bias.as_ref(),
            Layer::Conv1D(c) => c.bias.as_ref(),
        }
    }

    /// Short subtype label used in logs
    pub fn kind_name(&self) -> &'static str {
        match self {
            Layer::Linear(_) => "linear",
            Layer::Conv(c) => match c.config {
                ConvConfig::D1(_) => "conv1d",
                ConvConfig::D2(_) => "conv2d",
            },
            Layer::Conv1D(_) => "transposed_conv1d",
        }
    }

    /// `(rows, columns)` of the matrix the quantizer works on.
    ///
    /// Rows are output channels; columns are the inputs each output sees.
    pub fn matrix_shape(&self) -> (usize, usize) {
        match self {
            Layer::Linear(l) => (l.out_features, l.in_features),
            Layer::Conv(c) => (
                c.out_channels,
                c.in_channels / c.config.groups() * c.kernel_size.iter().product::<usize>(),
            ),
            Layer::Conv1D(c) => (c.nf, c.nx),
        }
    }

    /// Fail early for layers the statistics path cannot handle
    pub fn check_quantizable(&self) -> crate::Result<()> {
        if let Layer::Conv(c) = self {
            if c.config.groups() != 1 {
                return Err(GptqError::UnsupportedLayer(format!(
                    "grouped convolution (groups = {}) cannot be quantized",
                    c.config.groups()
                )));
            }
        }
        Ok(())
    }

    /// Current weight as an F32 `(rows, columns)` matrix
    pub fn weight_matrix(&self) -> crate::Result<Tensor> {
        let weight = self.weight().get()?;
        let matrix = match self {
            Layer::Linear(_) => weight,
            Layer::Conv(_) => weight.flatten_from(1)?,
            Layer::Conv1D(_) => weight.t()?,
        };
        Ok(matrix.to_dtype(DType::F32)?.contiguous()?)
    }

    /// Inverse of [`Layer::weight_matrix`]: reshape and cast `matrix` like `like`
    pub fn matrix_to_weight(&self, matrix: &Tensor, like: &Tensor) -> crate::Result<Tensor> {
        let restored = match self {
            Layer::Conv1D(_) => matrix.t()?.contiguous()?,
            _ => matrix.clone(),
        };
        Ok(restored.reshape(like.dims())?.to_dtype(like.dtype())?)
    }

    /// Convert a forward input into statistics columns.
    ///
    /// Returns the number of calibration samples the input contributes and an
    /// F32 `(columns, n)` matrix whose outer product accumulates into the
    /// statistics matrix. The leading input dimension counts samples.
    pub fn input_columns(&self, input: &Tensor) -> crate::Result<(usize, Tensor)> {
        let dims = input.dims();
        let samples = if dims.len() <= 1 { 1 } else { dims[0] };
        let columns = match self {
            Layer::Linear(_) | Layer::Conv1D(_) => {
                let last = *dims.last().ok_or_else(|| {
                    GptqError::Config("scalar input reached a quantized layer".to_string())
                })?;
                input.reshape(((), last))?.t()?
            }
            Layer::Conv(c) => c.unfold(input)?,
        };
        Ok((samples, columns.to_dtype(DType::F32)?.contiguous()?))
    }
}

/// im2col over a `(batch, channels, height, width)` input.
///
/// Row order is `channel * kh * kw + ki * kw + kj` (matching a flattened
/// `(out, in, kh, kw)` weight); column order is batch-major over output
/// positions.
fn unfold_2d(
    input: &Tensor,
    kernel: (usize, usize),
    padding: (usize, usize),
    stride: (usize, usize),
    dilation: (usize, usize),
) -> crate::Result<Tensor> {
    let (batch, channels, height, width) = input.dims4()?;
    let (kh, kw) = kernel;
    let span_h = dilation.0 * (kh - 1) + 1;
    let span_w = dilation.1 * (kw - 1) + 1;
    if height + 2 * padding.0 < span_h || width + 2 * padding.1 < span_w {
        return Err(GptqError::Config(format!(
            "input {}x{} smaller than kernel span {}x{}",
            height, width, span_h, span_w
        )));
    }
    let out_h = (height + 2 * padding.0 - span_h) / stride.0 + 1;
    let out_w = (width + 2 * padding.1 - span_w) / stride.1 + 1;
    let positions = out_h * out_w;

    let data: Vec<f32> = input.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let rows = channels * kh * kw;
    let cols = batch * positions;
    let mut out = vec![0f32; rows * cols];

    for b in 0..batch {
        for c in 0..channels {
            let plane = &data[(b * channels + c) * height * width..][..height * width];
            for ki in 0..kh {
                for kj in 0..kw {
                    let row = (c * kh + ki) * kw + kj;
                    let dst = &mut out[row * cols + b * positions..][..positions];
                    for oy in 0..out_h {
                        let y = (oy * stride.0 + ki * dilation.0) as isize - padding.0 as isize;
                        if y < 0 || y >= height as isize {
                            continue;
                        }
                        for ox in 0..out_w {
                            let x = (ox * stride.1 + kj * dilation.1) as isize - padding.1 as isize;
                            if x < 0 || x >= width as isize {
                                continue;
                            }
                            dst[oy * out_w + ox] = plane[y as usize * width + x as usize];
                        }
                    }
                }
            }
        }
    }

    Ok(Tensor::from_vec(out, (rows, cols), input.device())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_linear_matrix_and_columns() {
        let w = Tensor::arange(0f32, 6., &Device::Cpu).unwrap().reshape((2, 3)).unwrap();
        let layer = Layer::Linear(Linear::new(w, None).unwrap());
        assert_eq!(layer.matrix_shape(), (2, 3));

        let x = Tensor::ones((2, 5, 3), DType::F32, &Device::Cpu).unwrap();
        let (samples, cols) = layer.input_columns(&x).unwrap();
        assert_eq!(samples, 2);
        assert_eq!(cols.dims(), &[3, 10]);
    }

    #[test]
    fn test_conv1d_transposed_roundtrip_shape() {
        let w = Tensor::arange(0f32, 12., &Device::Cpu).unwrap().reshape((3, 4)).unwrap();
        let layer = Layer::Conv1D(Conv1D::new(w.clone(), None).unwrap());
        assert_eq!(layer.matrix_shape(), (4, 3));
        assert_eq!(layer.kind_name(), "transposed_conv1d");

        let m = layer.weight_matrix().unwrap();
        assert_eq!(m.dims(), &[4, 3]);
        let back = layer.matrix_to_weight(&m, &w).unwrap();
        assert_eq!(back.to_vec2::<f32>().unwrap(), w.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_conv1d_forward_matches_matmul() {
        let w = Tensor::arange(0f32, 6., &Device::Cpu).unwrap().reshape((3, 2)).unwrap();
        let b = Tensor::new(&[1f32, -1.], &Device::Cpu).unwrap();
        let layer = Layer::Conv1D(Conv1D::new(w, Some(b)).unwrap());

        let x = Tensor::new(&[[1f32, 0., 0.]], &Device::Cpu).unwrap();
        let y = layer.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(y, vec![vec![1.0, 0.0]]);
    }

    #[test]
    fn test_conv2d_unfold_matches_forward() {
        let device = Device::Cpu;
        let w = Tensor::arange(0f32, 2. * 2. * 3. * 3., &device)
            .unwrap()
            .reshape((2, 2, 3, 3))
            .unwrap();
        let config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let layer = Layer::Conv(Conv::new_2d(w, None, config).unwrap());
        assert_eq!(layer.matrix_shape(), (2, 18));
        assert_eq!(layer.kind_name(), "conv2d");

        let x = Tensor::arange(0f32, 2. * 2. * 4. * 4., &device)
            .unwrap()
            .reshape((2, 2, 4, 4))
            .unwrap();
        let (samples, cols) = layer.input_columns(&x).unwrap();
        assert_eq!(samples, 2);
        assert_eq!(cols.dims(), &[18, 32]);

        // W_matrix @ cols reproduces the convolution output
        let via_unfold = layer.weight_matrix().unwrap().matmul(&cols).unwrap();
        let direct = layer
            .forward(&x)
            .unwrap()
            .permute((1, 0, 2, 3))
            .unwrap()
            .reshape((2, 32))
            .unwrap();
        let diff = (via_unfold - direct)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-3, "unfold mismatch: {}", diff);
    }

    #[test]
    fn test_grouped_conv_rejected() {
        let w = Tensor::zeros((4, 1, 3), DType::F32, &Device::Cpu).unwrap();
        let config = Conv1dConfig {
            groups: 2,
            ..Default::default()
        };
        let layer = Layer::Conv(Conv::new_1d(w, None, config).unwrap());
        assert_eq!(layer.kind_name(), "conv1d");
        assert!(layer.check_quantizable().is_err());
    }
}
