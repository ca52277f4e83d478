//! Device and data type utilities.

use candle_core::{DType as CandleDType, Device as CandleDevice};

/// Re-export candle Device for convenience
pub type Device = CandleDevice;

/// Re-export candle DType for convenience
pub type DType = CandleDType;

#[cfg(feature = "cuda")]
fn cuda_device(ordinal: usize) -> Option<Device> {
    match CandleDevice::new_cuda(ordinal) {
        Ok(device) => Some(device),
        Err(e) => {
            tracing::warn!("CUDA device {} unavailable: {}", ordinal, e);
            None
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn cuda_device(_ordinal: usize) -> Option<Device> {
    None
}

#[cfg(feature = "metal")]
fn metal_device(ordinal: usize) -> Option<Device> {
    match CandleDevice::new_metal(ordinal) {
        Ok(device) => Some(device),
        Err(e) => {
            tracing::warn!("Metal device {} unavailable: {}", ordinal, e);
            None
        }
    }
}

#[cfg(not(feature = "metal"))]
fn metal_device(_ordinal: usize) -> Option<Device> {
    None
}

/// Compute device for quantization: the requested accelerator ordinal
/// (default 0) on CUDA, then Metal, falling back to the host.
pub fn get_device(device_id: Option<usize>) -> crate::Result<Device> {
    let ordinal = device_id.unwrap_or(0);
    let device = cuda_device(ordinal)
        .or_else(|| metal_device(ordinal))
        .unwrap_or(CandleDevice::Cpu);
    tracing::info!("Quantizing on {:?}", device.location());
    Ok(device)
}

/// Dtype used for weight-difference diagnostics.
///
/// Takes the wider of the two float dtypes and promotes 16-bit formats to F32
/// so the diagnostic never narrows precision.
pub fn diff_dtype(original: DType, quantized: DType) -> DType {
    let wider = if quantized.size_in_bytes() > original.size_in_bytes() {
        quantized
    } else {
        original
    };
    match wider {
        DType::F64 => DType::F64,
        _ => DType::F32,
    }
}
