//! Utility modules for devices, memory, transfer streams and logging.

mod device;
mod memory;
mod stream;

pub use device::{diff_dtype, get_device, DType, Device};
pub use memory::{clean_memory, MemoryStats};
pub use stream::{DeviceStream, StreamPool, StreamedTensor};

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (e.g. `"rs_gptqmodel=info"`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(default_directive: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
