//! Memory management utilities.

/// Memory usage snapshot used for the per-layer time series.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemoryStats {
    /// GPU memory allocated (bytes)
    pub gpu_allocated: usize,
    /// CPU memory used by this process (bytes)
    pub cpu_used: usize,
}

impl MemoryStats {
    /// Sample the current process memory usage.
    ///
    /// Host usage is read from `/proc/self/status` on Linux; candle exposes no
    /// allocator statistics for GPU devices, so `gpu_allocated` stays zero.
    pub fn current() -> Self {
        Self {
            gpu_allocated: 0,
            cpu_used: resident_set_size().unwrap_or(0),
        }
    }

    pub fn gpu_gb(&self) -> f64 {
        self.gpu_allocated as f64 / GB as f64
    }

    pub fn cpu_gb(&self) -> f64 {
        self.cpu_used as f64 / GB as f64
    }
}

#[cfg(target_os = "linux")]
fn resident_set_size() -> Option<usize> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: usize = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * KB as usize)
}

#[cfg(not(target_os = "linux"))]
fn resident_set_size() -> Option<usize> {
    None
}

/// Clean up memory between layers.
///
/// Tensors are freed when dropped; this additionally asks the allocator to
/// return freed pages to the OS.
pub fn clean_memory() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        extern "C" {
            fn malloc_trim(pad: usize) -> i32;
        }
        unsafe {
            malloc_trim(0);
        }
    }

    #[cfg(feature = "cuda")]
    {
        tracing::trace!("Memory cleanup requested (CUDA)");
    }
}

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_current_reports_host_usage() {
        let stats = MemoryStats::current();
        assert!(stats.cpu_used > 0);
        assert_eq!(stats.gpu_allocated, 0);
    }
}
