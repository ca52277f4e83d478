//! Streamed tensor residency and per-layer transfer streams.
//!
//! A [`StreamedTensor`] is a shared, mutable tensor slot. Moving it to another
//! device through a [`DeviceStream`] queues the copy on a bounded transfer
//! pool and returns immediately; the copy reports completion over a oneshot
//! channel and is resolved the next time anyone reads the slot or when the
//! owning stream is synchronized. This lets the transfer of layer *i* overlap
//! with the compute of layer *i-1* while guaranteeing that every reader
//! observes a completed copy.

use std::fmt;
use std::sync::{Arc, OnceLock};

use candle_core::{Device, Tensor};
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tokio::sync::oneshot;

use crate::GptqError;

/// Worker count of the process-wide transfer pool.
const TRANSFER_THREADS: usize = 4;

fn build_pool(threads: usize) -> crate::Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(|i| format!("gptq-transfer-{i}"))
        .build()
        .map_err(|e| GptqError::Transfer(format!("failed to start transfer pool: {e}")))
}

fn shared_pool() -> crate::Result<Arc<ThreadPool>> {
    static POOL: OnceLock<Arc<ThreadPool>> = OnceLock::new();
    if let Some(pool) = POOL.get() {
        return Ok(pool.clone());
    }
    let pool = Arc::new(build_pool(TRANSFER_THREADS)?);
    Ok(POOL.get_or_init(|| pool).clone())
}

/// Where queued copies run.
#[derive(Debug, Clone, Default)]
enum Executor {
    #[default]
    Shared,
    Dedicated(Arc<ThreadPool>),
}

impl Executor {
    fn spawn<F>(&self, job: F) -> crate::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            Executor::Shared => shared_pool()?.spawn(job),
            Executor::Dedicated(pool) => pool.spawn(job),
        }
        Ok(())
    }
}

type PendingCopy = oneshot::Receiver<candle_core::Result<Tensor>>;

struct Slot {
    current: Tensor,
    in_flight: Option<PendingCopy>,
}

impl Slot {
    fn resolve(&mut self) -> crate::Result<()> {
        if let Some(rx) = self.in_flight.take() {
            let moved = rx
                .blocking_recv()
                .map_err(|_| GptqError::Transfer("transfer worker dropped the copy".to_string()))??;
            self.current = moved;
        }
        Ok(())
    }
}

/// Shared tensor handle whose device copies may still be in flight.
///
/// Cloning the handle shares the slot, so a write through one clone is seen
/// by every other clone. Layer parameters use this to share weights between a
/// plain layer and its hooked wrapper.
#[derive(Clone)]
pub struct StreamedTensor {
    slot: Arc<Mutex<Slot>>,
}

impl StreamedTensor {
    pub fn new(tensor: Tensor) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                current: tensor,
                in_flight: None,
            })),
        }
    }

    /// Current tensor, waiting for any pending copy first.
    pub fn get(&self) -> crate::Result<Tensor> {
        let mut slot = self.slot.lock();
        slot.resolve()?;
        Ok(slot.current.clone())
    }

    /// Replace the tensor once any pending copy has landed.
    pub fn set(&self, tensor: Tensor) -> crate::Result<()> {
        let mut slot = self.slot.lock();
        slot.resolve()?;
        slot.current = tensor;
        Ok(())
    }

    /// Block until a pending copy (if any) has landed.
    pub fn wait(&self) -> crate::Result<()> {
        self.slot.lock().resolve()
    }

    pub fn is_in_flight(&self) -> bool {
        self.slot.lock().in_flight.is_some()
    }

    /// Whether two handles share the same slot.
    pub fn ptr_eq(&self, other: &StreamedTensor) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Relocate the tensor to `device`.
    ///
    /// With a stream the copy is queued on the stream's transfer pool and
    /// registered so a later [`DeviceStream::synchronize`] can wait for it.
    /// Without a stream the copy is blocking.
    pub fn move_to(&self, device: &Device, stream: Option<&DeviceStream>) -> crate::Result<()> {
        let mut slot = self.slot.lock();
        slot.resolve()?;
        if slot.current.device().same_device(device) {
            return Ok(());
        }

        match stream {
            None => {
                slot.current = slot.current.to_device(device)?;
                Ok(())
            }
            Some(stream) => {
                drop(slot);
                self.queue_copy(device, stream)
            }
        }
    }

    /// Queue a copy to `device` on `stream`, even when the tensor already
    /// lives there.
    pub(crate) fn queue_copy(&self, device: &Device, stream: &DeviceStream) -> crate::Result<()> {
        let mut slot = self.slot.lock();
        slot.resolve()?;

        let (tx, rx) = oneshot::channel();
        let tensor = slot.current.clone();
        let target = device.clone();
        stream.executor.spawn(move || {
            // receiver gone means the slot was dropped; nothing to report
            let _ = tx.send(tensor.to_device(&target));
        })?;
        slot.in_flight = Some(rx);
        drop(slot);

        stream.record(self.clone());
        tracing::trace!("Queued transfer to {:?}", device);
        Ok(())
    }
}

impl fmt::Debug for StreamedTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("StreamedTensor")
            .field("shape", &slot.current.dims())
            .field("dtype", &slot.current.dtype())
            .field("in_flight", &slot.in_flight.is_some())
            .finish()
    }
}

/// Execution stream scoped to one layer: tracks the transfers issued through
/// it so they can be awaited as a group.
pub struct DeviceStream {
    device: Device,
    executor: Executor,
    pending: Mutex<Vec<StreamedTensor>>,
}

impl DeviceStream {
    /// Stream whose copies run on the process-wide transfer pool
    pub fn new(device: Device) -> Self {
        Self::with_executor(device, Executor::Shared)
    }

    fn with_executor(device: Device, executor: Executor) -> Self {
        Self {
            device,
            executor,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn record(&self, tensor: StreamedTensor) {
        self.pending.lock().push(tensor);
    }

    /// Number of transfers issued since the last synchronization.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Wait for every transfer issued through this stream.
    pub fn synchronize(&self) -> crate::Result<()> {
        let pending: Vec<StreamedTensor> = std::mem::take(&mut *self.pending.lock());
        for tensor in pending {
            tensor.wait()?;
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceStream")
            .field("device", &self.device)
            .field("pending", &self.pending())
            .finish()
    }
}

/// Registry of every stream created during a pass, used for the global sync
/// barrier before dependent reads.
#[derive(Debug, Default)]
pub struct StreamPool {
    executor: Executor,
    streams: Mutex<Vec<Arc<DeviceStream>>>,
}

impl StreamPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool whose streams share a dedicated transfer pool of `threads` workers
    pub fn with_threads(threads: usize) -> crate::Result<Self> {
        Ok(Self {
            executor: Executor::Dedicated(Arc::new(build_pool(threads)?)),
            streams: Mutex::new(Vec::new()),
        })
    }

    /// Create a fresh stream targeting `device`.
    pub fn create(&self, device: &Device) -> Arc<DeviceStream> {
        let stream = Arc::new(DeviceStream::with_executor(device.clone(), self.executor.clone()));
        self.streams.lock().push(stream.clone());
        stream
    }

    /// Block until all outstanding transfers on all streams have completed.
    pub fn synchronize_all(&self) -> crate::Result<()> {
        let streams: Vec<Arc<DeviceStream>> = self.streams.lock().clone();
        for stream in streams {
            stream.synchronize()?;
        }
        Ok(())
    }

    /// Drop streams that have no pending work.
    pub fn prune(&self) {
        self.streams.lock().retain(|s| s.pending() > 0);
    }

    /// Number of registered streams.
    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_set_visible_through_clones() {
        let a = StreamedTensor::new(Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap());
        let b = a.clone();
        b.set(Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap()).unwrap();

        let v: Vec<Vec<f32>> = a.get().unwrap().to_vec2().unwrap();
        assert_eq!(v, vec![vec![1.0, 1.0], vec![1.0, 1.0]]);
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn test_same_device_move_is_noop() {
        let stream = DeviceStream::new(Device::Cpu);
        let t = StreamedTensor::new(Tensor::ones(4, DType::F32, &Device::Cpu).unwrap());
        t.move_to(&Device::Cpu, Some(&stream)).unwrap();

        assert!(!t.is_in_flight());
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn test_queued_copy_resolves_on_read() {
        let stream = DeviceStream::new(Device::Cpu);
        let t = StreamedTensor::new(Tensor::new(&[1f32, 2., 3.], &Device::Cpu).unwrap());
        t.queue_copy(&Device::Cpu, &stream).unwrap();
        assert!(t.is_in_flight());
        assert_eq!(stream.pending(), 1);

        assert_eq!(t.get().unwrap().to_vec1::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
        assert!(!t.is_in_flight());
        stream.synchronize().unwrap();
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn test_set_waits_for_queued_copy() {
        let stream = DeviceStream::new(Device::Cpu);
        let t = StreamedTensor::new(Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap());
        t.queue_copy(&Device::Cpu, &stream).unwrap();
        t.set(Tensor::ones(2, DType::F32, &Device::Cpu).unwrap()).unwrap();

        // the landed copy must not overwrite the newer value
        assert!(!t.is_in_flight());
        stream.synchronize().unwrap();
        assert_eq!(t.get().unwrap().to_vec1::<f32>().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_dedicated_pool_bounds_many_copies() {
        let pool = StreamPool::with_threads(2).unwrap();
        let tensors: Vec<StreamedTensor> = (0..64)
            .map(|i| StreamedTensor::new(Tensor::full(i as f32, 8, &Device::Cpu).unwrap()))
            .collect();
        for chunk in tensors.chunks(16) {
            let stream = pool.create(&Device::Cpu);
            for t in chunk {
                t.queue_copy(stream.device(), &stream).unwrap();
            }
            assert_eq!(stream.pending(), 16);
        }
        assert_eq!(pool.len(), 4);

        pool.synchronize_all().unwrap();
        pool.prune();
        assert!(pool.is_empty());
        for (i, t) in tensors.iter().enumerate() {
            assert!(!t.is_in_flight());
            assert_eq!(t.get().unwrap().to_vec1::<f32>().unwrap(), vec![i as f32; 8]);
        }
    }

    #[test]
    fn test_pool_synchronize_clears_pending() {
        let pool = StreamPool::new();
        let stream = pool.create(&Device::Cpu);
        let t = StreamedTensor::new(Tensor::ones(4, DType::F32, &Device::Cpu).unwrap());
        t.move_to(stream.device(), Some(&stream)).unwrap();

        pool.synchronize_all().unwrap();
        assert_eq!(stream.pending(), 0);
        assert_eq!(t.get().unwrap().dims(), &[4]);
    }
}
