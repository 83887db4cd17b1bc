//! Thread-safe pools built on [`SegregatedListsBuilder`], with frees deferred
//! until the GPU is done with the memory.
use alloc::sync::{Arc, Weak};
use bytemuck::Pod;
use core::ptr::{self, NonNull};
use core::time::Duration;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::device::{BufferView, FencePtr, GpuDevice};
use crate::segregated::{ChunkHost, ChunkId, ChunkLocation, SegregatedListsBuilder};
use crate::{Bytes, GpuMemoryError};

pub(crate) mod garbage;

use garbage::{GarbageCollector, GarbageEntry};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolStats {
    pub allocated_bytes: u64,
    pub total_capacity_bytes: u64,
    /// Unallocated share of the capacity, from 0 to 1.
    pub external_fragmentation: f32,
    pub chunk_count: usize,
    pub live_allocations: usize,
    /// Freed bytes waiting for the GPU to finish with them.
    pub pending_garbage_bytes: u64,
    pub sealed_batches: usize,
}

struct PoolState<H: ChunkHost> {
    builder: SegregatedListsBuilder<H>,
    garbage: GarbageCollector,
    live_allocations: usize,
}

struct PoolInner<H: ChunkHost> {
    state: Mutex<PoolState<H>>,
    device: Arc<dyn GpuDevice>,
    identifier: String,
    fence_timeout: Duration,
}

impl<H: ChunkHost> PoolInner<H> {
    fn lock(&self) -> MutexGuard<PoolState<H>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reclaims all garbage and releases every chunk. The device must be idle.
    fn release_memory(&self) -> Result<(), GpuMemoryError> {
        profiling::scope!("pool memory release");
        let mut state = self.lock();
        let PoolState {
            builder,
            garbage,
            live_allocations,
        } = &mut *state;
        let result = garbage.teardown(self.fence_timeout, &self.identifier, |entry| {
            builder.free_block(entry.chunk, entry.offset, entry.size, false);
        });
        if *live_allocations > 0 {
            log::warn!("{}: {live_allocations} allocations outlived the pool", self.identifier);
        }
        builder.release_all_chunks();
        result
    }
}

/// What an [`Allocation`] needs from the pool it came from, without knowing
/// the pool's host type.
trait AllocationOwner: Send + Sync {
    fn release(&self, entry: GarbageEntry);
    fn locate(&self, chunk: ChunkId) -> Option<ChunkLocation>;
}

impl<H: ChunkHost> AllocationOwner for PoolInner<H> {
    fn release(&self, entry: GarbageEntry) {
        let mut state = self.lock();
        state.live_allocations -= 1;
        state.garbage.deferred_free(entry);
    }

    fn locate(&self, chunk: ChunkId) -> Option<ChunkLocation> {
        self.lock().builder.locate(chunk)
    }
}

/// A block of a [`SegregatedPool`]. Dropping it frees the block once the
/// GPU is done with the frame it was dropped in.
#[derive(Default)]
pub struct Allocation {
    owner: Option<Weak<dyn AllocationOwner>>,
    entry: Option<GarbageEntry>,
    size: u64,
}

impl Allocation {
    /// True for [`Allocation::default`], which doesn't refer to any memory.
    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }

    /// The requested size. The block may be bigger.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn chunk(&self) -> Option<ChunkId> {
        self.entry.map(|entry| entry.chunk)
    }

    fn location(&self) -> Option<(ChunkLocation, GarbageEntry)> {
        let entry = self.entry?;
        let owner = self.owner.as_ref()?.upgrade()?;
        Some((owner.locate(entry.chunk)?, entry))
    }

    /// The allocated range of the pool's buffer. None if the allocation is
    /// empty or the pool has been torn down.
    ///
    /// The buffer of a growable pool changes when it grows, so views should
    /// be fetched again each frame instead of stored.
    pub fn buffer_view(&self) -> Option<BufferView> {
        let (location, entry) = self.location()?;
        Some(BufferView {
            buffer: location.buffer,
            offset: location.base_offset + entry.offset,
            size: self.size,
        })
    }

    /// Pointer to the start of the allocation, for pools with mapped memory.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        let (location, entry) = self.location()?;
        let base = location.buffer.mapped_ptr()?;
        let offset = usize::try_from(location.base_offset + entry.offset).ok()?;
        // Safety: the offset is inside the mapped buffer, which is as large as the chunks it hosts.
        NonNull::new(unsafe { base.as_ptr().add(offset) })
    }

    /// Copies `data` to the start of the allocation.
    pub fn write<T: Pod>(&mut self, data: &[T]) -> Result<(), GpuMemoryError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let not_writable = GpuMemoryError::NotWritable(Bytes(bytes.len() as u64));
        if bytes.len() as u64 > self.size {
            return Err(not_writable);
        }
        let dst = self.mapped_ptr().ok_or(not_writable)?;
        // Safety: the range is inside this allocation, which no other allocation overlaps.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len()) };
        Ok(())
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if let (Some(entry), Some(owner)) = (self.entry.take(), self.owner.take().and_then(|owner| owner.upgrade())) {
            owner.release(entry);
        }
    }
}

/// A pool of GPU memory allocations, carved out of chunks provided by `H`.
/// Every method can be called from many threads at once.
pub struct SegregatedPool<H: ChunkHost> {
    inner: Arc<PoolInner<H>>,
    torn_down: bool,
}

impl<H: ChunkHost> SegregatedPool<H> {
    pub fn new(device: Arc<dyn GpuDevice>, host: H, fence_timeout: Duration) -> SegregatedPool<H> {
        let identifier = host.identifier().to_string();
        SegregatedPool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    builder: SegregatedListsBuilder::new(host),
                    garbage: GarbageCollector::new(),
                    live_allocations: 0,
                }),
                device,
                identifier,
                fence_timeout,
            }),
            torn_down: false,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    pub fn allocate(&self, size: u64, alignment: u64) -> Result<Allocation, GpuMemoryError> {
        profiling::scope!("pool allocation");
        if size == 0 || alignment == 0 {
            return Err(GpuMemoryError::configuration(
                &self.inner.identifier,
                format!("invalid allocation (size: {size}, alignment: {alignment})"),
            ));
        }

        let mut state = self.inner.lock();
        let block = state.builder.allocate(size, alignment)?;
        for buffer in state.builder.host_mut().take_retired_buffers() {
            state.garbage.retire_buffer(buffer);
        }
        state.live_allocations += 1;
        drop(state);

        let owner: Weak<PoolInner<H>> = Arc::downgrade(&self.inner);
        let owner: Weak<dyn AllocationOwner> = owner;
        Ok(Allocation {
            owner: Some(owner),
            entry: Some(GarbageEntry {
                chunk: block.chunk,
                offset: block.offset,
                size: block.size,
            }),
            size,
        })
    }

    /// Frees the allocation after the GPU is done with the current frame.
    /// Same as dropping it.
    pub fn deferred_free(&self, allocation: Allocation) {
        drop(allocation);
    }

    /// Reclaims the garbage of frames whose fences have signaled, and seals
    /// the memory freed since the last call behind `fence`.
    pub fn end_frame(&self, fence: FencePtr) {
        let mut state = self.inner.lock();
        let PoolState { builder, garbage, .. } = &mut *state;
        garbage.end_frame(fence, |entry| builder.free(entry.chunk, entry.offset, entry.size));
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            allocated_bytes: state.builder.allocated_bytes(),
            total_capacity_bytes: state.builder.capacity_bytes(),
            external_fragmentation: state.builder.compute_external_fragmentation(),
            chunk_count: state.builder.chunk_count(),
            live_allocations: state.live_allocations,
            pending_garbage_bytes: state.garbage.pending_bytes(),
            sealed_batches: state.garbage.sealed_batch_count(),
        }
    }

    pub fn validate(&self) -> Result<(), GpuMemoryError> {
        self.inner.lock().builder.validate()
    }

    pub fn dump_free_blocks(&self) -> String {
        self.inner.lock().builder.dump_free_blocks()
    }

    /// Runs `f` with the pool's host, e.g. to get at the buffer of a
    /// single-buffer pool.
    ///
    /// The pool is locked while `f` runs: allocating from this pool or
    /// dropping one of its allocations inside `f` deadlocks.
    pub fn with_host<R>(&self, f: impl FnOnce(&H) -> R) -> R {
        f(self.inner.lock().builder.host())
    }

    /// Waits for the device to idle and releases all memory. Allocations
    /// still alive after this point refer to nothing.
    pub fn teardown(self) -> Result<(), GpuMemoryError> {
        profiling::scope!("pool teardown");
        self.inner.device.wait_idle().map_err(GpuMemoryError::WaitIdle)?;
        self.teardown_after_idle()
    }

    pub(crate) fn teardown_after_idle(mut self) -> Result<(), GpuMemoryError> {
        self.torn_down = true;
        self.inner.release_memory()
    }
}

impl<H: ChunkHost> Drop for SegregatedPool<H> {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        if let Err(err) = self.inner.device.wait_idle() {
            log::error!("{}: device idle wait failed while dropping the pool: {err}", self.inner.identifier);
        }
        if let Err(err) = self.inner.release_memory() {
            log::error!("{}: releasing the pool's memory failed: {err}", self.inner.identifier);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BufferUsage, MapAccess};
    use crate::{MultiChunkConfig, MultiChunkHost, SimulatedDevice, SimulatedFence};

    fn pool(device: &SimulatedDevice, map_access: MapAccess) -> SegregatedPool<MultiChunkHost> {
        let config = MultiChunkConfig {
            chunk_size: 4096,
            max_chunks: 2,
            size_classes: vec![256, 1024, 4096],
            min_alignment: 16,
            usage: BufferUsage::STORAGE_BUFFER,
            map_access,
            retained_empty_chunks: 1,
        };
        let host = MultiChunkHost::new(Arc::new(device.clone()), config, "test pool").unwrap();
        SegregatedPool::new(Arc::new(device.clone()), host, Duration::from_millis(100))
    }

    #[test]
    fn dropped_allocations_are_reused_after_the_fence() {
        let device = SimulatedDevice::new();
        let pool = pool(&device, MapAccess::None);
        let a = pool.allocate(4096, 1).unwrap();
        let _b = pool.allocate(4096, 1).unwrap();
        assert!(matches!(pool.allocate(16, 1), Err(GpuMemoryError::OutOfMemory { .. })));

        let a_view = a.buffer_view().unwrap();
        pool.deferred_free(a);
        assert_eq!(1, pool.stats().live_allocations);
        assert_eq!(4096, pool.stats().pending_garbage_bytes);
        let fence = device.create_fence();
        pool.end_frame(fence.clone());
        // Not reclaimed until the fence is signaled.
        pool.end_frame(device.create_fence());
        assert!(pool.allocate(16, 1).is_err());

        fence.signal();
        pool.end_frame(device.create_fence());
        // Only one empty chunk is retained, so a's chunk was deleted, and had to wait for idle.
        assert_eq!(1, device.wait_idle_count());
        assert_eq!(1, pool.stats().chunk_count);
        let c = pool.allocate(4096, 1).unwrap();
        assert_ne!(a_view.buffer.handle(), c.buffer_view().unwrap().buffer.handle());
        pool.validate().unwrap();
    }

    #[test]
    fn writes_go_to_mapped_memory() {
        let device = SimulatedDevice::new();
        let pool = pool(&device, MapAccess::Write);
        let _padding = pool.allocate(32, 1).unwrap();
        let mut allocation = pool.allocate(8, 1).unwrap();
        allocation.write(&[1u32, 2]).unwrap();
        assert!(matches!(allocation.write(&[0u32; 3]), Err(GpuMemoryError::NotWritable(_))));

        let view = allocation.buffer_view().unwrap();
        assert_eq!(32, view.offset);
        let data = device.read_buffer(view.buffer.handle(), view.offset, 8).unwrap();
        assert_eq!(bytemuck::cast_slice::<u32, u8>(&[1, 2]), &data[..]);

        let unmapped_pool = self::pool(&device, MapAccess::None);
        let mut unmapped = unmapped_pool.allocate(8, 1).unwrap();
        assert!(matches!(unmapped.write(&[1u32]), Err(GpuMemoryError::NotWritable(_))));
    }

    #[test]
    fn invalid_requests_are_configuration_errors() {
        let device = SimulatedDevice::new();
        let pool = pool(&device, MapAccess::None);
        assert!(matches!(pool.allocate(0, 16), Err(GpuMemoryError::Configuration { .. })));
        assert!(matches!(pool.allocate(16, 0), Err(GpuMemoryError::Configuration { .. })));
        assert!(matches!(pool.allocate(8192, 16), Err(GpuMemoryError::Configuration { .. })));
        assert!(matches!(pool.allocate(u64::MAX - 10, 1), Err(GpuMemoryError::Configuration { .. })));
        assert!(matches!(pool.allocate(64, u64::MAX), Err(GpuMemoryError::Configuration { .. })));
        assert_eq!(0, pool.stats().live_allocations);
    }

    #[test]
    fn empty_allocations_free_nothing() {
        let device = SimulatedDevice::new();
        let pool = pool(&device, MapAccess::None);
        let empty = Allocation::default();
        assert!(empty.is_empty());
        assert!(empty.buffer_view().is_none());
        pool.deferred_free(empty);
        pool.end_frame(Arc::new(SimulatedFence::new()));
        assert_eq!(0, pool.stats().sealed_batches);
    }

    #[test]
    fn teardown_releases_everything() {
        let device = SimulatedDevice::new();
        let pool = pool(&device, MapAccess::None);
        let kept = pool.allocate(100, 1).unwrap();
        let freed = pool.allocate(100, 1).unwrap();
        drop(freed);
        pool.end_frame(device.create_fence());
        assert_eq!(4096, device.allocated_bytes());
        pool.teardown().unwrap();
        assert_eq!(0, device.allocated_bytes());
        assert!(kept.buffer_view().is_none());
    }
}
