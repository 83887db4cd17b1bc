//! Batches of freed blocks waiting for the GPU to finish using them.
use core::mem;
use core::time::Duration;

use crate::device::{BufferPtr, FencePtr};
use crate::segregated::ChunkId;
use crate::GpuMemoryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GarbageEntry {
    pub chunk: ChunkId,
    pub offset: u64,
    pub size: u64,
}

#[derive(Default)]
struct GarbageBatch {
    entries: Vec<GarbageEntry>,
    /// Buffers replaced by a grown copy. Dropped when the batch is reclaimed.
    buffers: Vec<BufferPtr>,
    fence: Option<FencePtr>,
}

impl GarbageBatch {
    fn bytes(&self) -> u64 {
        self.entries.iter().map(|entry| entry.size).sum::<u64>() + self.buffers.iter().map(|buffer| buffer.size()).sum::<u64>()
    }
}

/// Holds freed blocks in an open batch until `end_frame` seals it with a
/// fence, and hands them back once that fence has signaled.
#[derive(Default)]
pub struct GarbageCollector {
    open: Option<GarbageBatch>,
    sealed: Vec<GarbageBatch>,
}

impl GarbageCollector {
    pub fn new() -> GarbageCollector {
        GarbageCollector::default()
    }

    pub fn deferred_free(&mut self, entry: GarbageEntry) {
        self.open.get_or_insert_with(GarbageBatch::default).entries.push(entry);
    }

    /// Keeps the buffer alive until the GPU is done with the current frame.
    pub fn retire_buffer(&mut self, buffer: BufferPtr) {
        self.open.get_or_insert_with(GarbageBatch::default).buffers.push(buffer);
    }

    /// Passes the entries of every batch whose fence has signaled to
    /// `reclaim`, and then seals the open batch with `fence`.
    pub fn end_frame(&mut self, fence: FencePtr, mut reclaim: impl FnMut(GarbageEntry)) {
        profiling::scope!("garbage collection");
        let (done, pending): (Vec<GarbageBatch>, Vec<GarbageBatch>) = mem::take(&mut self.sealed)
            .into_iter()
            .partition(|batch| batch.fence.as_ref().map_or(true, |fence| fence.signaled()));
        self.sealed = pending;
        for batch in done {
            log::trace!("reclaiming a garbage batch of {} blocks", batch.entries.len());
            batch.entries.into_iter().for_each(&mut reclaim);
        }

        if let Some(mut open) = self.open.take() {
            open.fence = Some(fence);
            self.sealed.push(open);
        }
    }

    /// Waits for the sealed batches and reclaims everything. The device is
    /// expected to be idle already, so waiting should not take long. The open
    /// batch is reclaimed without waiting.
    pub fn teardown(&mut self, timeout: Duration, identifier: &str, mut reclaim: impl FnMut(GarbageEntry)) -> Result<(), GpuMemoryError> {
        profiling::scope!("garbage collector teardown");
        for batch in mem::take(&mut self.sealed) {
            if let Some(fence) = &batch.fence {
                if !fence.wait(timeout) {
                    log::error!("{identifier}: a garbage batch's fence was not signaled in {timeout:?} during teardown");
                    return Err(GpuMemoryError::Timeout {
                        identifier: identifier.to_string(),
                        timeout,
                    });
                }
            }
            batch.entries.into_iter().for_each(&mut reclaim);
        }
        if let Some(open) = self.open.take() {
            open.entries.into_iter().for_each(&mut reclaim);
        }
        Ok(())
    }

    /// Bytes freed or retired but not yet reclaimed.
    pub fn pending_bytes(&self) -> u64 {
        self.open.iter().chain(&self.sealed).map(GarbageBatch::bytes).sum()
    }

    pub fn sealed_batch_count(&self) -> usize {
        self.sealed.len()
    }

    pub fn has_open_batch(&self) -> bool {
        self.open.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::GpuFence;
    use crate::SimulatedFence;
    use alloc::sync::Arc;

    fn entry(offset: u64) -> GarbageEntry {
        GarbageEntry {
            chunk: ChunkId(0),
            offset,
            size: 64,
        }
    }

    #[test]
    fn batches_wait_for_their_fence() {
        let mut gc = GarbageCollector::new();
        let mut reclaimed = Vec::new();
        gc.deferred_free(entry(0));
        gc.deferred_free(entry(64));
        assert_eq!(128, gc.pending_bytes());

        let first = Arc::new(SimulatedFence::new());
        gc.end_frame(first.clone(), |entry| reclaimed.push(entry.offset));
        assert!(reclaimed.is_empty());
        assert!(!gc.has_open_batch());
        assert_eq!(1, gc.sealed_batch_count());

        gc.deferred_free(entry(128));
        let second = Arc::new(SimulatedFence::new());
        gc.end_frame(second.clone(), |entry| reclaimed.push(entry.offset));
        assert!(reclaimed.is_empty());

        first.signal();
        gc.end_frame(Arc::new(SimulatedFence::new()), |entry| reclaimed.push(entry.offset));
        assert_eq!(vec![0, 64], reclaimed);
        assert_eq!(1, gc.sealed_batch_count());
        assert_eq!(64, gc.pending_bytes());
    }

    #[test]
    fn empty_frames_do_not_create_batches() {
        let mut gc = GarbageCollector::new();
        gc.end_frame(Arc::new(SimulatedFence::new()), |_| unreachable!());
        assert_eq!(0, gc.sealed_batch_count());
    }

    #[test]
    fn teardown_reclaims_everything_or_times_out() {
        let mut gc = GarbageCollector::new();
        let mut reclaimed = 0;
        gc.deferred_free(entry(0));
        gc.end_frame(Arc::new(SimulatedFence::signaled_fence()), |_| {});
        gc.deferred_free(entry(64));
        gc.teardown(Duration::from_millis(1), "test", |_| reclaimed += 1).unwrap();
        assert_eq!(2, reclaimed);
        assert_eq!(0, gc.pending_bytes());

        let fence = Arc::new(SimulatedFence::new());
        gc.deferred_free(entry(0));
        gc.end_frame(fence.clone(), |_| {});
        let result = gc.teardown(Duration::from_millis(1), "test", |_| {});
        assert!(matches!(result, Err(GpuMemoryError::Timeout { .. })));
        assert!(!fence.signaled());
    }
}
