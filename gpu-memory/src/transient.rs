//! A ring buffer for data that only lives for one frame: uniforms, instance
//! data, staging for small uploads, and so on.
//!
//! Allocation is a single atomic add on the cursor. Each frame's range of
//! the ring is tagged with the fence passed to [`TransientRingBuffer::end_frame`],
//! and allocations that come around to a range still in use by the GPU wait
//! for its fence.
use alloc::sync::Arc;
use arrayvec::ArrayVec;
use bytemuck::Pod;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;

use crate::device::{BufferInfo, BufferPtr, BufferUsage, BufferView, FencePtr, GpuDevice, MapAccess};
use crate::{Bytes, GpuMemoryError};

/// The amount of frame ranges tracked at once. A frame uses one or two (when
/// it wraps around the end of the buffer), and the current frame one.
pub const MAX_FRAME_SLICES: usize = 8;

#[derive(Debug, Clone)]
pub struct TransientConfig {
    pub size: u64,
    pub usage: BufferUsage,
    pub fence_timeout: Duration,
}

impl Default for TransientConfig {
    fn default() -> Self {
        TransientConfig {
            size: 32 * 1024 * 1024,
            usage: BufferUsage::UNIFORM_BUFFER
                | BufferUsage::STORAGE_BUFFER
                | BufferUsage::VERTEX_BUFFER
                | BufferUsage::INDEX_BUFFER
                | BufferUsage::TRANSFER_SRC,
            fence_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransientStats {
    pub buffer_size: u64,
    /// Bytes reserved since the last `end_frame`.
    pub frame_bytes: u64,
    /// Bytes of previous frames the GPU may still be reading.
    pub in_flight_bytes: u64,
    pub active_slices: usize,
    /// How many times an allocation had to wait for the GPU.
    pub fence_waits: u64,
}

#[derive(Clone, Default)]
struct FrameSlice {
    /// Offset in the buffer.
    start: u64,
    range: u64,
    fence: Option<FencePtr>,
    active: bool,
    frame: u64,
}

impl FrameSlice {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.start + self.range
    }
}

/// A host-mapped pointer and the range of the buffer it points to.
pub struct TransientAllocation {
    ptr: NonNull<u8>,
    view: BufferView,
}

// The pointer is only used to write the allocation's own range.
unsafe impl Send for TransientAllocation {}
unsafe impl Sync for TransientAllocation {}

impl TransientAllocation {
    pub fn view(&self) -> &BufferView {
        &self.view
    }

    pub fn into_view(self) -> BufferView {
        self.view
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn size(&self) -> u64 {
        self.view.size
    }

    /// Copies `data` to the start of the allocation.
    pub fn write<T: Pod>(&mut self, data: &[T]) -> Result<(), GpuMemoryError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as u64 > self.view.size {
            return Err(GpuMemoryError::NotWritable(Bytes(bytes.len() as u64)));
        }
        // Safety: the range is inside this allocation, which the ring doesn't hand out again this frame.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr(), bytes.len()) };
        Ok(())
    }
}

pub struct TransientRingBuffer {
    device: Arc<dyn GpuDevice>,
    buffer: BufferPtr,
    mapped: NonNull<u8>,
    size: u64,
    identifier: String,
    fence_timeout: Duration,
    /// Total bytes ever reserved. The position in the buffer is this modulo
    /// the buffer size.
    cursor: AtomicU64,
    /// The end of the furthest successful reservation, in the same units as
    /// the cursor. Failed reservations move the cursor but not this.
    reserved_end: AtomicU64,
    /// The cursor at the start of the current frame.
    frame_start: u64,
    frame: u64,
    slices: [FrameSlice; MAX_FRAME_SLICES],
    current: usize,
    fence_waits: AtomicU64,
    torn_down: bool,
}

// The mapped pointer is only written through the disjoint ranges handed out by allocate.
unsafe impl Send for TransientRingBuffer {}
unsafe impl Sync for TransientRingBuffer {}

impl TransientRingBuffer {
    pub fn new(device: Arc<dyn GpuDevice>, config: &TransientConfig, identifier: &str) -> Result<TransientRingBuffer, GpuMemoryError> {
        if config.size == 0 {
            return Err(GpuMemoryError::configuration(identifier, "the ring buffer size can't be 0"));
        }
        let buffer = device
            .create_buffer(&BufferInfo {
                size: config.size,
                usage: config.usage,
                map_access: MapAccess::Write,
                name: identifier,
            })
            .map_err(|err| GpuMemoryError::BufferCreation(err, identifier.to_string(), Bytes(config.size)))?;
        let mapped = buffer.map().map_err(|err| GpuMemoryError::Map(err, identifier.to_string()))?;
        log::trace!("{identifier} created ({})", Bytes(config.size));

        let mut slices: [FrameSlice; MAX_FRAME_SLICES] = Default::default();
        slices[0].active = true;
        Ok(TransientRingBuffer {
            device,
            buffer,
            mapped,
            size: config.size,
            identifier: identifier.to_string(),
            fence_timeout: config.fence_timeout,
            cursor: AtomicU64::new(0),
            reserved_end: AtomicU64::new(0),
            frame_start: 0,
            frame: 0,
            slices,
            current: 0,
            fence_waits: AtomicU64::new(0),
            torn_down: false,
        })
    }

    pub fn buffer(&self) -> &BufferPtr {
        &self.buffer
    }

    /// Reserves `size` bytes aligned to `alignment`, valid until the GPU is
    /// done with the current frame. Blocks if the ring has come around to
    /// memory the GPU might still be reading.
    pub fn allocate(&self, size: u64, alignment: u64) -> Result<TransientAllocation, GpuMemoryError> {
        profiling::scope!("transient allocation");
        if size == 0 || alignment == 0 {
            return Err(GpuMemoryError::configuration(
                &self.identifier,
                format!("invalid allocation (size: {size}, alignment: {alignment})"),
            ));
        }
        let reservation = match size.checked_add(alignment) {
            Some(reservation) if reservation < self.size => reservation,
            _ => {
                return Err(GpuMemoryError::configuration(
                    &self.identifier,
                    format!("{} (aligned to {alignment}) can't fit in a ring buffer of {}", Bytes(size), Bytes(self.size)),
                ));
            }
        };

        loop {
            let reserved = self.cursor.fetch_add(reservation, Ordering::Relaxed);
            let frame_bytes = reserved + reservation - self.frame_start;
            if frame_bytes > self.size {
                // This frame would start overwriting its own allocations.
                let reserved_end = self.reserved_end.load(Ordering::Relaxed);
                return Err(GpuMemoryError::OutOfMemory {
                    identifier: self.identifier.clone(),
                    used: Bytes(reserved_end.saturating_sub(self.frame_start)),
                    capacity: Bytes(self.size),
                    required: Bytes(reservation),
                });
            }

            let start = reserved % self.size;
            let end = (start + reservation) % self.size;
            if end <= start {
                // Wrapped around, the tail end of the buffer is skipped. The
                // skipped bytes still end up in this frame's range.
                self.wait_for_overlapping_slices(start, self.size)?;
                self.wait_for_overlapping_slices(0, end)?;
                continue;
            }

            self.wait_for_overlapping_slices(start, end)?;
            self.reserved_end.fetch_max(reserved + reservation, Ordering::Relaxed);
            let offset = start.next_multiple_of(alignment);
            debug_assert!(offset + size <= end);
            // Safety: offset + size is inside the buffer, which is mapped.
            let ptr = unsafe { NonNull::new_unchecked(self.mapped.as_ptr().add(offset as usize)) };
            return Ok(TransientAllocation {
                ptr,
                view: BufferView {
                    buffer: self.buffer.clone(),
                    offset,
                    size,
                },
            });
        }
    }

    fn wait_for_overlapping_slices(&self, start: u64, end: u64) -> Result<(), GpuMemoryError> {
        for (i, slice) in self.slices.iter().enumerate() {
            if i == self.current || !slice.active || !slice.overlaps(start, end) {
                continue;
            }
            let Some(fence) = &slice.fence else { continue };
            if fence.signaled() {
                continue;
            }

            log::warn!(
                "{}: waiting for the GPU to finish with frame {}'s memory, the ring buffer ({}) should be bigger",
                self.identifier,
                slice.frame,
                Bytes(self.size),
            );
            self.fence_waits.fetch_add(1, Ordering::Relaxed);
            profiling::scope!("waiting for transient memory");
            if !fence.wait(self.fence_timeout) {
                log::error!("{}: frame {}'s fence was not signaled in {:?}", self.identifier, slice.frame, self.fence_timeout);
                return Err(GpuMemoryError::Timeout {
                    identifier: self.identifier.clone(),
                    timeout: self.fence_timeout,
                });
            }
        }
        Ok(())
    }

    /// Allocates space for `data` and copies it there.
    pub fn upload_frame_data<T: Pod>(&self, data: &[T], alignment: u64) -> Result<BufferView, GpuMemoryError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut allocation = self.allocate(bytes.len() as u64, alignment)?;
        allocation.write(bytes)?;
        Ok(allocation.into_view())
    }

    /// Tags everything allocated since the previous call with `fence`, and
    /// frees the ranges of previous frames whose fences have signaled.
    pub fn end_frame(&mut self, fence: FencePtr) -> Result<(), GpuMemoryError> {
        profiling::scope!("transient end of frame");
        for (i, slice) in self.slices.iter_mut().enumerate() {
            if i != self.current && slice.active && slice.fence.as_ref().map_or(false, |fence| fence.signaled()) {
                log::trace!("{}: frame {}'s slice retired", self.identifier, slice.frame);
                *slice = FrameSlice::default();
            }
        }

        let cursor = *self.cursor.get_mut();
        let range = self.reserved_end.get_mut().saturating_sub(self.frame_start).min(self.size);
        let start = self.frame_start % self.size;
        let mut ranges = ArrayVec::<(u64, u64), 2>::new();
        if range > 0 {
            if start + range > self.size {
                ranges.push((start, self.size - start));
                ranges.push((0, range - (self.size - start)));
            } else {
                ranges.push((start, range));
            }
        }

        self.slices[self.current] = FrameSlice::default();
        for (start, range) in ranges {
            let slot = self.free_slot()?;
            self.slices[slot] = FrameSlice {
                start,
                range,
                fence: Some(fence.clone()),
                active: true,
                frame: self.frame,
            };
        }

        self.frame += 1;
        self.frame_start = cursor;
        self.current = self.free_slot()?;
        self.slices[self.current] = FrameSlice {
            start: cursor % self.size,
            range: 0,
            fence: None,
            active: true,
            frame: self.frame,
        };
        debug_assert!(self.validate_slices().is_ok(), "{:?}", self.validate_slices());
        Ok(())
    }

    /// Returns an inactive slot, waiting for the oldest frame to finish if
    /// every slot is in use.
    fn free_slot(&mut self) -> Result<usize, GpuMemoryError> {
        if let Some(slot) = self.slices.iter().position(|slice| !slice.active) {
            return Ok(slot);
        }
        let (oldest, slice) = self
            .slices
            .iter()
            .enumerate()
            .filter(|(_, slice)| slice.fence.is_some())
            .min_by_key(|(_, slice)| slice.frame)
            .ok_or_else(|| GpuMemoryError::corrupted(&self.identifier, "every frame slice is in use, but none have a fence"))?;
        if let Some(fence) = &slice.fence {
            log::warn!("{}: out of frame slices, waiting for frame {} to finish", self.identifier, slice.frame);
            if !fence.wait(self.fence_timeout) {
                return Err(GpuMemoryError::Timeout {
                    identifier: self.identifier.clone(),
                    timeout: self.fence_timeout,
                });
            }
        }
        self.slices[oldest] = FrameSlice::default();
        Ok(oldest)
    }

    /// Checks that the current slice is empty and fenceless, the others have
    /// a range and a fence and don't overlap, and inactive slots are cleared.
    pub fn validate_slices(&self) -> Result<(), GpuMemoryError> {
        let corrupted = |reason: String| Err(GpuMemoryError::corrupted(&self.identifier, reason));
        for (i, slice) in self.slices.iter().enumerate() {
            if i == self.current {
                if !slice.active || slice.range != 0 || slice.fence.is_some() {
                    return corrupted(format!("the current slice ({i}) should be active, empty, and without a fence"));
                }
            } else if slice.active {
                if slice.range == 0 || slice.fence.is_none() || slice.start + slice.range > self.size {
                    return corrupted(format!("slice {i} should have a range inside the buffer and a fence"));
                }
                let overlapping = self.slices.iter().enumerate().find(|&(j, other)| {
                    j != i && j != self.current && other.active && other.overlaps(slice.start, slice.start + slice.range)
                });
                if let Some((j, _)) = overlapping {
                    return corrupted(format!("slices {i} and {j} overlap"));
                }
            } else if slice.range != 0 || slice.start != 0 || slice.fence.is_some() {
                return corrupted(format!("inactive slice {i} has not been cleared"));
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> TransientStats {
        let reserved_end = self.reserved_end.load(Ordering::Relaxed);
        let previous_frames = self.slices.iter().enumerate().filter(|&(i, slice)| i != self.current && slice.active);
        TransientStats {
            buffer_size: self.size,
            frame_bytes: reserved_end.saturating_sub(self.frame_start).min(self.size),
            in_flight_bytes: previous_frames.clone().map(|(_, slice)| slice.range).sum(),
            active_slices: previous_frames.count() + 1,
            fence_waits: self.fence_waits.load(Ordering::Relaxed),
        }
    }

    /// Waits for the device to idle and unmaps the buffer.
    pub fn teardown(self) -> Result<(), GpuMemoryError> {
        self.device.wait_idle().map_err(GpuMemoryError::WaitIdle)?;
        self.teardown_after_idle();
        Ok(())
    }

    pub(crate) fn teardown_after_idle(mut self) {
        self.torn_down = true;
        self.buffer.unmap();
    }
}

impl Drop for TransientRingBuffer {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        if let Err(err) = self.device.wait_idle() {
            log::error!("{}: device idle wait failed while dropping the ring buffer: {err}", self.identifier);
        }
        self.buffer.unmap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::GpuFence;
    use crate::SimulatedDevice;
    use std::thread;

    fn ring(device: &SimulatedDevice, size: u64) -> TransientRingBuffer {
        ring_with_timeout(device, size, Duration::from_millis(50))
    }

    fn ring_with_timeout(device: &SimulatedDevice, size: u64, fence_timeout: Duration) -> TransientRingBuffer {
        let config = TransientConfig {
            size,
            fence_timeout,
            ..TransientConfig::default()
        };
        TransientRingBuffer::new(Arc::new(device.clone()), &config, "transient").unwrap()
    }

    #[test]
    fn allocations_are_aligned_and_sequential() {
        let device = SimulatedDevice::new();
        let ring = ring(&device, 4096);
        let a = ring.allocate(10, 16).unwrap();
        let b = ring.allocate(10, 256).unwrap();
        assert_eq!(0, a.view().offset);
        assert_eq!(256, b.view().offset);
        assert!(!a.view().overlaps(b.view()));
        assert_eq!(26 + 266, ring.stats().frame_bytes);
    }

    #[test]
    fn frames_are_split_at_the_end_of_the_buffer() {
        let device = SimulatedDevice::new();
        let mut ring = ring(&device, 1024);
        ring.allocate(700, 4).unwrap();
        let first = device.create_fence();
        ring.end_frame(first.clone()).unwrap();
        first.signal();

        // 704..1208 would wrap, so it's skipped and the next reservation starts at 1208.
        let wrapped = ring.allocate(500, 4).unwrap();
        assert_eq!(184, wrapped.view().offset);
        ring.end_frame(device.create_fence()).unwrap();
        ring.validate_slices().unwrap();
        // The first frame was retired, the second is split in two.
        assert_eq!(3, ring.stats().active_slices);
        assert_eq!(320 + 688, ring.stats().in_flight_bytes);
    }

    #[test]
    fn overlapping_a_pending_frame_times_out() {
        let device = SimulatedDevice::new();
        let mut ring = ring(&device, 1024);
        ring.allocate(600, 4).unwrap();
        let fence = device.create_fence();
        ring.end_frame(fence.clone()).unwrap();

        ring.allocate(300, 4).unwrap();
        let result = ring.allocate(300, 4);
        assert!(matches!(result, Err(GpuMemoryError::Timeout { .. })));
        assert_eq!(1, ring.stats().fence_waits);
        assert!(result.err().is_some_and(|err| err.is_fatal()));
    }

    #[test]
    fn overlapping_a_pending_frame_waits_for_its_fence() {
        let device = SimulatedDevice::new();
        let mut ring = ring_with_timeout(&device, 1024, Duration::from_secs(10));
        ring.allocate(600, 4).unwrap();
        let fence = device.create_fence();
        ring.end_frame(fence.clone()).unwrap();
        ring.allocate(300, 4).unwrap();

        let signaler = {
            let fence = fence.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                fence.signal();
            })
        };
        // 908..1212 wraps, 1212..1516 is 188..492 in the buffer, inside the first frame.
        let wrapped = ring.allocate(300, 4).unwrap();
        assert_eq!(188, wrapped.view().offset);
        assert!(fence.signaled());
        assert_eq!(1, ring.stats().fence_waits);
        signaler.join().unwrap();

        // The first frame is retired without waiting.
        ring.end_frame(device.create_fence()).unwrap();
        assert_eq!(1, ring.stats().fence_waits);
    }

    #[test]
    fn a_frame_can_not_overwrite_itself() {
        let device = SimulatedDevice::new();
        let ring = ring(&device, 1024);
        ring.allocate(500, 4).unwrap();
        ring.allocate(500, 4).unwrap();
        assert!(matches!(ring.allocate(100, 4), Err(GpuMemoryError::OutOfMemory { .. })));
        assert!(matches!(ring.allocate(1024, 4), Err(GpuMemoryError::Configuration { .. })));
        assert!(matches!(ring.allocate(u64::MAX, 16), Err(GpuMemoryError::Configuration { .. })));
    }

    #[test]
    fn failed_reservations_are_not_part_of_the_frame() {
        let device = SimulatedDevice::new();
        let mut ring = ring(&device, 1024);
        ring.allocate(96, 4).unwrap();
        let pending = device.create_fence();
        ring.end_frame(pending.clone()).unwrap();

        ring.allocate(400, 4).unwrap();
        ring.allocate(400, 4).unwrap();
        assert!(matches!(ring.allocate(400, 4), Err(GpuMemoryError::OutOfMemory { .. })));
        assert_eq!(808, ring.stats().frame_bytes);

        ring.end_frame(device.create_fence()).unwrap();
        ring.validate_slices().unwrap();
        assert_eq!(100 + 808, ring.stats().in_flight_bytes);
        assert!(!pending.signaled());
    }

    #[test]
    fn uploads_are_visible_to_the_gpu() {
        let device = SimulatedDevice::new();
        let ring = ring(&device, 1024);
        let view = ring.upload_frame_data(&[0xABCD_u16; 4], 8).unwrap();
        let data = device.read_buffer(view.buffer.handle(), view.offset, view.size).unwrap();
        assert_eq!(bytemuck::cast_slice::<u16, u8>(&[0xABCD; 4]), &data[..]);
    }

    #[test]
    fn running_out_of_slices_waits_for_the_oldest_frame() {
        let device = SimulatedDevice::new();
        let mut ring = ring(&device, 1 << 20);
        let fences = (0..MAX_FRAME_SLICES).map(|_| device.create_fence()).collect::<Vec<_>>();
        for fence in &fences[..MAX_FRAME_SLICES - 1] {
            ring.allocate(64, 4).unwrap();
            ring.end_frame(fence.clone()).unwrap();
        }
        assert_eq!(MAX_FRAME_SLICES, ring.stats().active_slices);
        ring.allocate(64, 4).unwrap();
        let result = ring.end_frame(fences[MAX_FRAME_SLICES - 1].clone());
        assert!(matches!(result, Err(GpuMemoryError::Timeout { .. })));
        assert!(!fences[0].signaled());
    }
}
