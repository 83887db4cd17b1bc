//! A [`GpuDevice`] backed by host memory, for tests and for running the pools
//! without a GPU. Transfers execute immediately on submission, and fences
//! are signaled by whoever plays the part of the GPU (or all at once by
//! [`GpuDevice::wait_idle`]).
use alloc::sync::{Arc, Weak};
use ash::vk;
use ash::vk::Handle;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};
use core::time::Duration;
use hashbrown::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::device::{BufferInfo, BufferPtr, BufferUsage, GpuBuffer, GpuDevice, GpuFence, MapAccess, TransferCommand};

/// A command executed by [`SimulatedDevice::submit_transfer`], kept around so
/// that tests can check what was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCommand {
    Barrier {
        buffer: vk::Buffer,
        src_usage: BufferUsage,
        dst_usage: BufferUsage,
    },
    Copy {
        src: vk::Buffer,
        dst: vk::Buffer,
        src_offset: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    },
    Submit,
}

#[derive(Clone, Copy)]
struct Memory {
    ptr: NonNull<u8>,
    size: usize,
}

// Only read or written while the owning SimulatedBuffer is alive.
unsafe impl Send for Memory {}

#[derive(Default)]
struct SimulatedState {
    buffers: HashMap<u64, Memory>,
    fences: Vec<Weak<SimulatedFence>>,
    next_handle: u64,
    allocated: u64,
    peak: u64,
    budget: Option<u64>,
    commands: Vec<RecordedCommand>,
    wait_idle_count: u64,
}

#[derive(Clone, Default)]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedDevice {
    pub fn new() -> SimulatedDevice {
        SimulatedDevice::default()
    }

    /// Buffer creation fails with `ERROR_OUT_OF_DEVICE_MEMORY` when the sum
    /// of live buffer sizes would exceed `budget`.
    pub fn with_memory_budget(budget: u64) -> SimulatedDevice {
        let device = SimulatedDevice::default();
        device.lock().budget = Some(budget);
        device
    }

    fn lock(&self) -> MutexGuard<SimulatedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_fence(&self) -> Arc<SimulatedFence> {
        let fence = Arc::new(SimulatedFence::new());
        let mut state = self.lock();
        state.fences.retain(|fence| fence.strong_count() > 0);
        state.fences.push(Arc::downgrade(&fence));
        fence
    }

    /// Bytes in live buffers.
    pub fn allocated_bytes(&self) -> u64 {
        self.lock().allocated
    }

    pub fn peak_allocated_bytes(&self) -> u64 {
        self.lock().peak
    }

    pub fn live_buffer_count(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn wait_idle_count(&self) -> u64 {
        self.lock().wait_idle_count
    }

    /// Every command submitted so far, in submission order.
    pub fn recorded_commands(&self) -> Vec<RecordedCommand> {
        self.lock().commands.clone()
    }

    /// Reads buffer memory the way the GPU would, regardless of whether the
    /// buffer is mapped. Returns None if the buffer does not exist or the
    /// range is out of bounds.
    pub fn read_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> Option<Vec<u8>> {
        let memory = *self.lock().buffers.get(&buffer.as_raw())?;
        let (offset, size) = (offset as usize, size as usize);
        if offset.checked_add(size)? > memory.size {
            return None;
        }
        let mut data = vec![0; size];
        unsafe { ptr::copy_nonoverlapping(memory.ptr.as_ptr().add(offset), data.as_mut_ptr(), size) };
        Some(data)
    }
}

impl GpuDevice for SimulatedDevice {
    fn create_buffer(&self, info: &BufferInfo) -> Result<BufferPtr, vk::Result> {
        profiling::scope!("simulated buffer creation");
        if info.size == 0 {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let mut state = self.lock();
        if let Some(budget) = state.budget {
            if state.allocated + info.size > budget {
                return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
            }
        }
        let size = usize::try_from(info.size).map_err(|_| vk::Result::ERROR_OUT_OF_HOST_MEMORY)?;
        let memory = vec![0u8; size].into_boxed_slice();
        // The Box is reconstructed and freed in SimulatedBuffer::drop.
        let ptr = NonNull::new(Box::into_raw(memory).cast::<u8>()).ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)?;
        state.next_handle += 1;
        let handle = state.next_handle;
        state.buffers.insert(handle, Memory { ptr, size });
        state.allocated += info.size;
        state.peak = state.peak.max(state.allocated);
        log::trace!("simulated buffer #{handle} created for {} ({} bytes)", info.name, info.size);
        Ok(Arc::new(SimulatedBuffer {
            handle: vk::Buffer::from_raw(handle),
            memory: Memory { ptr, size },
            usage: info.usage,
            map_access: info.map_access,
            mapped: AtomicPtr::new(ptr::null_mut()),
            state: self.state.clone(),
        }))
    }

    fn wait_idle(&self) -> Result<(), vk::Result> {
        profiling::scope!("simulated wait idle");
        let fences = {
            let mut state = self.lock();
            state.wait_idle_count += 1;
            state.fences.iter().filter_map(Weak::upgrade).collect::<Vec<_>>()
        };
        for fence in fences {
            fence.signal();
        }
        Ok(())
    }

    fn submit_transfer(&self, commands: &[TransferCommand], name: &str) -> Result<(), vk::Result> {
        profiling::scope!("simulated transfer submission");
        log::trace!("simulated transfer submission: {name}");
        let mut state = self.lock();
        for command in commands {
            match *command {
                TransferCommand::Barrier {
                    buffer,
                    src_usage,
                    dst_usage,
                } => state.commands.push(RecordedCommand::Barrier {
                    buffer: buffer.handle(),
                    src_usage,
                    dst_usage,
                }),
                TransferCommand::Copy {
                    src,
                    dst,
                    src_offset,
                    dst_offset,
                    size,
                } => {
                    if !src.usage().contains(BufferUsage::TRANSFER_SRC) || !dst.usage().contains(BufferUsage::TRANSFER_DST) {
                        return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
                    }
                    let src_memory = *state.buffers.get(&src.handle().as_raw()).ok_or(vk::Result::ERROR_UNKNOWN)?;
                    let dst_memory = *state.buffers.get(&dst.handle().as_raw()).ok_or(vk::Result::ERROR_UNKNOWN)?;
                    let (src_offset_, dst_offset_, size_) = (src_offset as usize, dst_offset as usize, size as usize);
                    if src_offset_ + size_ > src_memory.size || dst_offset_ + size_ > dst_memory.size {
                        return Err(vk::Result::ERROR_UNKNOWN);
                    }
                    // ptr::copy, since the source and destination may be the same buffer.
                    unsafe {
                        ptr::copy(
                            src_memory.ptr.as_ptr().add(src_offset_),
                            dst_memory.ptr.as_ptr().add(dst_offset_),
                            size_,
                        );
                    }
                    state.commands.push(RecordedCommand::Copy {
                        src: src.handle(),
                        dst: dst.handle(),
                        src_offset,
                        dst_offset,
                        size,
                    });
                }
            }
        }
        state.commands.push(RecordedCommand::Submit);
        Ok(())
    }
}

pub struct SimulatedBuffer {
    handle: vk::Buffer,
    memory: Memory,
    usage: BufferUsage,
    map_access: MapAccess,
    mapped: AtomicPtr<u8>,
    state: Arc<Mutex<SimulatedState>>,
}

// The memory is owned by this buffer and only accessed through raw pointers.
unsafe impl Sync for SimulatedBuffer {}

impl Drop for SimulatedBuffer {
    fn drop(&mut self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.buffers.remove(&self.handle.as_raw());
            state.allocated -= self.memory.size as u64;
        }
        let slice = ptr::slice_from_raw_parts_mut(self.memory.ptr.as_ptr(), self.memory.size);
        drop(unsafe { Box::from_raw(slice) });
    }
}

impl GpuBuffer for SimulatedBuffer {
    fn handle(&self) -> vk::Buffer {
        self.handle
    }

    fn size(&self) -> vk::DeviceSize {
        self.memory.size as vk::DeviceSize
    }

    fn usage(&self) -> BufferUsage {
        self.usage
    }

    fn map(&self) -> Result<NonNull<u8>, vk::Result> {
        if !self.map_access.is_mapped() {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        self.mapped.store(self.memory.ptr.as_ptr(), Ordering::Release);
        Ok(self.memory.ptr)
    }

    fn unmap(&self) {
        self.mapped.store(ptr::null_mut(), Ordering::Release);
    }

    fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.mapped.load(Ordering::Acquire))
    }
}

/// A fence signaled by calling [`SimulatedFence::signal`], from any thread.
#[derive(Default)]
pub struct SimulatedFence {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl SimulatedFence {
    pub fn new() -> SimulatedFence {
        SimulatedFence::default()
    }

    pub fn signaled_fence() -> SimulatedFence {
        SimulatedFence {
            signaled: Mutex::new(true),
            condvar: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        *self.signaled.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.condvar.notify_all();
    }
}

impl GpuFence for SimulatedFence {
    fn signaled(&self) -> bool {
        *self.signaled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait(&self, timeout: Duration) -> bool {
        let signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        let (signaled, _) = self
            .condvar
            .wait_timeout_while(signaled, timeout, |signaled| !*signaled)
            .unwrap_or_else(PoisonError::into_inner);
        *signaled
    }
}
