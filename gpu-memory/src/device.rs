//! The narrow interface the pools use to talk to the graphics API: buffer
//! creation and mapping, a device idle wait, fences, and a synchronous
//! transfer submission for growing buffers.
use alloc::sync::Arc;
use ash::vk;
use core::fmt::{self, Debug};
use core::ptr::NonNull;
use core::time::Duration;

pub(crate) mod simulated;
pub(crate) mod vulkan;

pub type BufferUsage = vk::BufferUsageFlags;
pub type BufferPtr = Arc<dyn GpuBuffer>;
pub type FencePtr = Arc<dyn GpuFence>;

/// How the CPU is going to access a buffer's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapAccess {
    /// Never mapped, the memory should be the fastest available for the GPU.
    None,
    /// Mapped and written by the CPU, read by the GPU.
    Write,
    /// Mapped for both reading and writing.
    ReadWrite,
}

impl MapAccess {
    pub fn is_mapped(self) -> bool {
        self != MapAccess::None
    }
}

pub struct BufferInfo<'a> {
    pub size: vk::DeviceSize,
    pub usage: BufferUsage,
    pub map_access: MapAccess,
    /// Used for logging and debug names.
    pub name: &'a str,
}

pub trait GpuBuffer: Send + Sync {
    fn handle(&self) -> vk::Buffer;
    fn size(&self) -> vk::DeviceSize;
    fn usage(&self) -> BufferUsage;
    /// Maps the whole buffer. Mapping an already mapped buffer returns the
    /// existing pointer.
    fn map(&self) -> Result<NonNull<u8>, vk::Result>;
    fn unmap(&self);
    /// The pointer returned by [`GpuBuffer::map`], if the buffer is
    /// currently mapped.
    fn mapped_ptr(&self) -> Option<NonNull<u8>>;
}

/// A GPU completion marker.
pub trait GpuFence: Send + Sync {
    fn signaled(&self) -> bool;
    /// Blocks until the fence is signaled or `timeout` has passed. Returns
    /// false on timeout.
    fn wait(&self, timeout: Duration) -> bool;
}

/// One command in a [`GpuDevice::submit_transfer`] submission.
pub enum TransferCommand<'a> {
    /// Makes the writes of `src_usage` visible to `dst_usage`. An empty
    /// `src_usage` means the previous contents are not needed.
    Barrier {
        buffer: &'a dyn GpuBuffer,
        src_usage: BufferUsage,
        dst_usage: BufferUsage,
    },
    Copy {
        src: &'a dyn GpuBuffer,
        dst: &'a dyn GpuBuffer,
        src_offset: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    },
}

pub trait GpuDevice: Send + Sync {
    fn create_buffer(&self, info: &BufferInfo) -> Result<BufferPtr, vk::Result>;
    /// Waits until no submitted work is executing on the device.
    fn wait_idle(&self) -> Result<(), vk::Result>;
    /// Records the commands into one command buffer, submits it, and waits
    /// for it to finish before returning.
    fn submit_transfer(&self, commands: &[TransferCommand], name: &str) -> Result<(), vk::Result>;
}

/// A range of a buffer handed out to users of the pools.
#[derive(Clone)]
pub struct BufferView {
    pub buffer: BufferPtr,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl BufferView {
    pub fn end(&self) -> vk::DeviceSize {
        self.offset + self.size
    }

    pub fn overlaps(&self, other: &BufferView) -> bool {
        self.buffer.handle() == other.buffer.handle() && self.offset < other.end() && other.offset < self.end()
    }
}

impl Debug for BufferView {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("BufferView")
            .field("buffer", &self.buffer.handle())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}
