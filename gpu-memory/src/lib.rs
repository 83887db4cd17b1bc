//! GPU memory pools for a renderer: segregated free-list pools for long-lived
//! buffer allocations, and a ring buffer for per-frame host-mapped transient
//! data.
//!
//! Nothing here decides when the GPU is done with memory by itself. The owner
//! of a pool calls `end_frame` once per frame with the fence of that frame's
//! submission, and memory freed or written before that call is only reused
//! after the fence has signaled.

// TODO: #![warn(clippy::pedantic)]

extern crate alloc;

// public-facing modules:

mod display_utils {
    use core::fmt::{Display, Formatter, Result};

    /// Wrapper around u64 for pretty-printing byte amount with the appropriate
    /// size prefix (KiB, MiB, etc.).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Bytes(pub u64);

    impl Display for Bytes {
        fn fmt(&self, fmt: &mut Formatter) -> Result {
            const KIBI: u64 = 1_024;
            const MEBI: u64 = KIBI * KIBI;
            const GIBI: u64 = MEBI * KIBI;
            const TIBI: u64 = GIBI * KIBI;
            match self.0 {
                bytes if bytes < KIBI => write!(fmt, "{:.0} bytes", bytes as f32),
                bytes if bytes < MEBI => write!(fmt, "{:.2} KiB", bytes as f32 / KIBI as f32),
                bytes if bytes < GIBI => write!(fmt, "{:.2} MiB", bytes as f32 / MEBI as f32),
                bytes if bytes < TIBI => write!(fmt, "{:.2} GiB", bytes as f32 / GIBI as f32),
                bytes => write!(fmt, "{:.3} TiB", bytes as f32 / TIBI as f32),
            }
        }
    }
}
pub use display_utils::*;

mod device;
pub use device::simulated::{RecordedCommand, SimulatedDevice, SimulatedFence};
pub use device::vulkan::{VulkanBuffer, VulkanDevice, VulkanFence};
pub use device::{BufferInfo, BufferPtr, BufferUsage, BufferView, FencePtr, GpuBuffer, GpuDevice, GpuFence, MapAccess, TransferCommand};

mod error;
pub use error::GpuMemoryError;

mod segregated;
pub use segregated::cow_buffer::{CowBufferConfig, CowBufferHost, CowChunk};
pub use segregated::multi_chunk::{MultiChunk, MultiChunkConfig, MultiChunkHost};
pub use segregated::single_buffer::{SingleBufferConfig, SingleBufferHost, SingleChunk};
pub use segregated::{BlockAllocation, ChunkHost, ChunkId, ChunkLocation, SegregatedListsBuilder, SizeClasses};

mod pool;
pub use pool::garbage::{GarbageCollector, GarbageEntry};
pub use pool::{Allocation, PoolStats, SegregatedPool};

mod transient;
pub use transient::{TransientAllocation, TransientConfig, TransientRingBuffer, TransientStats, MAX_FRAME_SLICES};

mod pools;
pub use pools::{GpuMemoryConfig, GpuMemoryPools, GpuMemoryStats};

pub use ash::vk;

#[cfg(test)]
mod tests {
    use crate::Bytes;

    #[test]
    fn bytes_display_picks_prefix() {
        assert_eq!("512 bytes", format!("{}", Bytes(512)));
        assert_eq!("1.50 KiB", format!("{}", Bytes(1536)));
        assert_eq!("64.00 MiB", format!("{}", Bytes(64 * 1024 * 1024)));
    }
}
