use alloc::sync::Arc;
use arrayvec::ArrayVec;
use core::mem;

use crate::device::{BufferInfo, BufferPtr, BufferUsage, GpuDevice, MapAccess, TransferCommand};
use crate::segregated::{ChunkHost, ChunkLocation, SizeClasses};
use crate::{Bytes, GpuMemoryError};

#[derive(Debug, Clone)]
pub struct CowBufferConfig {
    pub initial_size: u64,
    /// The buffer is never grown past this size.
    pub max_size: Option<u64>,
    pub growth: bool,
    /// Ascending upper bounds of the size classes, the last one must be
    /// `initial_size`.
    pub size_classes: Vec<u64>,
    pub min_alignment: u64,
    pub usage: BufferUsage,
    pub map_access: MapAccess,
}

impl Default for CowBufferConfig {
    fn default() -> Self {
        CowBufferConfig {
            initial_size: 16 * 1024 * 1024,
            max_size: Some(256 * 1024 * 1024),
            growth: true,
            size_classes: vec![256, 4 * 1024, 64 * 1024, 1024 * 1024, 16 * 1024 * 1024],
            min_alignment: 16,
            usage: BufferUsage::STORAGE_BUFFER | BufferUsage::TRANSFER_DST,
            map_access: MapAccess::None,
        }
    }
}

/// A region of the [`CowBufferHost`]'s buffer. Growing the buffer adds a
/// chunk covering the new upper half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CowChunk {
    base_offset: u64,
    size: u64,
}

impl CowChunk {
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// One buffer which is replaced with a copy twice its size when more memory
/// is needed. Offsets into the buffer stay valid through growth.
pub struct CowBufferHost {
    device: Arc<dyn GpuDevice>,
    config: CowBufferConfig,
    classes: SizeClasses,
    identifier: String,
    buffer: Option<BufferPtr>,
    total_size: u64,
    growth_count: u32,
    retired_buffers: Vec<BufferPtr>,
}

impl CowBufferHost {
    pub fn new(device: Arc<dyn GpuDevice>, config: CowBufferConfig, identifier: &str) -> Result<CowBufferHost, GpuMemoryError> {
        let classes = SizeClasses::new(&config.size_classes, config.initial_size, config.min_alignment, identifier)?;
        if matches!(config.max_size, Some(max_size) if max_size < config.initial_size) {
            return Err(GpuMemoryError::configuration(identifier, "the maximum size is smaller than the initial size"));
        }
        Ok(CowBufferHost {
            device,
            config,
            classes,
            identifier: identifier.to_string(),
            buffer: None,
            total_size: 0,
            growth_count: 0,
            retired_buffers: Vec::new(),
        })
    }

    /// The current buffer, if the first chunk has been allocated.
    pub fn buffer(&self) -> Option<&BufferPtr> {
        self.buffer.as_ref()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn growth_count(&self) -> u32 {
        self.growth_count
    }

    fn create_buffer(&self, size: u64, name: &str) -> Result<BufferPtr, GpuMemoryError> {
        let buffer = self
            .device
            .create_buffer(&BufferInfo {
                size,
                usage: self.config.usage | BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
                map_access: self.config.map_access,
                name,
            })
            .map_err(|err| GpuMemoryError::BufferCreation(err, name.to_string(), Bytes(size)))?;
        if self.config.map_access.is_mapped() {
            buffer.map().map_err(|err| GpuMemoryError::Map(err, name.to_string()))?;
        }
        Ok(buffer)
    }

    fn grow(&mut self, old_buffer: BufferPtr) -> Result<CowChunk, GpuMemoryError> {
        profiling::scope!("cow buffer growth");
        let old_size = self.total_size;
        let new_size = old_size * 2;
        let out_of_memory = || GpuMemoryError::OutOfMemory {
            identifier: self.identifier.clone(),
            used: Bytes(old_size),
            capacity: Bytes(self.config.max_size.unwrap_or(old_size).max(old_size)),
            required: Bytes(new_size),
        };
        if !self.config.growth || matches!(self.config.max_size, Some(max_size) if new_size > max_size) {
            return Err(out_of_memory());
        }

        let name = format!("{} (grown to {})", self.identifier, Bytes(new_size));
        let new_buffer = self.create_buffer(new_size, &name)?;
        let mut commands = ArrayVec::<TransferCommand, 4>::new();
        commands.push(TransferCommand::Barrier {
            buffer: &*old_buffer,
            src_usage: self.config.usage,
            dst_usage: BufferUsage::TRANSFER_SRC,
        });
        commands.push(TransferCommand::Barrier {
            buffer: &*new_buffer,
            src_usage: BufferUsage::empty(),
            dst_usage: BufferUsage::TRANSFER_DST,
        });
        commands.push(TransferCommand::Copy {
            src: &*old_buffer,
            dst: &*new_buffer,
            src_offset: 0,
            dst_offset: 0,
            size: old_size,
        });
        commands.push(TransferCommand::Barrier {
            buffer: &*new_buffer,
            src_usage: BufferUsage::TRANSFER_DST,
            dst_usage: self.config.usage,
        });
        self.device
            .submit_transfer(&commands, &name)
            .map_err(|err| GpuMemoryError::Transfer(err, name.clone()))?;
        drop(commands);

        log::debug!("{}: grew from {} to {}", self.identifier, Bytes(old_size), Bytes(new_size));
        if self.config.map_access.is_mapped() {
            old_buffer.unmap();
        }
        self.retired_buffers.push(old_buffer);
        self.buffer = Some(new_buffer);
        self.total_size = new_size;
        self.growth_count += 1;
        Ok(CowChunk {
            base_offset: old_size,
            size: old_size,
        })
    }
}

impl ChunkHost for CowBufferHost {
    type Chunk = CowChunk;

    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn class_count(&self) -> usize {
        self.classes.len()
    }

    fn class_max_size(&self, class: usize) -> u64 {
        self.classes.max_size(class)
    }

    fn min_size_alignment(&self) -> u64 {
        self.config.min_alignment
    }

    fn allocate_chunk(&mut self) -> Result<(CowChunk, u64), GpuMemoryError> {
        let chunk = match self.buffer.clone() {
            Some(old_buffer) => self.grow(old_buffer)?,
            None => {
                let size = self.config.initial_size;
                self.buffer = Some(self.create_buffer(size, &self.identifier)?);
                self.total_size = size;
                log::trace!("{} created ({})", self.identifier, Bytes(size));
                CowChunk { base_offset: 0, size }
            }
        };
        Ok((chunk, chunk.size))
    }

    fn delete_chunk(&mut self, chunk: CowChunk) {
        log::debug!("{}: chunk at offset {} is empty, but the buffer can't shrink", self.identifier, chunk.base_offset);
    }

    fn locate(&self, chunk: &CowChunk) -> ChunkLocation {
        let buffer = self.buffer.clone().expect("cow chunks should only exist after the buffer has been created");
        ChunkLocation {
            buffer,
            base_offset: chunk.base_offset,
        }
    }

    fn retain_empty_chunk(&self, _live_chunks: usize) -> bool {
        true
    }

    fn take_retired_buffers(&mut self) -> Vec<BufferPtr> {
        mem::take(&mut self.retired_buffers)
    }
}

impl Drop for CowBufferHost {
    fn drop(&mut self) {
        if let Some(buffer) = &self.buffer {
            if buffer.mapped_ptr().is_some() {
                buffer.unmap();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RecordedCommand, SimulatedDevice};

    fn config(growth: bool) -> CowBufferConfig {
        CowBufferConfig {
            initial_size: 1024,
            max_size: Some(4096),
            growth,
            size_classes: vec![256, 1024],
            min_alignment: 16,
            usage: BufferUsage::STORAGE_BUFFER,
            map_access: MapAccess::None,
        }
    }

    #[test]
    fn growth_doubles_and_copies() {
        let device = SimulatedDevice::new();
        let mut host = CowBufferHost::new(Arc::new(device.clone()), config(true), "gpu scene").unwrap();
        let (first, size) = host.allocate_chunk().unwrap();
        assert_eq!((0, 1024), (first.base_offset(), size));
        let old_handle = host.buffer().unwrap().handle();

        let (second, size) = host.allocate_chunk().unwrap();
        assert_eq!((1024, 1024), (second.base_offset(), size));
        assert_eq!(2048, host.total_size());
        let new_handle = host.buffer().unwrap().handle();
        assert_ne!(old_handle, new_handle);
        assert_eq!(new_handle, host.locate(&first).buffer.handle());

        let commands = device.recorded_commands();
        assert_eq!(5, commands.len());
        assert_eq!(
            RecordedCommand::Copy {
                src: old_handle,
                dst: new_handle,
                src_offset: 0,
                dst_offset: 0,
                size: 1024,
            },
            commands[2],
        );

        // The old buffer stays alive until whoever owns the host retires it.
        assert_eq!(2, device.live_buffer_count());
        let retired = host.take_retired_buffers();
        assert_eq!(old_handle, retired[0].handle());
        drop(retired);
        assert_eq!(1, device.live_buffer_count());
    }

    #[test]
    fn growth_is_bounded() {
        let device = SimulatedDevice::new();
        let mut host = CowBufferHost::new(Arc::new(device.clone()), config(true), "gpu scene").unwrap();
        host.allocate_chunk().unwrap();
        host.allocate_chunk().unwrap();
        host.allocate_chunk().unwrap();
        assert_eq!(4096, host.total_size());
        assert!(matches!(host.allocate_chunk(), Err(GpuMemoryError::OutOfMemory { .. })));

        let mut fixed = CowBufferHost::new(Arc::new(device), config(false), "fixed scene").unwrap();
        fixed.allocate_chunk().unwrap();
        assert!(matches!(fixed.allocate_chunk(), Err(GpuMemoryError::OutOfMemory { .. })));
        assert_eq!(0, fixed.growth_count());
    }
}
