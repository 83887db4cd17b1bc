use crate::device::{BufferInfo, BufferPtr, BufferUsage, GpuDevice, MapAccess};
use crate::segregated::{ChunkHost, ChunkLocation, SizeClasses};
use crate::{Bytes, GpuMemoryError};

#[derive(Debug, Clone)]
pub struct SingleBufferConfig {
    pub size: u64,
    /// Ascending upper bounds of the size classes, the last one must be
    /// `size`.
    pub size_classes: Vec<u64>,
    pub min_alignment: u64,
    pub usage: BufferUsage,
    pub map_access: MapAccess,
}

impl Default for SingleBufferConfig {
    fn default() -> Self {
        SingleBufferConfig {
            size: 128 * 1024 * 1024,
            size_classes: vec![
                1024,
                16 * 1024,
                256 * 1024,
                4 * 1024 * 1024,
                32 * 1024 * 1024,
                128 * 1024 * 1024,
            ],
            min_alignment: 16,
            usage: BufferUsage::VERTEX_BUFFER | BufferUsage::INDEX_BUFFER | BufferUsage::STORAGE_BUFFER | BufferUsage::TRANSFER_DST,
            map_access: MapAccess::None,
        }
    }
}

/// The only chunk of a [`SingleBufferHost`], spanning the whole buffer.
pub struct SingleChunk(());

/// Hosts exactly one chunk: a buffer created up front, whose address never
/// changes.
pub struct SingleBufferHost {
    buffer: BufferPtr,
    classes: SizeClasses,
    min_alignment: u64,
    identifier: String,
    chunk_exists: bool,
}

impl SingleBufferHost {
    pub fn new(device: &dyn GpuDevice, config: SingleBufferConfig, identifier: &str) -> Result<SingleBufferHost, GpuMemoryError> {
        let classes = SizeClasses::new(&config.size_classes, config.size, config.min_alignment, identifier)?;
        let buffer = device
            .create_buffer(&BufferInfo {
                size: config.size,
                usage: config.usage,
                map_access: config.map_access,
                name: identifier,
            })
            .map_err(|err| GpuMemoryError::BufferCreation(err, identifier.to_string(), Bytes(config.size)))?;
        if config.map_access.is_mapped() {
            buffer.map().map_err(|err| GpuMemoryError::Map(err, identifier.to_string()))?;
        }
        log::trace!("{identifier} created ({})", Bytes(config.size));
        Ok(SingleBufferHost {
            buffer,
            classes,
            min_alignment: config.min_alignment,
            identifier: identifier.to_string(),
            chunk_exists: false,
        })
    }

    pub fn buffer(&self) -> &BufferPtr {
        &self.buffer
    }
}

impl ChunkHost for SingleBufferHost {
    type Chunk = SingleChunk;

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
        self.min_alignment
    }

    fn allocate_chunk(&mut self) -> Result<(SingleChunk, u64), GpuMemoryError> {
        let size = self.buffer.size();
        if self.chunk_exists {
            return Err(GpuMemoryError::OutOfMemory {
                identifier: self.identifier.clone(),
                used: Bytes(size),
                capacity: Bytes(size),
                required: Bytes(size),
            });
        }
        self.chunk_exists = true;
        Ok((SingleChunk(()), size))
    }

    fn delete_chunk(&mut self, _chunk: SingleChunk) {
        self.chunk_exists = false;
    }

    fn locate(&self, _chunk: &SingleChunk) -> ChunkLocation {
        ChunkLocation {
            buffer: self.buffer.clone(),
            base_offset: 0,
        }
    }

    fn retain_empty_chunk(&self, _live_chunks: usize) -> bool {
        true
    }
}

impl Drop for SingleBufferHost {
    fn drop(&mut self) {
        if self.buffer.mapped_ptr().is_some() {
            self.buffer.unmap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimulatedDevice;

    #[test]
    fn only_one_chunk_exists() {
        let device = SimulatedDevice::new();
        let config = SingleBufferConfig {
            size: 4096,
            size_classes: vec![256, 4096],
            min_alignment: 16,
            usage: BufferUsage::VERTEX_BUFFER,
            map_access: MapAccess::Write,
        };
        let mut host = SingleBufferHost::new(&device, config, "unified geometry").unwrap();
        assert!(host.buffer().mapped_ptr().is_some());
        let (chunk, size) = host.allocate_chunk().unwrap();
        assert_eq!(4096, size);
        assert!(matches!(host.allocate_chunk(), Err(GpuMemoryError::OutOfMemory { .. })));
        assert_eq!(host.buffer().handle(), host.locate(&chunk).buffer.handle());
        assert!(host.retain_empty_chunk(1));
    }
}
