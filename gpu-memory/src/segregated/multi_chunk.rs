use alloc::sync::Arc;

use crate::device::{BufferInfo, BufferPtr, BufferUsage, GpuDevice, MapAccess};
use crate::segregated::{ChunkHost, ChunkLocation, SizeClasses};
use crate::{Bytes, GpuMemoryError};

#[derive(Debug, Clone)]
pub struct MultiChunkConfig {
    pub chunk_size: u64,
    pub max_chunks: usize,
    /// Ascending upper bounds of the size classes, the last one must be
    /// `chunk_size`.
    pub size_classes: Vec<u64>,
    pub min_alignment: u64,
    pub usage: BufferUsage,
    pub map_access: MapAccess,
    /// Up to this many chunks are kept alive when they become empty, to avoid
    /// stalling the device to delete a chunk only to create another one a
    /// frame later.
    pub retained_empty_chunks: usize,
}

impl Default for MultiChunkConfig {
    fn default() -> Self {
        MultiChunkConfig {
            chunk_size: 64 * 1024 * 1024,
            max_chunks: 16,
            size_classes: vec![
                256,
                4 * 1024,
                64 * 1024,
                1024 * 1024,
                8 * 1024 * 1024,
                64 * 1024 * 1024,
            ],
            min_alignment: 256,
            usage: BufferUsage::STORAGE_BUFFER | BufferUsage::UNIFORM_BUFFER | BufferUsage::TRANSFER_DST,
            map_access: MapAccess::None,
            retained_empty_chunks: 1,
        }
    }
}

/// One buffer per chunk.
pub struct MultiChunk {
    buffer: BufferPtr,
}

impl MultiChunk {
    pub fn buffer(&self) -> &BufferPtr {
        &self.buffer
    }
}

/// Creates a new buffer for every chunk, up to a maximum amount of chunks.
pub struct MultiChunkHost {
    device: Arc<dyn GpuDevice>,
    config: MultiChunkConfig,
    classes: SizeClasses,
    identifier: String,
    live_chunks: usize,
    created_chunks: u64,
}

impl MultiChunkHost {
    pub fn new(device: Arc<dyn GpuDevice>, config: MultiChunkConfig, identifier: &str) -> Result<MultiChunkHost, GpuMemoryError> {
        if config.max_chunks == 0 {
            return Err(GpuMemoryError::configuration(identifier, "the maximum chunk count can't be 0"));
        }
        let classes = SizeClasses::new(&config.size_classes, config.chunk_size, config.min_alignment, identifier)?;
        Ok(MultiChunkHost {
            device,
            config,
            classes,
            identifier: identifier.to_string(),
            live_chunks: 0,
            created_chunks: 0,
        })
    }

    pub fn live_chunks(&self) -> usize {
        self.live_chunks
    }
}

impl ChunkHost for MultiChunkHost {
    type Chunk = MultiChunk;

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

    fn allocate_chunk(&mut self) -> Result<(MultiChunk, u64), GpuMemoryError> {
        profiling::scope!("chunk allocation");
        let chunk_size = self.config.chunk_size;
        if self.live_chunks >= self.config.max_chunks {
            return Err(GpuMemoryError::OutOfMemory {
                identifier: self.identifier.clone(),
                used: Bytes(self.live_chunks as u64 * chunk_size),
                capacity: Bytes(self.config.max_chunks as u64 * chunk_size),
                required: Bytes(chunk_size),
            });
        }

        let name = format!("{} chunk #{}", self.identifier, self.created_chunks);
        let buffer = self
            .device
            .create_buffer(&BufferInfo {
                size: chunk_size,
                usage: self.config.usage,
                map_access: self.config.map_access,
                name: &name,
            })
            .map_err(|err| GpuMemoryError::BufferCreation(err, name.clone(), Bytes(chunk_size)))?;
        if self.config.map_access.is_mapped() {
            buffer.map().map_err(|err| GpuMemoryError::Map(err, name.clone()))?;
        }

        self.live_chunks += 1;
        self.created_chunks += 1;
        log::trace!("{name} created ({}, {}/{} chunks)", Bytes(chunk_size), self.live_chunks, self.config.max_chunks);
        Ok((MultiChunk { buffer }, chunk_size))
    }

    fn delete_chunk(&mut self, chunk: MultiChunk) {
        profiling::scope!("chunk deletion");
        log::warn!(
            "{}: deleting an empty chunk ({}), which requires waiting for the device to idle",
            self.identifier,
            Bytes(self.config.chunk_size),
        );
        if let Err(err) = self.device.wait_idle() {
            log::error!("{}: device idle wait failed while deleting a chunk: {err}", self.identifier);
            panic!("device idle wait before chunk deletion should not fail: {err}");
        }
        if self.config.map_access.is_mapped() {
            chunk.buffer.unmap();
        }
        self.live_chunks -= 1;
    }

    fn locate(&self, chunk: &MultiChunk) -> ChunkLocation {
        ChunkLocation {
            buffer: chunk.buffer.clone(),
            base_offset: 0,
        }
    }

    fn retain_empty_chunk(&self, live_chunks: usize) -> bool {
        live_chunks <= self.config.retained_empty_chunks
    }
}
