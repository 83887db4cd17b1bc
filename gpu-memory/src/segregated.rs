//! A segregated free-list suballocator. Chunks of memory come from a
//! [`ChunkHost`], and are carved into blocks. Free blocks are kept in one
//! address-sorted list per size class, and merged with their neighbours when
//! freed.
use arrayvec::ArrayVec;
use core::fmt::Write;

use crate::device::BufferPtr;
use crate::{Bytes, GpuMemoryError};

pub(crate) mod cow_buffer;
pub(crate) mod multi_chunk;
pub(crate) mod single_buffer;

/// Ascending upper bounds of the size classes. The last one is the size of a
/// chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeClasses {
    bounds: Vec<u64>,
}

impl SizeClasses {
    pub fn new(bounds: &[u64], chunk_size: u64, min_alignment: u64, identifier: &str) -> Result<SizeClasses, GpuMemoryError> {
        if min_alignment == 0 {
            return Err(GpuMemoryError::configuration(identifier, "the minimum alignment can't be 0"));
        }
        let Some(&last) = bounds.last() else {
            return Err(GpuMemoryError::configuration(identifier, "there are no size classes"));
        };
        for (i, &bound) in bounds.iter().enumerate() {
            if bound == 0 {
                return Err(GpuMemoryError::configuration(identifier, format!("size class {i} is 0 bytes")));
            }
            if bound % min_alignment != 0 {
                return Err(GpuMemoryError::configuration(
                    identifier,
                    format!("size class {i} ({bound}) is not a multiple of the minimum alignment ({min_alignment})"),
                ));
            }
            if i > 0 && bounds[i - 1] >= bound {
                return Err(GpuMemoryError::configuration(
                    identifier,
                    format!("size classes are not ascending ({} >= {bound})", bounds[i - 1]),
                ));
            }
        }
        if last != chunk_size {
            return Err(GpuMemoryError::configuration(
                identifier,
                format!("the last size class ({last}) should be the chunk size ({chunk_size})"),
            ));
        }
        Ok(SizeClasses { bounds: bounds.to_vec() })
    }

    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    pub fn max_size(&self, class: usize) -> u64 {
        self.bounds[class]
    }
}

/// Where a chunk's memory is: chunks of a single-buffer host share one buffer
/// at different offsets.
#[derive(Clone)]
pub struct ChunkLocation {
    pub buffer: BufferPtr,
    pub base_offset: u64,
}

/// Provides chunks and size classes to a [`SegregatedListsBuilder`].
pub trait ChunkHost: Send + 'static {
    type Chunk: Send;

    /// Used in logs and errors.
    fn identifier(&self) -> &str;
    fn class_count(&self) -> usize;
    /// The upper bound of the size class, inclusive.
    fn class_max_size(&self, class: usize) -> u64;
    /// Every block's size and offset is a multiple of this.
    fn min_size_alignment(&self) -> u64;
    /// Returns the new chunk and its size in bytes.
    fn allocate_chunk(&mut self) -> Result<(Self::Chunk, u64), GpuMemoryError>;
    /// Called with chunks that became completely free, unless
    /// [`ChunkHost::retain_empty_chunk`] says otherwise.
    fn delete_chunk(&mut self, chunk: Self::Chunk);
    fn locate(&self, chunk: &Self::Chunk) -> ChunkLocation;

    /// Whether a chunk that just became empty should be kept around, given
    /// the amount of chunks currently alive (including the empty one).
    fn retain_empty_chunk(&self, live_chunks: usize) -> bool {
        let _ = live_chunks;
        false
    }

    /// Buffers the host stopped using, which may still be referenced by GPU
    /// work in flight. The owner of the builder should keep them alive until
    /// that work is done.
    fn take_retired_buffers(&mut self) -> Vec<BufferPtr> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAllocation {
    pub chunk: ChunkId,
    /// Offset from the start of the chunk.
    pub offset: u64,
    /// The size of the block, rounded up to the host's minimum alignment.
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    address: u64,
    size: u64,
}

impl FreeBlock {
    fn end(&self) -> u64 {
        self.address + self.size
    }
}

struct ChunkRecord<C> {
    id: ChunkId,
    chunk: C,
    base_offset: u64,
    total_size: u64,
    free_size: u64,
    free_lists: Vec<Vec<FreeBlock>>,
}

pub struct SegregatedListsBuilder<H: ChunkHost> {
    host: H,
    /// In creation order.
    chunks: Vec<ChunkRecord<H::Chunk>>,
    next_chunk_id: u32,
}

fn find_class<H: ChunkHost>(host: &H, size: u64) -> Option<usize> {
    (0..host.class_count()).find(|&class| size <= host.class_max_size(class))
}

/// Free blocks larger than the largest class (chunks of a growing host can be
/// larger than the initial chunk size) go in the last class.
fn free_block_class<H: ChunkHost>(host: &H, size: u64) -> usize {
    find_class(host, size).unwrap_or(host.class_count() - 1)
}

impl<H: ChunkHost> SegregatedListsBuilder<H> {
    pub fn new(host: H) -> SegregatedListsBuilder<H> {
        SegregatedListsBuilder {
            host,
            chunks: Vec::new(),
            next_chunk_id: 0,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Allocates a block of at least `size` bytes, with an offset which is a
    /// multiple of `alignment` in the chunk's buffer.
    #[profiling::function]
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<BlockAllocation, GpuMemoryError> {
        debug_assert!(size > 0 && alignment > 0);
        let min_alignment = self.host.min_size_alignment();
        let too_large = || {
            let largest = self.host.class_max_size(self.host.class_count() - 1);
            GpuMemoryError::configuration(
                self.host.identifier(),
                format!(
                    "an allocation of {} (aligned to {alignment}) is larger than the largest size class ({})",
                    Bytes(size),
                    Bytes(largest),
                ),
            )
        };
        let alignment = alignment.max(min_alignment);
        let aligned_size = size.checked_next_multiple_of(min_alignment).ok_or_else(too_large)?;
        // Any block of this class has room for the allocation even at the worst alignment offset.
        let lookup_size = if alignment > min_alignment {
            aligned_size.checked_add(alignment).ok_or_else(too_large)?
        } else {
            aligned_size
        };
        let starting_class = find_class(&self.host, lookup_size).ok_or_else(too_large)?;
        let size = aligned_size;

        for chunk_index in 0..self.chunks.len() {
            if let Some(allocation) = self.allocate_from_chunk(chunk_index, starting_class, size, alignment) {
                return Ok(allocation);
            }
        }

        let (chunk, chunk_size) = self.host.allocate_chunk()?;
        let base_offset = self.host.locate(&chunk).base_offset;
        let id = ChunkId(self.next_chunk_id);
        self.next_chunk_id += 1;
        log::trace!(
            "{}: chunk #{} created ({} at offset {base_offset})",
            self.host.identifier(),
            id.0,
            Bytes(chunk_size),
        );
        self.chunks.push(ChunkRecord {
            id,
            chunk,
            base_offset,
            total_size: chunk_size,
            free_size: 0,
            free_lists: vec![Vec::new(); self.host.class_count()],
        });
        let chunk_index = self.chunks.len() - 1;
        self.insert_free_block(chunk_index, 0, chunk_size);

        if let Some(allocation) = self.allocate_from_chunk(chunk_index, starting_class, size, alignment) {
            return Ok(allocation);
        }
        let err = GpuMemoryError::OutOfMemory {
            identifier: self.host.identifier().to_string(),
            used: Bytes(self.allocated_bytes()),
            capacity: Bytes(self.capacity_bytes()),
            required: Bytes(lookup_size),
        };
        if let Some(record) = self.chunks.pop() {
            log::error!("{}: a fresh chunk of {} can't fit {}", self.host.identifier(), Bytes(chunk_size), Bytes(lookup_size));
            self.host.delete_chunk(record.chunk);
        }
        Err(err)
    }

    /// Carves the allocation out of the best fitting free block of the chunk,
    /// looking through the classes from `starting_class` upwards.
    fn allocate_from_chunk(&mut self, chunk_index: usize, starting_class: usize, size: u64, alignment: u64) -> Option<BlockAllocation> {
        let record = &mut self.chunks[chunk_index];
        let base_offset = record.base_offset;
        let mut found = None;
        for (class, free_list) in record.free_lists.iter().enumerate().skip(starting_class) {
            let mut best: Option<(usize, u64, u64)> = None;
            for (i, block) in free_list.iter().enumerate() {
                let aligned_address = (base_offset + block.address).next_multiple_of(alignment) - base_offset;
                if aligned_address + size > block.end() {
                    continue;
                }
                let remaining = block.end() - aligned_address - size;
                if best.map_or(true, |(_, _, best_remaining)| remaining < best_remaining) {
                    best = Some((i, aligned_address, remaining));
                    if remaining == 0 && aligned_address == block.address {
                        break;
                    }
                }
            }
            if let Some((i, aligned_address, _)) = best {
                found = Some((class, i, aligned_address));
                break;
            }
        }

        let (class, index, aligned_address) = found?;
        let block = record.free_lists[class].remove(index);
        record.free_size -= block.size;
        let id = record.id;

        if aligned_address > block.address {
            self.insert_free_block(chunk_index, block.address, aligned_address - block.address);
        }
        let allocation_end = aligned_address + size;
        if allocation_end < block.end() {
            self.insert_free_block(chunk_index, allocation_end, block.end() - allocation_end);
        }

        Some(BlockAllocation {
            chunk: id,
            offset: aligned_address,
            size,
        })
    }

    /// Adds the range to the free lists, merged with the free blocks right
    /// before and after it.
    fn insert_free_block(&mut self, chunk_index: usize, address: u64, size: u64) {
        let record = &mut self.chunks[chunk_index];
        debug_assert!(size > 0 && address + size <= record.total_size);

        let mut left = None;
        let mut right = None;
        for (class, free_list) in record.free_lists.iter().enumerate() {
            let i = free_list.partition_point(|block| block.address < address);
            if i > 0 && free_list[i - 1].end() == address {
                left = Some((class, i - 1));
            }
            if i < free_list.len() && free_list[i].address == address + size {
                right = Some((class, i));
            }
        }

        let mut merged = FreeBlock { address, size };
        let mut neighbours = left.into_iter().chain(right).collect::<ArrayVec<(usize, usize), 2>>();
        // Higher index first, the neighbours may be in the same list.
        neighbours.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        for (class, index) in neighbours {
            let block = record.free_lists[class].remove(index);
            merged.address = merged.address.min(block.address);
            merged.size += block.size;
        }

        record.free_size += size;
        debug_assert!(record.free_size <= record.total_size);
        let free_list = &mut record.free_lists[free_block_class(&self.host, merged.size)];
        let position = free_list.partition_point(|block| block.address < merged.address);
        free_list.insert(position, merged);
    }

    /// Returns a block allocated with [`SegregatedListsBuilder::allocate`].
    /// Chunks which become empty are handed back to the host.
    pub fn free(&mut self, chunk: ChunkId, offset: u64, size: u64) {
        self.free_block(chunk, offset, size, true);
    }

    pub(crate) fn free_block(&mut self, chunk: ChunkId, offset: u64, size: u64, release_empty_chunk: bool) {
        profiling::scope!("segregated list free");
        let Some(chunk_index) = self.chunks.iter().position(|record| record.id == chunk) else {
            log::error!(
                "{}: tried to free {} at offset {offset} of chunk #{}, which does not exist",
                self.host.identifier(),
                Bytes(size),
                chunk.0,
            );
            return;
        };
        let size = size.next_multiple_of(self.host.min_size_alignment());
        self.insert_free_block(chunk_index, offset, size);

        let record = &self.chunks[chunk_index];
        if release_empty_chunk && record.free_size == record.total_size && !self.host.retain_empty_chunk(self.chunks.len()) {
            let record = self.chunks.remove(chunk_index);
            log::debug!("{}: chunk #{} is empty, handing it back", self.host.identifier(), record.id.0);
            self.host.delete_chunk(record.chunk);
        }
    }

    pub fn locate(&self, chunk: ChunkId) -> Option<ChunkLocation> {
        let record = self.chunks.iter().find(|record| record.id == chunk)?;
        Some(self.host.locate(&record.chunk))
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.chunks.iter().map(|record| record.total_size - record.free_size).sum()
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.chunks.iter().map(|record| record.total_size).sum()
    }

    /// The share of the chunks' capacity that is not allocated, from 0 to 1.
    pub fn compute_external_fragmentation(&self) -> f32 {
        let capacity = self.capacity_bytes();
        if capacity == 0 {
            0.0
        } else {
            (capacity - self.allocated_bytes()) as f32 / capacity as f32
        }
    }

    /// `1 - largest free block / free size` of the worst chunk: 0 when each
    /// chunk's free memory is one block, approaching 1 when it's split into
    /// many small ones.
    pub fn largest_free_block_fragmentation(&self) -> f32 {
        let mut max_fragmentation = 0.0f32;
        for record in self.chunks.iter().filter(|record| record.free_size > 0) {
            let largest = record.free_lists.iter().flatten().map(|block| block.size).max().unwrap_or(0);
            let fragmentation = 1.0 - (largest as f64 / record.free_size as f64) as f32;
            max_fragmentation = max_fragmentation.max(fragmentation);
        }
        max_fragmentation
    }

    /// Adam Sawicki's metric of the worst chunk:
    /// `1 - (sqrt(sum of free block sizes squared) / free size)^2`.
    pub fn compute_external_fragmentation_sawicki(&self) -> f32 {
        let mut max_fragmentation = 0.0f32;
        for record in self.chunks.iter().filter(|record| record.free_size > 0) {
            let quality: f64 = record.free_lists.iter().flatten().map(|block| (block.size as f64).powi(2)).sum::<f64>().sqrt();
            let fragmentation = 1.0 - (quality / record.free_size as f64).powi(2);
            max_fragmentation = max_fragmentation.max(fragmentation as f32);
        }
        max_fragmentation
    }

    /// Checks the free lists for inconsistencies. Expensive, meant for tests
    /// and debugging.
    pub fn validate(&self) -> Result<(), GpuMemoryError> {
        let identifier = self.host.identifier();
        for record in &self.chunks {
            let chunk = record.id.0;
            if record.total_size == 0 {
                return Err(GpuMemoryError::corrupted(identifier, format!("chunk #{chunk} has a total size of 0")));
            }
            if record.free_size > record.total_size {
                return Err(GpuMemoryError::corrupted(
                    identifier,
                    format!("chunk #{chunk} has more free space ({}) than total space ({})", record.free_size, record.total_size),
                ));
            }

            let mut free_size = 0;
            for (class, free_list) in record.free_lists.iter().enumerate() {
                for (i, block) in free_list.iter().enumerate() {
                    if block.size == 0 || block.end() > record.total_size {
                        return Err(GpuMemoryError::corrupted(
                            identifier,
                            format!("chunk #{chunk} class {class} block {i} is empty or out of bounds"),
                        ));
                    }
                    if free_block_class(&self.host, block.size) != class {
                        return Err(GpuMemoryError::corrupted(
                            identifier,
                            format!("chunk #{chunk} class {class} block {i} ({} bytes) is in the wrong class", block.size),
                        ));
                    }
                    if i > 0 && free_list[i - 1].address >= block.address {
                        return Err(GpuMemoryError::corrupted(identifier, format!("chunk #{chunk} class {class} is not sorted")));
                    }
                    free_size += block.size;
                }
            }
            if free_size != record.free_size {
                return Err(GpuMemoryError::corrupted(
                    identifier,
                    format!("chunk #{chunk} free blocks add up to {free_size}, but the free size is {}", record.free_size),
                ));
            }

            let mut blocks = record.free_lists.iter().flatten().copied().collect::<Vec<_>>();
            blocks.sort_unstable_by_key(|block| block.address);
            for pair in blocks.windows(2) {
                // Touching blocks should have been merged.
                if pair[0].end() >= pair[1].address {
                    return Err(GpuMemoryError::corrupted(
                        identifier,
                        format!(
                            "chunk #{chunk} free blocks {}..{} and {}..{} overlap or were not merged",
                            pair[0].address,
                            pair[0].end(),
                            pair[1].address,
                            pair[1].end(),
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn dump_free_blocks(&self) -> String {
        let mut dump = String::new();
        for record in &self.chunks {
            let _ = writeln!(
                dump,
                "Chunk #{}, total size {}, free size {}",
                record.id.0, record.total_size, record.free_size
            );
            for (class, free_list) in record.free_lists.iter().enumerate().filter(|(_, list)| !list.is_empty()) {
                let _ = write!(dump, "  Class #{class}\n    ");
                for block in free_list {
                    let _ = write!(dump, "| {}-{}({}) ", block.address, block.end() - 1, block.size);
                }
                dump.push_str("|\n");
            }
        }
        dump
    }

    /// Drops every chunk, allocated or not. Returns the amount of bytes
    /// which were still allocated.
    pub(crate) fn release_all_chunks(&mut self) -> u64 {
        let leaked = self.allocated_bytes();
        if leaked > 0 {
            log::warn!(
                "{}: {} still allocated while releasing the pool's memory",
                self.host.identifier(),
                Bytes(leaked)
            );
        }
        self.chunks.clear();
        leaked
    }
}
