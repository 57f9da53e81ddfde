//! Memory chunk allocation and the fixed-stride buffer pool backing each
//! receive queue.
//!
//! A [`ChunkAllocator`] turns one mapping constraint into a concrete backing
//! (a simulated DMA common-buffer space or plain heap memory) and splits
//! large requests into progressively smaller chunks until the backing can
//! satisfy them. A [`BufferPool`] partitions those chunks into equal,
//! aligned buffers and hands them out in O(1) with no allocation on the hot
//! path.

pub mod bytes;
mod pool;

pub use pool::BufferPool;
pub use pool::BufferPoolParams;
pub use pool::PoolBuffer;
pub use pool::PoolRequirements;

use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use thiserror::Error;

pub const PAGE_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum PoolError {
    /// A second, distinct memory constraint was supplied. One memory domain
    /// per allocator instance.
    #[error("only one memory constraint set is supported")]
    MultipleConstraints,
    #[error("allocator is not initialized")]
    NotInitialized,
    #[error("insufficient resources for a {requested}-byte allocation")]
    InsufficientResources { requested: usize },
    /// The pool has no free buffers right now. Retry on a later iteration.
    #[error("buffer pool exhausted")]
    Exhausted,
}

/// Mapping requirement recorded before the backing allocator is selected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryConstraint {
    /// Plain host memory.
    Unmapped,
    /// Chunks must carry a device-visible logical address no higher than
    /// `maximum_physical_address`.
    DmaMapped { maximum_physical_address: u64 },
}

/// One large backing allocation. Owned by the allocator that created it
/// until handed to a buffer pool.
#[derive(Debug)]
pub struct MemoryChunk {
    mem: Arc<[AtomicU8]>,
    logical_address: Option<u64>,
}

impl MemoryChunk {
    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    /// Device-visible address of the chunk's first byte, if DMA-mapped.
    pub fn logical_address(&self) -> Option<u64> {
        self.logical_address
    }

    pub fn data(&self) -> &[AtomicU8] {
        &self.mem
    }
}

/// Chunk-splitting knobs. `initial_chunk_count` replaces the process-wide
/// override the splitting strategy is tested with; `max_single_allocation`
/// makes the heap backing refuse allocations above a threshold.
#[derive(Copy, Clone, Debug)]
pub struct ChunkSplitConfig {
    pub initial_chunk_count: u32,
    pub max_single_allocation: Option<usize>,
}

impl Default for ChunkSplitConfig {
    fn default() -> Self {
        Self {
            initial_chunk_count: 1,
            max_single_allocation: None,
        }
    }
}

trait ChunkBacking: Send {
    fn allocate(&mut self, len: usize) -> Result<MemoryChunk, PoolError>;
}

struct HeapBacking {
    max_single_allocation: Option<usize>,
}

impl ChunkBacking for HeapBacking {
    fn allocate(&mut self, len: usize) -> Result<MemoryChunk, PoolError> {
        if self.max_single_allocation.is_some_and(|max| len > max) {
            return Err(PoolError::InsufficientResources { requested: len });
        }
        Ok(MemoryChunk {
            mem: bytes::alloc_bytes(len).into(),
            logical_address: None,
        })
    }
}

/// Simulated DMA common-buffer space: every chunk is physically contiguous
/// and carries a logical address carved from a flat device address space.
struct CommonBufferBacking {
    next_logical: u64,
    maximum_physical_address: u64,
    max_single_allocation: Option<usize>,
}

impl ChunkBacking for CommonBufferBacking {
    fn allocate(&mut self, len: usize) -> Result<MemoryChunk, PoolError> {
        if self.max_single_allocation.is_some_and(|max| len > max) {
            return Err(PoolError::InsufficientResources { requested: len });
        }
        let end = self
            .next_logical
            .checked_add(len as u64)
            .filter(|&end| end <= self.maximum_physical_address)
            .ok_or(PoolError::InsufficientResources { requested: len })?;
        let logical = self.next_logical;
        self.next_logical = end.next_multiple_of(PAGE_SIZE as u64);
        Ok(MemoryChunk {
            mem: bytes::alloc_bytes(len).into(),
            logical_address: Some(logical),
        })
    }
}

/// Allocates physically-backed memory chunks under one mapping constraint.
pub struct ChunkAllocator {
    constraint: Option<MemoryConstraint>,
    backing: Option<Box<dyn ChunkBacking>>,
    split: ChunkSplitConfig,
}

impl ChunkAllocator {
    pub fn new(split: ChunkSplitConfig) -> Self {
        Self {
            constraint: None,
            backing: None,
            split,
        }
    }

    /// Records the mapping requirement. A second distinct constraint set is
    /// rejected.
    pub fn add_memory_constraints(&mut self, constraint: MemoryConstraint) -> Result<(), PoolError> {
        match self.constraint {
            None => {
                self.constraint = Some(constraint);
                Ok(())
            }
            Some(existing) if existing == constraint => Ok(()),
            Some(_) => Err(PoolError::MultipleConstraints),
        }
    }

    /// Selects the concrete backing for the recorded constraint.
    pub fn initialize(&mut self) -> Result<(), PoolError> {
        let backing: Box<dyn ChunkBacking> = match self.constraint {
            Some(MemoryConstraint::DmaMapped {
                maximum_physical_address,
            }) => Box::new(CommonBufferBacking {
                next_logical: PAGE_SIZE as u64,
                maximum_physical_address,
                max_single_allocation: self.split.max_single_allocation,
            }),
            Some(MemoryConstraint::Unmapped) | None => Box::new(HeapBacking {
                max_single_allocation: self.split.max_single_allocation,
            }),
        };
        self.backing = Some(backing);
        Ok(())
    }

    /// Allocates at least `total_size` bytes as one or more equally sized
    /// chunks. Starts with one allocation of the full size; on failure the
    /// chunk size is halved and the chunk count doubled until either every
    /// chunk allocates or the chunk size would fall below `min_chunk_size`.
    pub fn allocate_memory_chunks(
        &mut self,
        total_size: usize,
        min_chunk_size: usize,
        preferred_node: Option<u32>,
    ) -> Result<Vec<MemoryChunk>, PoolError> {
        let backing = self.backing.as_mut().ok_or(PoolError::NotInitialized)?;
        assert!(min_chunk_size > 0 && min_chunk_size % PAGE_SIZE == 0);

        let mut chunk_count = self.split.initial_chunk_count.max(1) as usize;
        let mut chunk_size = total_size
            .div_ceil(chunk_count)
            .next_multiple_of(min_chunk_size);

        loop {
            let mut chunks = Vec::with_capacity(chunk_count);
            let mut failed = false;
            for _ in 0..chunk_count {
                match backing.allocate(chunk_size) {
                    Ok(chunk) => chunks.push(chunk),
                    Err(_) => {
                        failed = true;
                        break;
                    }
                }
            }
            if !failed {
                tracing::debug!(
                    total_size,
                    chunk_size,
                    chunk_count,
                    preferred_node,
                    "allocated memory chunks"
                );
                return Ok(chunks);
            }
            // Release everything built for this attempt before retrying.
            drop(chunks);

            let next_size = (chunk_size / 2).next_multiple_of(min_chunk_size);
            if next_size >= chunk_size || next_size < min_chunk_size {
                return Err(PoolError::InsufficientResources {
                    requested: total_size,
                });
            }
            chunk_size = next_size;
            chunk_count *= 2;
        }
    }
}
