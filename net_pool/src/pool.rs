//! The fixed-stride buffer pool.

use crate::bytes;
use crate::MemoryChunk;
use crate::PoolError;
use crate::PAGE_SIZE;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;

/// Sizing request for one pool.
#[derive(Copy, Clone, Debug)]
pub struct BufferPoolParams {
    /// Number of buffers requested.
    pub pool_size: u32,
    /// Usable bytes per buffer.
    pub allocate_size: u32,
    /// Required offset of each buffer's first usable byte within its
    /// alignment stride.
    pub alignment_offset: u32,
    /// Buffer alignment, a power of two.
    pub alignment: u32,
}

/// Memory the caller must obtain (via the chunk allocator) to populate the
/// pool. Never less memory than requested, only more.
#[derive(Copy, Clone, Debug)]
pub struct PoolRequirements {
    pub total_size: usize,
    pub minimum_chunk_size: usize,
    pub stride: usize,
}

struct Bitmap(Vec<u64>);

impl Bitmap {
    fn new(len: usize) -> Self {
        Self(vec![0; len.div_ceil(64)])
    }

    fn get(&self, i: usize) -> bool {
        self.0[i / 64] & (1 << (i % 64)) != 0
    }

    fn set(&mut self, i: usize) {
        assert!(!self.get(i), "buffer {i} already in use");
        self.0[i / 64] |= 1 << (i % 64);
    }

    fn clear(&mut self, i: usize) {
        assert!(self.get(i), "buffer {i} already free");
        self.0[i / 64] &= !(1 << (i % 64));
    }
}

struct PoolState {
    free: Vec<u32>,
    /// Marks in-use buffers. Consulted only for consistency assertions; the
    /// fast path is the free-index stack.
    in_use: Bitmap,
    ref_counts: Vec<u32>,
    populated: usize,
}

struct PoolShared {
    chunks: Vec<MemoryChunk>,
    chunk_size: usize,
    stride: usize,
    leading: usize,
    buffer_size: usize,
    buffers_per_chunk: usize,
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn index_of(&self, address: u64) -> usize {
        let address = address as usize;
        let chunk = address / self.chunk_size;
        let offset = address % self.chunk_size;
        assert!(chunk < self.chunks.len(), "address outside pool");
        assert!(
            offset >= self.leading && (offset - self.leading) % self.stride == 0,
            "address does not name a buffer start"
        );
        chunk * self.buffers_per_chunk + (offset - self.leading) / self.stride
    }

    fn address_of(&self, index: usize) -> u64 {
        let chunk = index / self.buffers_per_chunk;
        let slot = index % self.buffers_per_chunk;
        (chunk * self.chunk_size + self.leading + slot * self.stride) as u64
    }

    fn data_of(&self, index: usize) -> &[AtomicU8] {
        let chunk = index / self.buffers_per_chunk;
        let slot = index % self.buffers_per_chunk;
        let start = self.leading + slot * self.stride;
        &self.chunks[chunk].data()[start..start + self.buffer_size]
    }

    fn logical_address_of(&self, index: usize) -> Option<u64> {
        let chunk = index / self.buffers_per_chunk;
        let slot = index % self.buffers_per_chunk;
        let start = self.leading + slot * self.stride;
        self.chunks[chunk]
            .logical_address()
            .map(|base| base + start as u64)
    }

    fn release(&self, index: usize) {
        let mut state = self.state.lock();
        let refs = &mut state.ref_counts[index];
        assert!(*refs > 0, "buffer {index} over-released");
        *refs -= 1;
        if *refs == 0 {
            state.in_use.clear(index);
            state.free.push(index as u32);
        }
    }
}

/// An allocated buffer. Dropping the last reference returns the buffer to
/// the pool; clones share the underlying buffer for chained descriptor use.
pub struct PoolBuffer {
    shared: Arc<PoolShared>,
    index: u32,
    detached: bool,
}

impl PoolBuffer {
    /// Linear pool address of the buffer's first usable byte.
    pub fn address(&self) -> u64 {
        self.shared.address_of(self.index as usize)
    }

    pub fn capacity(&self) -> usize {
        self.shared.buffer_size
    }

    pub fn data(&self) -> &[AtomicU8] {
        self.shared.data_of(self.index as usize)
    }

    /// Device-visible address, present when the backing chunks are
    /// DMA-mapped.
    pub fn logical_address(&self) -> Option<u64> {
        self.shared.logical_address_of(self.index as usize)
    }

    /// Adds a reference for chained use; the buffer returns to the free list
    /// only when the last reference drops.
    pub fn clone_ref(&self) -> PoolBuffer {
        let mut state = self.shared.state.lock();
        state.ref_counts[self.index as usize] += 1;
        drop(state);
        PoolBuffer {
            shared: self.shared.clone(),
            index: self.index,
            detached: false,
        }
    }

    /// Releases the handle without dropping the buffer's reference; the
    /// caller must later reclaim it by address.
    pub fn into_address(mut self) -> u64 {
        self.detached = true;
        self.address()
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        if !self.detached {
            self.shared.release(self.index as usize);
        }
    }
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("index", &self.index)
            .field("address", &self.address())
            .finish()
    }
}

/// Fixed-stride partition of one or more memory chunks into equal buffers.
/// Clones share the same pool; the adapter driver receives one for data
/// access to the buffers named in ring descriptors.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Computes the pool geometry. The returned requirements tell the caller
    /// how much chunk memory to obtain before [`Self::add_memory_chunks`].
    pub fn initialize(params: BufferPoolParams) -> Result<(Self, PoolRequirements), PoolError> {
        assert!(params.alignment.is_power_of_two());
        assert!(params.alignment_offset < params.alignment);
        if params.pool_size == 0 || params.allocate_size == 0 {
            return Err(PoolError::InsufficientResources { requested: 0 });
        }
        let stride = (params.allocate_size as usize).next_multiple_of(params.alignment as usize);
        let leading = params.alignment_offset as usize;
        let minimum_chunk_size = (leading + stride).next_multiple_of(PAGE_SIZE);
        let total_size =
            (leading + params.pool_size as usize * stride).next_multiple_of(PAGE_SIZE);
        let shared = Arc::new(PoolShared {
            chunks: Vec::new(),
            chunk_size: 0,
            stride,
            leading,
            buffer_size: params.allocate_size as usize,
            buffers_per_chunk: 0,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                in_use: Bitmap::new(0),
                ref_counts: Vec::new(),
                populated: 0,
            }),
        });
        Ok((
            Self { shared },
            PoolRequirements {
                total_size,
                minimum_chunk_size,
                stride,
            },
        ))
    }

    /// Takes ownership of chunks previously allocated to this pool's
    /// requirements and populates the buffer arena. Chunk invariants are the
    /// caller's contract; they are asserted, not revalidated.
    pub fn add_memory_chunks(&mut self, chunks: Vec<MemoryChunk>) {
        let shared = Arc::get_mut(&mut self.shared)
            .expect("chunks are added before any buffer is handed out");
        assert!(!chunks.is_empty());
        assert!(shared.chunks.is_empty(), "pool already populated");
        let chunk_size = chunks[0].len();
        assert!(chunk_size % PAGE_SIZE == 0);
        assert!(chunks.iter().all(|c| c.len() == chunk_size));
        assert!(chunk_size >= shared.leading + shared.stride);

        let buffers_per_chunk = (chunk_size - shared.leading) / shared.stride;
        let populated = buffers_per_chunk * chunks.len();
        shared.chunk_size = chunk_size;
        shared.buffers_per_chunk = buffers_per_chunk;
        shared.chunks = chunks;
        let state = shared.state.get_mut();
        state.free = (0..populated as u32).rev().collect();
        state.in_use = Bitmap::new(populated);
        state.ref_counts = vec![0; populated];
        state.populated = populated;
    }

    /// O(1) pop from the free-index stack.
    pub fn allocate(&self) -> Result<PoolBuffer, PoolError> {
        let mut state = self.shared.state.lock();
        let index = state.free.pop().ok_or(PoolError::Exhausted)?;
        state.in_use.set(index as usize);
        state.ref_counts[index as usize] = 1;
        drop(state);
        Ok(PoolBuffer {
            shared: self.shared.clone(),
            index,
            detached: false,
        })
    }

    /// Reclaims a buffer by its linear address, recomputing its chunk index
    /// and in-chunk offset rather than storing back-pointers.
    pub fn free_by_address(&self, address: u64) {
        let index = self.shared.index_of(address);
        self.shared.release(index);
    }

    /// Reattaches a handle to a buffer previously released with
    /// [`PoolBuffer::into_address`]. Does not change the reference count.
    pub fn adopt(&self, address: u64) -> PoolBuffer {
        let index = self.shared.index_of(address);
        assert!(self.shared.state.lock().in_use.get(index));
        PoolBuffer {
            shared: self.shared.clone(),
            index: index as u32,
            detached: false,
        }
    }

    pub fn available(&self) -> usize {
        self.shared.state.lock().free.len()
    }

    pub fn populated(&self) -> usize {
        self.shared.state.lock().populated
    }

    /// Copies data out of pool memory by linear address.
    pub fn read(&self, address: u64, dest: &mut [u8]) {
        let index = self.shared.index_of(address);
        bytes::atomic_read(self.shared.data_of(index), dest);
    }

    /// Copies data into pool memory at `address` plus `offset`.
    pub fn write(&self, address: u64, offset: usize, src: &[u8]) {
        let index = self.shared.index_of(address);
        bytes::atomic_write(&self.shared.data_of(index)[offset..], src);
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let state = self.shared.state.lock();
        let outstanding = state.populated - state.free.len();
        if outstanding != 0 {
            tracing::error!(outstanding, "buffer pool destroyed with buffers in use");
        }
    }
}
