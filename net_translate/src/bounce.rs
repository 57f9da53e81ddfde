//! Ring-buffer allocator for bounce copies. Allocations are released in
//! FIFO order, which ring completion order guarantees; the pool is shared
//! across concurrent transmit translation calls and carries its own lock.

use net_pool::MemoryChunk;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use thiserror::Error;

/// Base of the synthetic address range bounce buffers are published under
/// when the chunk carries no device logical address.
const BOUNCE_VA_BASE: u64 = 0xb000_0000_0000;

#[derive(Debug, Error)]
#[error("out of bounce buffer memory")]
pub struct BounceExhausted;

#[derive(Debug)]
struct Cursors {
    head: u32,
    tail: u32,
    failed_allocations: u64,
}

struct BounceShared {
    chunk: MemoryChunk,
    len: u32,
    cursors: Mutex<Cursors>,
}

/// One committed bounce allocation.
#[derive(Debug)]
pub struct BounceBuffer {
    pub offset: u32,
    pub len: u32,
    /// Bytes to release on completion, including alignment and wrap padding.
    pub len_with_padding: u32,
    pub virtual_address: u64,
    pub logical_address: Option<u64>,
}

/// Cloneable handle; the adapter driver receives one at queue creation so it
/// can resolve bounce addresses handed to it in fragment descriptors.
#[derive(Clone)]
pub struct BouncePool {
    shared: Arc<BounceShared>,
}

impl BouncePool {
    pub fn new(chunk: MemoryChunk) -> Self {
        let len = chunk.len() as u32;
        Self {
            shared: Arc::new(BounceShared {
                chunk,
                len,
                cursors: Mutex::new(Cursors {
                    head: 0,
                    tail: len,
                    failed_allocations: 0,
                }),
            }),
        }
    }

    /// Allocates `len` contiguous bytes aligned to `alignment`. Fails with a
    /// retry signal when the ring cannot fit the request right now.
    pub fn allocate(&self, len: u32, alignment: u32) -> Result<BounceBuffer, BounceExhausted> {
        assert!(alignment.is_power_of_two());
        let shared = &self.shared;
        let mut cursors = shared.cursors.lock();
        if len == 0 || len > shared.len / 2 {
            cursors.failed_allocations += 1;
            return Err(BounceExhausted);
        }
        let mut start = cursors.head;
        let align_pad = start.wrapping_neg() & (alignment - 1);
        start = start.wrapping_add(align_pad);
        let mut padding = align_pad;
        let offset = start % shared.len;
        if offset + len > shared.len {
            // The allocation would straddle the wrap point; skip to the ring
            // start.
            padding += shared.len - offset;
            start = start.wrapping_add(shared.len - offset);
        }
        let len_with_padding = len + padding;
        if len_with_padding > cursors.tail.wrapping_sub(cursors.head) {
            cursors.failed_allocations += 1;
            return Err(BounceExhausted);
        }
        cursors.head = start.wrapping_add(len);
        let offset = start % shared.len;
        Ok(BounceBuffer {
            offset,
            len,
            len_with_padding,
            virtual_address: self.address_of(offset),
            logical_address: shared
                .chunk
                .logical_address()
                .map(|base| base + offset as u64),
        })
    }

    /// Frees the oldest reserved range. Ring completions are consumed in
    /// index order, so releases arrive FIFO.
    pub fn free(&self, len_with_padding: u32) {
        let mut cursors = self.shared.cursors.lock();
        cursors.tail = cursors.tail.wrapping_add(len_with_padding);
        debug_assert!(cursors.tail.wrapping_sub(cursors.head) <= self.shared.len);
    }

    pub fn bytes(&self, offset: u32, len: u32) -> &[AtomicU8] {
        &self.shared.chunk.data()[offset as usize..(offset + len) as usize]
    }

    fn address_of(&self, offset: u32) -> u64 {
        match self.shared.chunk.logical_address() {
            Some(base) => base + offset as u64,
            None => BOUNCE_VA_BASE + offset as u64,
        }
    }

    /// Resolves an address previously published in a fragment descriptor.
    pub fn resolve(&self, address: u64, len: u32) -> Option<&[AtomicU8]> {
        let base = match self.shared.chunk.logical_address() {
            Some(base) => base,
            None => BOUNCE_VA_BASE,
        };
        let offset = address.checked_sub(base)?;
        if offset + len as u64 > self.shared.len as u64 {
            return None;
        }
        Some(self.bytes(offset as u32, len))
    }

    pub fn failed_allocations(&self) -> u64 {
        self.shared.cursors.lock().failed_allocations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use net_pool::ChunkAllocator;
    use net_pool::ChunkSplitConfig;
    use net_pool::MemoryConstraint;
    use net_pool::PAGE_SIZE;

    fn pool(pages: usize) -> BouncePool {
        let mut alloc = ChunkAllocator::new(ChunkSplitConfig::default());
        alloc.add_memory_constraints(MemoryConstraint::Unmapped).unwrap();
        alloc.initialize().unwrap();
        let chunks = alloc
            .allocate_memory_chunks(pages * PAGE_SIZE, PAGE_SIZE, None)
            .unwrap();
        BouncePool::new(chunks.into_iter().next().unwrap())
    }

    #[test]
    fn fifo_alloc_free_cycles() {
        let pool = pool(1);
        for _ in 0..100 {
            let a = pool.allocate(1500, 64).unwrap();
            let b = pool.allocate(1500, 64).unwrap();
            assert_ne!(a.offset, b.offset);
            pool.free(a.len_with_padding);
            pool.free(b.len_with_padding);
        }
        assert_eq!(pool.failed_allocations(), 0);
    }

    #[test]
    fn exhaustion_is_recoverable() {
        let pool = pool(1);
        let a = pool.allocate(1800, 64).unwrap();
        let _b = pool.allocate(1800, 64).unwrap();
        assert!(pool.allocate(1800, 64).is_err());
        pool.free(a.len_with_padding);
        assert!(pool.allocate(1800, 64).is_ok());
    }

    #[test]
    fn allocations_are_aligned_and_resolvable() {
        let pool = pool(1);
        let a = pool.allocate(100, 128).unwrap();
        assert_eq!(a.offset % 128, 0);
        net_pool::bytes::atomic_write(pool.bytes(a.offset, a.len), &[7; 100]);
        let resolved = pool.resolve(a.virtual_address, a.len).unwrap();
        let mut out = [0u8; 100];
        net_pool::bytes::atomic_read(resolved, &mut out);
        assert_eq!(out, [7; 100]);
    }
}
