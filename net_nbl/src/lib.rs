//! The legacy buffer-descriptor chain model: memory descriptors (MDLs),
//! net buffers, and net buffer lists, plus the index-addressed shell pool
//! the receive path draws from.
//!
//! Chains are modeled as owned vectors rather than intrusive pointer lists;
//! a buffer list's identity within the pool is its index, carried in the
//! list's reserved slot while it is lent out.

use net_defs::Layer3Type;
use net_defs::LsoInfo;
use net_defs::PacketLayout;
use net_defs::RscInfo;
use net_defs::RxChecksumInfo;
use net_defs::TxChecksumInfo;
use net_pool::PoolBuffer;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NblError {
    /// The shell pool has no free lists right now. Retry later.
    #[error("net buffer list pool exhausted")]
    Exhausted,
    #[error("retreat of {requested} bytes exceeds headroom {available}")]
    InsufficientHeadroom { requested: usize, available: usize },
    #[error("advance of {requested} bytes exceeds data length {available}")]
    InsufficientData { requested: usize, available: usize },
}

/// Identifies a buffer list within its pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NblId(pub u32);

/// Externally owned frame memory. The creator assigns the base address; the
/// translation layer passes it through untouched.
#[derive(Clone)]
pub struct ExternalMemory {
    pub base_address: u64,
    pub bytes: Arc<[AtomicU8]>,
}

impl std::fmt::Debug for ExternalMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalMemory")
            .field("base_address", &self.base_address)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Backing memory for one memory descriptor.
#[derive(Debug)]
pub enum MdlMemory {
    /// Pool-backed; dropping the descriptor releases the buffer reference.
    Pool(PoolBuffer),
    External(ExternalMemory),
}

/// One memory descriptor: a physically backed virtual byte range, possibly
/// starting at an offset into its backing.
#[derive(Debug)]
pub struct Mdl {
    memory: MdlMemory,
    byte_offset: usize,
    byte_count: usize,
}

impl Mdl {
    pub fn new(memory: MdlMemory, byte_count: usize) -> Self {
        Self::with_offset(memory, 0, byte_count)
    }

    pub fn with_offset(memory: MdlMemory, byte_offset: usize, byte_count: usize) -> Self {
        let capacity = match &memory {
            MdlMemory::Pool(buf) => buf.capacity(),
            MdlMemory::External(ext) => ext.bytes.len(),
        };
        assert!(
            byte_offset + byte_count <= capacity,
            "descriptor exceeds its backing"
        );
        Self {
            memory,
            byte_offset,
            byte_count,
        }
    }

    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    pub fn bytes(&self) -> &[AtomicU8] {
        let range = self.byte_offset..self.byte_offset + self.byte_count;
        match &self.memory {
            MdlMemory::Pool(buf) => &buf.data()[range],
            MdlMemory::External(ext) => &ext.bytes[range],
        }
    }

    pub fn virtual_address(&self) -> u64 {
        let base = match &self.memory {
            MdlMemory::Pool(buf) => buf.address(),
            MdlMemory::External(ext) => ext.base_address,
        };
        base + self.byte_offset as u64
    }

    /// Device-visible address, present only for DMA-mapped pool memory.
    pub fn logical_address(&self) -> Option<u64> {
        match &self.memory {
            MdlMemory::Pool(buf) => buf.logical_address().map(|la| la + self.byte_offset as u64),
            MdlMemory::External(_) => None,
        }
    }
}

/// One data segment of a frame: a data window over an MDL chain.
#[derive(Debug, Default)]
pub struct NetBuffer {
    mdls: Vec<Mdl>,
    data_offset: usize,
    data_length: usize,
}

impl NetBuffer {
    pub fn new(mdls: Vec<Mdl>, data_offset: usize, data_length: usize) -> Self {
        let total: usize = mdls.iter().map(|m| m.byte_count()).sum();
        assert!(data_offset + data_length <= total, "window exceeds chain");
        Self {
            mdls,
            data_offset,
            data_length,
        }
    }

    pub fn mdls(&self) -> &[Mdl] {
        &self.mdls
    }

    pub fn data_offset(&self) -> usize {
        self.data_offset
    }

    pub fn data_length(&self) -> usize {
        self.data_length
    }

    /// Moves the data start backwards to expose headroom (backfill space).
    pub fn retreat(&mut self, bytes: usize) -> Result<(), NblError> {
        if bytes > self.data_offset {
            return Err(NblError::InsufficientHeadroom {
                requested: bytes,
                available: self.data_offset,
            });
        }
        self.data_offset -= bytes;
        self.data_length += bytes;
        Ok(())
    }

    /// Moves the data start forward, shrinking the window.
    pub fn advance(&mut self, bytes: usize) -> Result<(), NblError> {
        if bytes > self.data_length {
            return Err(NblError::InsufficientData {
                requested: bytes,
                available: self.data_length,
            });
        }
        self.data_offset += bytes;
        self.data_length -= bytes;
        Ok(())
    }

    /// Copies the data window into `dest`, returning the bytes copied.
    pub fn copy_data_to(&self, dest: &mut [u8]) -> usize {
        let mut skip = self.data_offset;
        let mut remaining = self.data_length.min(dest.len());
        let mut written = 0;
        for mdl in &self.mdls {
            if remaining == 0 {
                break;
            }
            let bytes = mdl.bytes();
            if skip >= bytes.len() {
                skip -= bytes.len();
                continue;
            }
            let take = (bytes.len() - skip).min(remaining);
            net_pool::bytes::atomic_read(
                &bytes[skip..skip + take],
                &mut dest[written..written + take],
            );
            skip = 0;
            remaining -= take;
            written += take;
        }
        written
    }
}

/// Number of pointer-sized reserved slots in each buffer list. Private
/// translation context must fit here; asserted at compile time by users.
pub const NBL_RESERVED_SLOTS: usize = 2;

/// One frame: one or more data segments plus per-frame offload metadata and
/// the reserved area the translation layer stashes its context in. Most
/// frames carry a single segment; segmentation offload produces several.
#[derive(Debug, Default)]
pub struct NetBufferList {
    pub net_buffers: Vec<NetBuffer>,
    pub frame_layer3: Layer3Type,
    pub layout: PacketLayout,
    pub rx_checksum: RxChecksumInfo,
    pub tx_checksum: TxChecksumInfo,
    pub lso: LsoInfo,
    pub rsc: RscInfo,
    reserved: [u64; NBL_RESERVED_SLOTS],
}

impl NetBufferList {
    pub fn set_reserved(&mut self, slot: usize, value: u64) {
        self.reserved[slot] = value;
    }

    pub fn reserved(&self, slot: usize) -> u64 {
        self.reserved[slot]
    }

    /// Clears data and metadata for reuse from the shell pool. Dropping the
    /// old MDL chain releases any pool buffer references it held.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Preallocated shells addressed by index. Allocation never touches the
/// heap beyond the shells' own reusable vectors.
pub struct NblPool {
    shells: Vec<Option<Box<NetBufferList>>>,
    free: Vec<u32>,
}

impl NblPool {
    pub fn new(count: u32) -> Self {
        Self {
            shells: (0..count).map(|_| Some(Default::default())).collect(),
            free: (0..count).rev().collect(),
        }
    }

    pub fn allocate(&mut self) -> Result<(NblId, Box<NetBufferList>), NblError> {
        let index = self.free.pop().ok_or(NblError::Exhausted)?;
        let shell = self.shells[index as usize]
            .take()
            .expect("free shell is present");
        Ok((NblId(index), shell))
    }

    pub fn free(&mut self, id: NblId, mut nbl: Box<NetBufferList>) {
        nbl.reset();
        let slot = &mut self.shells[id.0 as usize];
        assert!(slot.is_none(), "shell {} double freed", id.0);
        *slot = Some(nbl);
        self.free.push(id.0);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.shells.len()
    }
}
