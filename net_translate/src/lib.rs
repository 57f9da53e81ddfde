//! The ring⇄descriptor-chain translation engines: the receive path that
//! drains hardware-filled packet rings into legacy buffer lists, and the
//! transmit path that turns buffer lists into ring fragments, bouncing
//! through owned copy buffers when the originals cannot be used directly.

mod bounce;
pub mod driver;
mod layout;
pub mod rx;
#[cfg(test)]
pub(crate) mod testing;
pub mod tx;

pub use bounce::BouncePool;
pub use layout::parse_frame;
pub use layout::resolve_frame_layer3;

use thiserror::Error;

/// Scatter/gather element produced by the platform DMA abstraction.
#[derive(Copy, Clone, Debug)]
pub struct SgElement {
    pub logical_address: u64,
    pub length: u32,
}

/// A completed DMA mapping for one data segment.
#[derive(Debug)]
pub struct SgList {
    pub elements: Vec<SgElement>,
    /// Opaque mapper handle, passed back on release.
    pub handle: u64,
}

#[derive(Debug, Error)]
#[error("dma mapping failed")]
pub struct DmaError;

/// The platform DMA mapping seam. Every call is fallible; mapping failure
/// downgrades a packet to the bounce path, never a fault.
pub trait DmaMapper: Send + Sync {
    /// Builds a scatter/gather list covering `net_buffer`'s data window.
    fn build_scatter_gather(&self, net_buffer: &net_nbl::NetBuffer) -> Result<SgList, DmaError>;

    /// Releases a mapping produced by [`Self::build_scatter_gather`].
    fn put_scatter_gather(&self, list: SgList);
}
