//! Fixed-capacity descriptor rings shared between the translation layer and
//! the adapter driver.
//!
//! A ring is a power-of-two circular array of descriptor slots with three
//! free-running cursors. The translation layer posts slots to the driver by
//! advancing the posted cursor, the driver hands slots back by advancing the
//! completed cursor, and the translation layer retires them by advancing the
//! consumed cursor. Free-running `u32` cursors are masked on every access, so
//! the full capacity is usable and region sizes are plain wrapping
//! subtractions.

use net_defs::ExtensionId;
use net_defs::FragmentDescriptor;
use net_defs::LsoInfo;
use net_defs::PacketDescriptor;
use net_defs::RscInfo;
use net_defs::RxChecksumInfo;
use net_defs::TxChecksumInfo;
use net_defs::EXTENSION_CHECKSUM;
use net_defs::EXTENSION_LOGICAL_ADDRESS;
use net_defs::EXTENSION_LSO;
use net_defs::EXTENSION_MDL;
use net_defs::EXTENSION_RSC;
use net_defs::EXTENSION_VIRTUAL_ADDRESS;
use thiserror::Error;

const MAX_RING_CAPACITY: u32 = 1 << 16;

#[derive(Debug, Error)]
pub enum RingError {
    #[error("ring capacity {0} is not a power of two")]
    NotPowerOfTwo(u32),
    #[error("ring capacity {0} out of range")]
    InvalidCapacity(u32),
    #[error("extension {name} version {version} was not negotiated")]
    UnknownExtension { name: &'static str, version: u32 },
}

/// One descriptor ring.
#[derive(Debug)]
pub struct Ring<T> {
    entries: Box<[T]>,
    mask: u32,
    /// Next slot the translation layer will post to the driver.
    posted: u32,
    /// Driver's completion boundary; slots in `[consumed, completed)` are
    /// done but not yet retired by the translation layer.
    completed: u32,
    /// Translation layer's retirement boundary.
    consumed: u32,
}

impl<T: Default + Clone> Ring<T> {
    pub fn new(capacity: u32) -> Result<Self, RingError> {
        if !capacity.is_power_of_two() {
            return Err(RingError::NotPowerOfTwo(capacity));
        }
        if capacity < 2 || capacity > MAX_RING_CAPACITY {
            return Err(RingError::InvalidCapacity(capacity));
        }
        Ok(Self {
            entries: vec![T::default(); capacity as usize].into(),
            mask: capacity - 1,
            posted: 0,
            completed: 0,
            consumed: 0,
        })
    }
}

impl<T> Ring<T> {
    pub fn capacity(&self) -> u32 {
        self.mask + 1
    }

    /// Maps a free-running cursor value to a slot index.
    pub fn mask_index(&self, raw: u32) -> u32 {
        raw & self.mask
    }

    pub fn get(&self, raw: u32) -> &T {
        &self.entries[(raw & self.mask) as usize]
    }

    pub fn get_mut(&mut self, raw: u32) -> &mut T {
        &mut self.entries[(raw & self.mask) as usize]
    }

    pub fn posted_cursor(&self) -> u32 {
        self.posted
    }

    pub fn completed_cursor(&self) -> u32 {
        self.completed
    }

    pub fn consumed_cursor(&self) -> u32 {
        self.consumed
    }

    /// Slots currently owned by the driver.
    pub fn hardware_owned(&self) -> u32 {
        self.posted.wrapping_sub(self.completed)
    }

    /// Completed slots the translation layer has not yet retired.
    pub fn awaiting_consume(&self) -> u32 {
        self.completed.wrapping_sub(self.consumed)
    }

    /// Slots free for posting.
    pub fn free_slots(&self) -> u32 {
        self.capacity() - self.posted.wrapping_sub(self.consumed)
    }

    /// Hands `n` filled slots to the driver.
    pub fn post(&mut self, n: u32) {
        assert!(n <= self.free_slots(), "ring overpost");
        self.posted = self.posted.wrapping_add(n);
    }

    /// Driver side: returns `n` slots to the translation layer.
    pub fn complete(&mut self, n: u32) {
        assert!(n <= self.hardware_owned(), "ring overcomplete");
        self.completed = self.completed.wrapping_add(n);
    }

    /// Retires `n` completed slots, freeing them for reuse.
    pub fn consume(&mut self, n: u32) {
        assert!(n <= self.awaiting_consume(), "ring overconsume");
        self.consumed = self.consumed.wrapping_add(n);
    }
}

/// A token returned by extension lookup, cached by the queue for its
/// lifetime. The closed set of known extensions replaces query-by-offset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketExtension {
    /// Valid for both directions; receive queues read the evaluation form,
    /// transmit queues the offload-request form.
    Checksum,
    Lso,
    Rsc,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FragmentExtension {
    VirtualAddress,
    LogicalAddress,
    Mdl,
}

#[derive(Debug, Default)]
struct PacketExtensionStore {
    rx_checksum: Option<Box<[RxChecksumInfo]>>,
    tx_checksum: Option<Box<[TxChecksumInfo]>>,
    lso: Option<Box<[LsoInfo]>>,
    rsc: Option<Box<[RscInfo]>>,
}

#[derive(Debug, Default)]
struct FragmentExtensionStore {
    virtual_address: Option<Box<[u64]>>,
    logical_address: Option<Box<[u64]>>,
    mdl: Option<Box<[u64]>>,
}

/// Configuration for one packet/fragment ring pair.
#[derive(Debug, Clone)]
pub struct RingPairConfig {
    pub packet_capacity: u32,
    pub fragment_capacity: u32,
    pub packet_extensions: Vec<ExtensionId>,
    pub fragment_extensions: Vec<ExtensionId>,
}

/// The packet ring, fragment ring, and their extension arrays for one queue.
/// This is the object lent to the adapter driver on `advance`/`cancel`.
#[derive(Debug)]
pub struct RingPair {
    packets: Ring<PacketDescriptor>,
    fragments: Ring<FragmentDescriptor>,
    packet_ext: PacketExtensionStore,
    fragment_ext: FragmentExtensionStore,
}

impl RingPair {
    pub fn new(config: &RingPairConfig) -> Result<Self, RingError> {
        let packets = Ring::new(config.packet_capacity)?;
        let fragments = Ring::new(config.fragment_capacity)?;
        let mut packet_ext = PacketExtensionStore::default();
        for &id in &config.packet_extensions {
            let n = config.packet_capacity as usize;
            match id {
                EXTENSION_CHECKSUM => {
                    packet_ext.rx_checksum = Some(vec![Default::default(); n].into());
                    packet_ext.tx_checksum = Some(vec![Default::default(); n].into());
                }
                EXTENSION_LSO => packet_ext.lso = Some(vec![Default::default(); n].into()),
                EXTENSION_RSC => packet_ext.rsc = Some(vec![Default::default(); n].into()),
                other => {
                    return Err(RingError::UnknownExtension {
                        name: other.name,
                        version: other.version,
                    })
                }
            }
        }
        let mut fragment_ext = FragmentExtensionStore::default();
        for &id in &config.fragment_extensions {
            let n = config.fragment_capacity as usize;
            match id {
                EXTENSION_VIRTUAL_ADDRESS => {
                    fragment_ext.virtual_address = Some(vec![0; n].into())
                }
                EXTENSION_LOGICAL_ADDRESS => {
                    fragment_ext.logical_address = Some(vec![0; n].into())
                }
                EXTENSION_MDL => fragment_ext.mdl = Some(vec![0; n].into()),
                other => {
                    return Err(RingError::UnknownExtension {
                        name: other.name,
                        version: other.version,
                    })
                }
            }
        }
        Ok(Self {
            packets,
            fragments,
            packet_ext,
            fragment_ext,
        })
    }

    pub fn packets(&self) -> &Ring<PacketDescriptor> {
        &self.packets
    }

    pub fn packets_mut(&mut self) -> &mut Ring<PacketDescriptor> {
        &mut self.packets
    }

    pub fn fragments(&self) -> &Ring<FragmentDescriptor> {
        &self.fragments
    }

    pub fn fragments_mut(&mut self) -> &mut Ring<FragmentDescriptor> {
        &mut self.fragments
    }

    /// Resolves a packet extension at queue creation. The returned token is
    /// cached by the queue; it never needs to be re-queried.
    pub fn query_packet_extension(&self, id: ExtensionId) -> Result<PacketExtension, RingError> {
        let ext = match id {
            EXTENSION_CHECKSUM if self.packet_ext.rx_checksum.is_some() => {
                PacketExtension::Checksum
            }
            EXTENSION_LSO if self.packet_ext.lso.is_some() => PacketExtension::Lso,
            EXTENSION_RSC if self.packet_ext.rsc.is_some() => PacketExtension::Rsc,
            other => {
                return Err(RingError::UnknownExtension {
                    name: other.name,
                    version: other.version,
                })
            }
        };
        Ok(ext)
    }

    pub fn query_fragment_extension(
        &self,
        id: ExtensionId,
    ) -> Result<FragmentExtension, RingError> {
        let ext = match id {
            EXTENSION_VIRTUAL_ADDRESS if self.fragment_ext.virtual_address.is_some() => {
                FragmentExtension::VirtualAddress
            }
            EXTENSION_LOGICAL_ADDRESS if self.fragment_ext.logical_address.is_some() => {
                FragmentExtension::LogicalAddress
            }
            EXTENSION_MDL if self.fragment_ext.mdl.is_some() => FragmentExtension::Mdl,
            other => {
                return Err(RingError::UnknownExtension {
                    name: other.name,
                    version: other.version,
                })
            }
        };
        Ok(ext)
    }

    pub fn rx_checksum(&self, raw: u32) -> RxChecksumInfo {
        let idx = self.packets.mask_index(raw) as usize;
        self.packet_ext.rx_checksum.as_ref().expect("negotiated at queue creation")[idx]
    }

    pub fn set_rx_checksum(&mut self, raw: u32, value: RxChecksumInfo) {
        let idx = self.packets.mask_index(raw) as usize;
        self.packet_ext.rx_checksum.as_mut().expect("negotiated at queue creation")[idx] = value;
    }

    pub fn tx_checksum(&self, raw: u32) -> TxChecksumInfo {
        let idx = self.packets.mask_index(raw) as usize;
        self.packet_ext.tx_checksum.as_ref().expect("negotiated at queue creation")[idx]
    }

    pub fn set_tx_checksum(&mut self, raw: u32, value: TxChecksumInfo) {
        let idx = self.packets.mask_index(raw) as usize;
        self.packet_ext.tx_checksum.as_mut().expect("negotiated at queue creation")[idx] = value;
    }

    pub fn lso(&self, raw: u32) -> LsoInfo {
        let idx = self.packets.mask_index(raw) as usize;
        self.packet_ext.lso.as_ref().expect("negotiated at queue creation")[idx]
    }

    pub fn set_lso(&mut self, raw: u32, value: LsoInfo) {
        let idx = self.packets.mask_index(raw) as usize;
        self.packet_ext.lso.as_mut().expect("negotiated at queue creation")[idx] = value;
    }

    pub fn rsc(&self, raw: u32) -> RscInfo {
        let idx = self.packets.mask_index(raw) as usize;
        self.packet_ext.rsc.as_ref().expect("negotiated at queue creation")[idx]
    }

    pub fn set_rsc(&mut self, raw: u32, value: RscInfo) {
        let idx = self.packets.mask_index(raw) as usize;
        self.packet_ext.rsc.as_mut().expect("negotiated at queue creation")[idx] = value;
    }

    pub fn fragment_virtual_address(&self, raw: u32) -> u64 {
        let idx = self.fragments.mask_index(raw) as usize;
        self.fragment_ext.virtual_address.as_ref().expect("negotiated at queue creation")[idx]
    }

    pub fn set_fragment_virtual_address(&mut self, raw: u32, value: u64) {
        let idx = self.fragments.mask_index(raw) as usize;
        self.fragment_ext.virtual_address.as_mut().expect("negotiated at queue creation")[idx] =
            value;
    }

    pub fn fragment_logical_address(&self, raw: u32) -> u64 {
        let idx = self.fragments.mask_index(raw) as usize;
        self.fragment_ext.logical_address.as_ref().expect("negotiated at queue creation")[idx]
    }

    pub fn set_fragment_logical_address(&mut self, raw: u32, value: u64) {
        let idx = self.fragments.mask_index(raw) as usize;
        self.fragment_ext.logical_address.as_mut().expect("negotiated at queue creation")[idx] =
            value;
    }

    pub fn has_fragment_logical_address(&self) -> bool {
        self.fragment_ext.logical_address.is_some()
    }

    pub fn fragment_mdl(&self, raw: u32) -> u64 {
        let idx = self.fragments.mask_index(raw) as usize;
        self.fragment_ext.mdl.as_ref().expect("negotiated at queue creation")[idx]
    }

    pub fn set_fragment_mdl(&mut self, raw: u32, value: u64) {
        let idx = self.fragments.mask_index(raw) as usize;
        self.fragment_ext.mdl.as_mut().expect("negotiated at queue creation")[idx] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use net_defs::EXTENSION_LSO;
    use net_defs::EXTENSION_VIRTUAL_ADDRESS;

    #[test]
    fn rejects_non_power_of_two() {
        assert!(matches!(
            Ring::<PacketDescriptor>::new(12),
            Err(RingError::NotPowerOfTwo(12))
        ));
        assert!(matches!(
            Ring::<PacketDescriptor>::new(1),
            Err(RingError::InvalidCapacity(1))
        ));
    }

    #[test]
    fn mask_matches_modulo() {
        let ring = Ring::<PacketDescriptor>::new(8).unwrap();
        for k in 0..1000u32 {
            assert_eq!(ring.mask_index(k), k % 8);
        }
    }

    #[test]
    fn cursors_never_imply_overcapacity() {
        let mut ring = Ring::<PacketDescriptor>::new(8).unwrap();
        // Run the cursors several times around the ring.
        for _ in 0..10 {
            ring.post(8);
            assert_eq!(ring.free_slots(), 0);
            assert!(ring.hardware_owned() <= ring.capacity());
            ring.complete(5);
            ring.consume(5);
            ring.complete(3);
            ring.consume(3);
            assert_eq!(ring.free_slots(), 8);
        }
    }

    #[test]
    #[should_panic(expected = "ring overpost")]
    fn overpost_panics() {
        let mut ring = Ring::<PacketDescriptor>::new(4).unwrap();
        ring.post(5);
    }

    #[test]
    fn extension_query_is_closed() {
        let pair = RingPair::new(&RingPairConfig {
            packet_capacity: 8,
            fragment_capacity: 16,
            packet_extensions: vec![EXTENSION_LSO],
            fragment_extensions: vec![EXTENSION_VIRTUAL_ADDRESS],
        })
        .unwrap();
        assert_eq!(
            pair.query_packet_extension(EXTENSION_LSO).unwrap(),
            PacketExtension::Lso
        );
        assert!(pair.query_packet_extension(net_defs::EXTENSION_RSC).is_err());
        assert_eq!(
            pair.query_fragment_extension(EXTENSION_VIRTUAL_ADDRESS).unwrap(),
            FragmentExtension::VirtualAddress
        );
        assert!(pair
            .query_fragment_extension(net_defs::EXTENSION_LOGICAL_ADDRESS)
            .is_err());
    }

    #[test]
    fn extension_values_are_indexed_by_mask() {
        let mut pair = RingPair::new(&RingPairConfig {
            packet_capacity: 4,
            fragment_capacity: 4,
            packet_extensions: vec![],
            fragment_extensions: vec![EXTENSION_VIRTUAL_ADDRESS],
        })
        .unwrap();
        pair.set_fragment_virtual_address(5, 0xabcd);
        assert_eq!(pair.fragment_virtual_address(1), 0xabcd);
    }
}
