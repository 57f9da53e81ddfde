//! Shared datapath definitions for the adapter translation layer: ring
//! descriptor formats, per-packet offload metadata, frame classification, and
//! the capability structures negotiated at queue creation.

pub mod headers;

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Identifies one datapath queue within an adapter.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub u16);

/// Layer 2 classification of a packet.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Layer2Type {
    #[default]
    Unspecified = 0,
    Null = 1,
    Ethernet = 2,
}

impl Layer2Type {
    const fn from_bits(value: u8) -> Self {
        match value {
            1 => Self::Null,
            2 => Self::Ethernet,
            _ => Self::Unspecified,
        }
    }

    const fn into_bits(self) -> u8 {
        self as u8
    }
}

/// Layer 3 classification of a packet.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Layer3Type {
    #[default]
    Unspecified = 0,
    Ipv4 = 1,
    Ipv6 = 2,
    Other = 3,
}

impl Layer3Type {
    const fn from_bits(value: u8) -> Self {
        match value {
            1 => Self::Ipv4,
            2 => Self::Ipv6,
            3 => Self::Other,
            _ => Self::Unspecified,
        }
    }

    const fn into_bits(self) -> u8 {
        self as u8
    }
}

/// Layer 4 classification of a packet.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Layer4Type {
    #[default]
    Unspecified = 0,
    Tcp = 1,
    Udp = 2,
    Other = 3,
}

impl Layer4Type {
    const fn from_bits(value: u8) -> Self {
        match value {
            1 => Self::Tcp,
            2 => Self::Udp,
            3 => Self::Other,
            _ => Self::Unspecified,
        }
    }

    const fn into_bits(self) -> u8 {
        self as u8
    }
}

/// Packed layout classification carried in each packet descriptor. Header
/// lengths are filled in by software parsing; hardware may prefill the type
/// fields on receive.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct PacketLayout {
    #[bits(2, default = Layer2Type::Unspecified)]
    pub l2_type: Layer2Type,
    #[bits(2, default = Layer3Type::Unspecified)]
    pub l3_type: Layer3Type,
    #[bits(2, default = Layer4Type::Unspecified)]
    pub l4_type: Layer4Type,
    #[bits(7)]
    pub l2_header_length: u8,
    #[bits(9)]
    pub l3_header_length: u16,
    #[bits(8)]
    pub l4_header_length: u8,
    #[bits(2)]
    reserved: u8,
}

#[bitfield(u16)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct PacketFlags {
    /// The packet is not to be delivered; it occupies ring slots only so that
    /// index arithmetic stays dense.
    pub ignore: bool,
    #[bits(15)]
    reserved: u16,
}

/// One slot of the packet ring.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct PacketDescriptor {
    /// Index of the packet's first fragment in the fragment ring.
    pub fragment_index: u32,
    /// Number of consecutive fragments belonging to this packet.
    pub fragment_count: u16,
    pub flags: PacketFlags,
    pub layout: PacketLayout,
}

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct FragmentControl {
    /// Set on the final fragment of a packet.
    pub last: bool,
    #[bits(31)]
    reserved: u32,
}

/// One slot of the fragment ring. Buffer addresses live in the
/// virtual-address/logical-address extensions, indexed identically.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct FragmentDescriptor {
    /// Offset of the first valid byte within the buffer.
    pub offset: u32,
    /// Number of valid data bytes starting at `offset`.
    pub valid_length: u32,
    /// Total usable bytes in the buffer.
    pub capacity: u32,
    pub control: FragmentControl,
}

/// Receive-side checksum verdict for one protocol layer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ChecksumEvaluation {
    #[default]
    NotChecked = 0,
    Valid = 1,
    Invalid = 2,
}

impl ChecksumEvaluation {
    const fn from_bits(value: u8) -> Self {
        match value {
            1 => Self::Valid,
            2 => Self::Invalid,
            _ => Self::NotChecked,
        }
    }

    const fn into_bits(self) -> u8 {
        self as u8
    }

    /// True when the layer was checked and passed.
    pub fn is_valid(self) -> bool {
        self == Self::Valid
    }
}

/// Per-packet receive checksum extension value.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct RxChecksumInfo {
    #[bits(2, default = ChecksumEvaluation::NotChecked)]
    pub layer3: ChecksumEvaluation,
    #[bits(2, default = ChecksumEvaluation::NotChecked)]
    pub layer4: ChecksumEvaluation,
    #[bits(28)]
    reserved: u32,
}

/// Per-packet transmit checksum offload request.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct TxChecksumInfo {
    pub offload_ip_header: bool,
    pub offload_tcp: bool,
    pub offload_udp: bool,
    #[bits(29)]
    reserved: u32,
}

/// Per-packet large-send-offload extension value. An `mss` of zero means no
/// segmentation was requested.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct LsoInfo {
    #[bits(20)]
    pub mss: u32,
    #[bits(12)]
    reserved: u16,
}

/// Per-packet receive-segment-coalescing extension value.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct RscInfo {
    #[bits(10)]
    pub coalesced_segment_count: u16,
    #[bits(6)]
    pub duplicate_ack_count: u8,
    #[bits(16)]
    reserved: u16,
}

/// Whether fragment buffers must carry a device-visible logical address.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MappingRequirement {
    /// Buffers are plain host memory.
    #[default]
    None,
    /// Buffers must be reachable by the device; fragment logical addresses
    /// are produced by the DMA mapping seam.
    DmaMapped,
}

/// Who allocates and who returns receive buffers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RxBufferAllocationMode {
    /// The translation layer allocates buffers and attaches them to ring
    /// slots; completed buffers come back through the NBL return path.
    #[default]
    OsAllocatesAndAttaches,
    /// The translation layer allocates the backing pool but the driver picks
    /// buffers itself.
    OsAllocatesOnly,
    /// The driver owns the buffers; completed buffers are handed back via
    /// `return_rx_buffer` with the driver's per-buffer return context.
    DriverOwned,
}

/// Transmit-side datapath capabilities advertised by the adapter driver.
#[derive(Clone, Debug)]
pub struct TxCapabilities {
    /// Packet ring capacity; must be a power of two.
    pub ring_capacity: u32,
    /// Fragment ring capacity; must be a power of two.
    pub fragment_ring_capacity: u32,
    /// Hard per-packet fragment budget.
    pub maximum_fragment_count: u16,
    /// Largest single fragment the device accepts.
    pub maximum_fragment_size: u32,
    /// Required fragment start alignment, a power of two.
    pub fragment_alignment: u32,
    /// Highest physical address the device can reach. Ignored unless
    /// `mapping` is [`MappingRequirement::DmaMapped`].
    pub maximum_physical_address: u64,
    pub mapping: MappingRequirement,
    /// Bytes the device needs reserved ahead of the payload.
    pub backfill: u32,
}

/// Receive-side datapath capabilities advertised by the adapter driver.
#[derive(Clone, Debug)]
pub struct RxCapabilities {
    /// Packet ring capacity; must be a power of two.
    pub ring_capacity: u32,
    /// Fragment ring capacity; must be a power of two.
    pub fragment_ring_capacity: u32,
    pub allocation_mode: RxBufferAllocationMode,
    /// Largest frame the adapter will place in one buffer.
    pub maximum_frame_size: u32,
    /// Required buffer alignment, a power of two.
    pub alignment: u32,
    /// Offset of the first usable byte within each aligned buffer.
    pub alignment_offset: u32,
    /// Highest physical address the device can reach. Ignored unless
    /// `mapping` is [`MappingRequirement::DmaMapped`].
    pub maximum_physical_address: u64,
    pub mapping: MappingRequirement,
}

/// Capabilities negotiated once per adapter and consulted at queue creation.
#[derive(Clone, Debug)]
pub struct DatapathCapabilities {
    pub tx: TxCapabilities,
    pub rx: RxCapabilities,
}

/// Identity of a ring extension, queried by name and version at queue
/// creation and cached as an accessor for the queue's lifetime.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExtensionId {
    pub name: &'static str,
    pub version: u32,
}

pub const EXTENSION_CHECKSUM: ExtensionId = ExtensionId {
    name: "ms_checksum",
    version: 1,
};
pub const EXTENSION_LSO: ExtensionId = ExtensionId {
    name: "ms_lso",
    version: 1,
};
pub const EXTENSION_RSC: ExtensionId = ExtensionId {
    name: "ms_rsc",
    version: 1,
};
pub const EXTENSION_VIRTUAL_ADDRESS: ExtensionId = ExtensionId {
    name: "ms_fragment_virtual_address",
    version: 1,
};
pub const EXTENSION_LOGICAL_ADDRESS: ExtensionId = ExtensionId {
    name: "ms_fragment_logical_address",
    version: 1,
};
pub const EXTENSION_MDL: ExtensionId = ExtensionId {
    name: "ms_fragment_mdl",
    version: 1,
};
