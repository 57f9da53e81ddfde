//! Wire-format header definitions used for software frame classification.

use zerocopy::byteorder::network_endian::U16;
use zerocopy::byteorder::network_endian::U32;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

pub const IP_PROTOCOL_TCP: u8 = 6;
pub const IP_PROTOCOL_UDP: u8 = 17;

pub const ETHERNET_HEADER_LEN: usize = 14;

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EthernetHeader {
    pub destination: [u8; 6],
    pub source: [u8; 6],
    pub ethertype: U16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Ipv4Header {
    pub version_ihl: u8,
    pub dscp_ecn: u8,
    pub total_length: U16,
    pub identification: U16,
    pub flags_fragment: U16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: U16,
    pub source: [u8; 4],
    pub destination: [u8; 4],
}

impl Ipv4Header {
    /// Header length in bytes, from the IHL field.
    pub fn header_length(&self) -> usize {
        usize::from(self.version_ihl & 0xf) * 4
    }

    pub fn version(&self) -> u8 {
        self.version_ihl >> 4
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Ipv6Header {
    pub version_class_flow: U32,
    pub payload_length: U16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub source: [u8; 16],
    pub destination: [u8; 16],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TcpHeader {
    pub source_port: U16,
    pub destination_port: U16,
    pub sequence: U32,
    pub acknowledgment: U32,
    pub data_offset_flags: U16,
    pub window: U16,
    pub checksum: U16,
    pub urgent_pointer: U16,
}

impl TcpHeader {
    /// Header length in bytes, from the data-offset field.
    pub fn header_length(&self) -> usize {
        usize::from(self.data_offset_flags.get() >> 12) * 4
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct UdpHeader {
    pub source_port: U16,
    pub destination_port: U16,
    pub length: U16,
    pub checksum: U16,
}

pub const UDP_HEADER_LEN: usize = 8;

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromBytes;

    #[test]
    fn header_sizes() {
        assert_eq!(size_of::<EthernetHeader>(), ETHERNET_HEADER_LEN);
        assert_eq!(size_of::<Ipv4Header>(), 20);
        assert_eq!(size_of::<Ipv6Header>(), 40);
        assert_eq!(size_of::<TcpHeader>(), 20);
        assert_eq!(size_of::<UdpHeader>(), UDP_HEADER_LEN);
    }

    #[test]
    fn parse_ethernet_ipv4() {
        let mut frame = [0u8; 34];
        frame[12] = 0x08; // ethertype IPv4
        frame[14] = 0x45; // version 4, ihl 5
        frame[23] = IP_PROTOCOL_TCP;
        let (eth, rest) = EthernetHeader::read_from_prefix(&frame[..]).unwrap();
        assert_eq!(eth.ethertype.get(), ETHERTYPE_IPV4);
        let (ip, _) = Ipv4Header::read_from_prefix(rest).unwrap();
        assert_eq!(ip.version(), 4);
        assert_eq!(ip.header_length(), 20);
        assert_eq!(ip.protocol, IP_PROTOCOL_TCP);
    }
}
