//! Software frame classification. Hardware may prefill the layer-3 type on
//! receive; everything else is computed here from the frame bytes.

use net_defs::headers::EthernetHeader;
use net_defs::headers::Ipv4Header;
use net_defs::headers::Ipv6Header;
use net_defs::headers::TcpHeader;
use net_defs::headers::ETHERTYPE_IPV4;
use net_defs::headers::ETHERTYPE_IPV6;
use net_defs::headers::IP_PROTOCOL_TCP;
use net_defs::headers::IP_PROTOCOL_UDP;
use net_defs::headers::UDP_HEADER_LEN;
use net_defs::Layer2Type;
use net_defs::Layer3Type;
use net_defs::Layer4Type;
use net_defs::PacketLayout;
use zerocopy::FromBytes;

/// Parses an Ethernet frame prefix into a packet layout. Unparseable or
/// truncated headers leave the corresponding fields unspecified; callers
/// treat that as "no offload metadata available", not an error.
pub fn parse_frame(frame: &[u8]) -> PacketLayout {
    let mut layout = PacketLayout::new();
    let Ok((eth, after_l2)) = EthernetHeader::read_from_prefix(frame) else {
        return layout;
    };
    layout = layout
        .with_l2_type(Layer2Type::Ethernet)
        .with_l2_header_length(size_of::<EthernetHeader>() as u8);

    let (l3_type, l3_len, l4_protocol, after_l3) = match eth.ethertype.get() {
        ETHERTYPE_IPV4 => {
            let Ok((ip, _)) = Ipv4Header::read_from_prefix(after_l2) else {
                return layout.with_l3_type(Layer3Type::Ipv4);
            };
            let header_len = ip.header_length();
            if header_len < size_of::<Ipv4Header>() || after_l2.len() < header_len {
                return layout.with_l3_type(Layer3Type::Ipv4);
            }
            (
                Layer3Type::Ipv4,
                header_len,
                ip.protocol,
                &after_l2[header_len..],
            )
        }
        ETHERTYPE_IPV6 => {
            let Ok((ip, rest)) = Ipv6Header::read_from_prefix(after_l2) else {
                return layout.with_l3_type(Layer3Type::Ipv6);
            };
            (
                Layer3Type::Ipv6,
                size_of::<Ipv6Header>(),
                ip.next_header,
                rest,
            )
        }
        _ => return layout.with_l3_type(Layer3Type::Other),
    };
    layout = layout
        .with_l3_type(l3_type)
        .with_l3_header_length(l3_len as u16);

    match l4_protocol {
        IP_PROTOCOL_TCP => {
            let Ok((tcp, _)) = TcpHeader::read_from_prefix(after_l3) else {
                return layout.with_l4_type(Layer4Type::Tcp);
            };
            layout
                .with_l4_type(Layer4Type::Tcp)
                .with_l4_header_length(tcp.header_length() as u8)
        }
        IP_PROTOCOL_UDP => layout
            .with_l4_type(Layer4Type::Udp)
            .with_l4_header_length(UDP_HEADER_LEN as u8),
        _ => layout.with_l4_type(Layer4Type::Other),
    }
}

/// Resolves the frame's layer-3 tag for the legacy list: the
/// hardware-reported type wins; otherwise fall back to the Ethernet header.
pub fn resolve_frame_layer3(hardware: Layer3Type, frame: &[u8]) -> Layer3Type {
    if hardware != Layer3Type::Unspecified {
        return hardware;
    }
    match EthernetHeader::read_from_prefix(frame) {
        Ok((eth, _)) => match eth.ethertype.get() {
            ETHERTYPE_IPV4 => Layer3Type::Ipv4,
            ETHERTYPE_IPV6 => Layer3Type::Ipv6,
            _ => Layer3Type::Other,
        },
        Err(_) => Layer3Type::Unspecified,
    }
}
