//! Ethernet / IPv4 / IPv6 / ICMP / TCP / UDP decoding into a [`FlowKey`].

use l4lb_common::{Addr, FlowKey};
use network_types::{
    eth::EthHdr,
    ip::{IpProto, Ipv4Hdr, Ipv6Hdr},
    tcp::TcpHdr,
    udp::UdpHdr,
};

pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86DD;

pub const ICMP_HDR_LEN: usize = 8;
pub const ICMP_ECHOREPLY: u8 = 0;
pub const ICMP_DEST_UNREACH: u8 = 3;
pub const ICMP_ECHO: u8 = 8;
pub const ICMP_FRAG_NEEDED: u8 = 4;
pub const ICMPV6_DEST_UNREACH: u8 = 1;
pub const ICMPV6_PKT_TOOBIG: u8 = 2;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

const IP_MF: u16 = 0x2000;
const IP_OFFSET: u16 = 0x1fff;
const TCP_FLAGS_OFFSET: usize = 13;
const TCP_SYN: u8 = 0x02;
/// Bytes of the UDP payload kept for QUIC header inspection.
pub const QUIC_HEAD_LEN: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags {
    pub syn: bool,
    /// The flow was recovered from the payload of an ICMP error.
    pub icmp: bool,
    pub too_big: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub flow: FlowKey,
    pub flags: PacketFlags,
    pub is_v6: bool,
    /// Length of the L3 packet as its header states it.
    pub pkt_bytes: u16,
    /// IPv4 TOS or IPv6 traffic class of the outer header.
    pub tos: u8,
    pub quic_head: Option<[u8; QUIC_HEAD_LEN]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parsed {
    Flow(Packet),
    EchoRequest { v6: bool },
    Pass,
    Drop,
}

struct Malformed;

fn header_at(frame: &[u8], offset: usize, len: usize) -> Result<&[u8], Malformed> {
    let end = offset.checked_add(len).ok_or(Malformed)?;
    frame.get(offset..end).ok_or(Malformed)
}

fn be16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn be32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn v6_addr(bytes: &[u8]) -> Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&bytes[..16]);
    Addr::from_v6_octets(octets)
}

/// Decodes one Ethernet frame. Anything that is not IPv4/IPv6 passes.
pub fn parse(frame: &[u8]) -> Parsed {
    let Ok(eth) = header_at(frame, 0, EthHdr::LEN) else {
        return Parsed::Drop;
    };
    let result = match be16(&eth[12..14]) {
        ETH_P_IP => parse_v4(frame, EthHdr::LEN),
        ETH_P_IPV6 => parse_v6(frame, EthHdr::LEN),
        _ => return Parsed::Pass,
    };
    result.unwrap_or(Parsed::Drop)
}

fn parse_v4(frame: &[u8], off: usize) -> Result<Parsed, Malformed> {
    let ip = header_at(frame, off, Ipv4Hdr::LEN)?;
    // No IP options.
    if ip[0] != 0x45 {
        return Err(Malformed);
    }
    if be16(&ip[6..8]) & (IP_MF | IP_OFFSET) != 0 {
        return Err(Malformed);
    }
    let pkt_bytes = be16(&ip[2..4]);
    if usize::from(pkt_bytes) < Ipv4Hdr::LEN || usize::from(pkt_bytes) > frame.len() - off {
        return Err(Malformed);
    }
    let tos = ip[1];
    let mut proto = ip[9];
    let mut src = Addr::V4(be32(&ip[12..16]));
    let mut dst = Addr::V4(be32(&ip[16..20]));
    let mut flags = PacketFlags::default();
    let mut off = off + Ipv4Hdr::LEN;

    if proto == IpProto::Icmp as u8 {
        let icmp = header_at(frame, off, ICMP_HDR_LEN)?;
        match icmp[0] {
            ICMP_ECHO => return Ok(Parsed::EchoRequest { v6: false }),
            ICMP_DEST_UNREACH => {}
            _ => return Ok(Parsed::Pass),
        }
        flags.icmp = true;
        flags.too_big = icmp[1] == ICMP_FRAG_NEEDED;
        off += ICMP_HDR_LEN;

        // The quoted packet travelled server -> client; flip it back.
        let inner = header_at(frame, off, Ipv4Hdr::LEN)?;
        if inner[0] != 0x45 {
            return Err(Malformed);
        }
        proto = inner[9];
        src = Addr::V4(be32(&inner[16..20]));
        dst = Addr::V4(be32(&inner[12..16]));
        off += Ipv4Hdr::LEN;
    }

    transport(frame, off, proto, src, dst, flags).map(|found| {
        found.map_or(Parsed::Pass, |(flow, flags, quic_head)| {
            Parsed::Flow(Packet {
                flow,
                flags,
                is_v6: false,
                pkt_bytes,
                tos,
                quic_head,
            })
        })
    })
}

fn parse_v6(frame: &[u8], off: usize) -> Result<Parsed, Malformed> {
    let ip = header_at(frame, off, Ipv6Hdr::LEN)?;
    if ip[0] >> 4 != 6 {
        return Err(Malformed);
    }
    let tos = (ip[0] << 4) | (ip[1] >> 4);
    let payload_len = usize::from(be16(&ip[4..6]));
    if payload_len > frame.len() - off - Ipv6Hdr::LEN {
        return Err(Malformed);
    }
    let pkt_bytes = u16::try_from(payload_len + Ipv6Hdr::LEN).map_err(|_| Malformed)?;
    let mut proto = ip[6];
    let mut src = v6_addr(&ip[8..24]);
    let mut dst = v6_addr(&ip[24..40]);
    let mut flags = PacketFlags::default();
    let mut off = off + Ipv6Hdr::LEN;

    if proto == IpProto::Ipv6Frag as u8 {
        return Err(Malformed);
    }
    if proto == IpProto::Ipv6Icmp as u8 {
        let icmp = header_at(frame, off, ICMP_HDR_LEN)?;
        match icmp[0] {
            ICMPV6_ECHO_REQUEST => return Ok(Parsed::EchoRequest { v6: true }),
            ICMPV6_PKT_TOOBIG => flags.too_big = true,
            ICMPV6_DEST_UNREACH => {}
            _ => return Ok(Parsed::Pass),
        }
        flags.icmp = true;
        off += ICMP_HDR_LEN;

        let inner = header_at(frame, off, Ipv6Hdr::LEN)?;
        proto = inner[6];
        src = v6_addr(&inner[24..40]);
        dst = v6_addr(&inner[8..24]);
        off += Ipv6Hdr::LEN;
    }

    transport(frame, off, proto, src, dst, flags).map(|found| {
        found.map_or(Parsed::Pass, |(flow, flags, quic_head)| {
            Parsed::Flow(Packet {
                flow,
                flags,
                is_v6: true,
                pkt_bytes,
                tos,
                quic_head,
            })
        })
    })
}

type Transport = (FlowKey, PacketFlags, Option<[u8; QUIC_HEAD_LEN]>);

/// Reads the ports at `off`. `Ok(None)` means a protocol we do not balance.
fn transport(
    frame: &[u8],
    off: usize,
    proto: u8,
    src: Addr,
    dst: Addr,
    mut flags: PacketFlags,
) -> Result<Option<Transport>, Malformed> {
    let mut quic_head = None;
    // An ICMP error quotes at least the 8 leading bytes: the ports are there.
    let ports = if proto == IpProto::Tcp as u8 {
        if flags.icmp {
            header_at(frame, off, 4)?
        } else {
            let tcp = header_at(frame, off, TcpHdr::LEN)?;
            flags.syn = tcp[TCP_FLAGS_OFFSET] & TCP_SYN != 0;
            tcp
        }
    } else if proto == IpProto::Udp as u8 {
        if flags.icmp {
            header_at(frame, off, 4)?
        } else {
            let udp = header_at(frame, off, UdpHdr::LEN)?;
            if let Ok(head) = header_at(frame, off + UdpHdr::LEN, QUIC_HEAD_LEN) {
                let mut copy = [0u8; QUIC_HEAD_LEN];
                copy.copy_from_slice(head);
                quic_head = Some(copy);
            }
            udp
        }
    } else {
        return Ok(None);
    };

    let (mut src_port, mut dst_port) = (be16(&ports[0..2]), be16(&ports[2..4]));
    if flags.icmp {
        core::mem::swap(&mut src_port, &mut dst_port);
    }
    let flow = FlowKey {
        src,
        dst,
        src_port,
        dst_port,
        proto,
    };
    Ok(Some((flow, flags, quic_head)))
}
