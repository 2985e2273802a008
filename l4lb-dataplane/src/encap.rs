//! IPIP / 6in4 / IP6IP6 encapsulation towards a real.
//!
//! The outer header is written in front of the original IP packet. The
//! original Ethernet header is overwritten by the grown area and rebuilt:
//! destination is the gateway, source is the MAC the frame arrived for.

use l4lb_common::{Addr, FlowKey, DEFAULT_TTL};
use network_types::{
    eth::EthHdr,
    ip::{IpProto, Ipv4Hdr, Ipv6Hdr},
};

use crate::csum;
use crate::error::EncapError;
use crate::packet::PacketBuf;
use crate::parse::{ETH_P_IP, ETH_P_IPV6};
use crate::state::Settings;

const ETH_ALEN: usize = 6;

pub struct EncapParams<'a> {
    /// The flow as parsed, before normalization.
    pub flow: &'a FlowKey,
    pub real: Addr,
    pub inner_v6: bool,
    /// Length of the inner L3 packet.
    pub pkt_bytes: u16,
    pub tos: u8,
    pub gateway_mac: Option<[u8; 6]>,
    pub settings: &'a Settings,
}

/// Outer IPv4 source: the configured /16 with client address and port mixed
/// into the low half, so that replies from the real spread across the prefix.
pub fn encap_v4_src(prefix: u32, flow: &FlowKey) -> u32 {
    (prefix & 0xffff_0000) | ((flow.src.low_word() ^ u32::from(flow.src_port)) & 0xffff)
}

pub fn encap_v6_src(prefix: &[u32; 3], flow: &FlowKey) -> [u32; 4] {
    [
        prefix[0],
        prefix[1],
        prefix[2],
        (u32::from(flow.src_port) << 16) ^ flow.src.low_word(),
    ]
}

fn inner_proto(inner_v6: bool) -> u8 {
    if inner_v6 {
        IpProto::Ipv6 as u8
    } else {
        IpProto::Ipv4 as u8
    }
}

/// A complete outer IPv4 header, checksum included. `tot_len` covers the
/// inner packet plus this header.
pub fn build_ipv4_header(src: u32, dst: u32, proto: u8, tos: u8, tot_len: u16) -> [u8; Ipv4Hdr::LEN] {
    let mut h = [0u8; Ipv4Hdr::LEN];
    h[0] = 0x45;
    h[1] = tos;
    h[2..4].copy_from_slice(&tot_len.to_be_bytes());
    h[8] = DEFAULT_TTL;
    h[9] = proto;
    h[12..16].copy_from_slice(&src.to_be_bytes());
    h[16..20].copy_from_slice(&dst.to_be_bytes());
    let check = csum::ipv4_checksum(&csum::ipv4_header_words(&h));
    h[10..12].copy_from_slice(&check.to_be_bytes());
    h
}

pub fn build_ipv6_header(
    src: &[u32; 4],
    dst: &[u32; 4],
    next_header: u8,
    traffic_class: u8,
    payload_len: u16,
) -> [u8; Ipv6Hdr::LEN] {
    let mut h = [0u8; Ipv6Hdr::LEN];
    h[0] = 0x60 | (traffic_class >> 4);
    h[1] = traffic_class << 4;
    h[4..6].copy_from_slice(&payload_len.to_be_bytes());
    h[6] = next_header;
    h[7] = DEFAULT_TTL;
    h[8..24].copy_from_slice(&Addr::v6_octets(src));
    h[24..40].copy_from_slice(&Addr::v6_octets(dst));
    h
}

/// Grows `pkt` by one outer IP header and fills in Ethernet and outer IP.
/// On error the frame is left as it was.
pub fn encapsulate(pkt: &mut PacketBuf, params: &EncapParams<'_>) -> Result<(), EncapError> {
    let gateway = params.gateway_mac.ok_or(EncapError::NoGateway)?;
    let settings = params.settings;
    let outer_len = match params.real {
        Addr::V4(_) => Ipv4Hdr::LEN,
        Addr::V6(_) => Ipv6Hdr::LEN,
    };

    let len = pkt.len() + outer_len;
    if len > settings.max_frame_len {
        return Err(EncapError::FrameTooLarge {
            len,
            limit: settings.max_frame_len,
        });
    }
    let tot_len = usize::from(params.pkt_bytes) + outer_len;
    let tot_len = u16::try_from(tot_len).map_err(|_| EncapError::FrameTooLarge {
        len: tot_len,
        limit: usize::from(u16::MAX),
    })?;
    if pkt.len() < EthHdr::LEN {
        return Err(EncapError::Truncated);
    }
    let mut arrived_for = [0u8; ETH_ALEN];
    arrived_for.copy_from_slice(&pkt.data()[..ETH_ALEN]);

    let tos = if settings.copy_inner_tos { params.tos } else { 0 };
    let proto = inner_proto(params.inner_v6);

    pkt.adjust_head(-(outer_len as isize))?;

    // Everything below works on offsets taken after the resize.
    let frame = pkt.data_mut();
    if frame.len() < EthHdr::LEN + outer_len + usize::from(params.pkt_bytes) {
        pkt.adjust_head(outer_len as isize)?;
        return Err(EncapError::Truncated);
    }
    let (eth, rest) = frame.split_at_mut(EthHdr::LEN);
    eth[..ETH_ALEN].copy_from_slice(&gateway);
    eth[ETH_ALEN..2 * ETH_ALEN].copy_from_slice(&arrived_for);

    match params.real {
        Addr::V4(dst) => {
            eth[12..14].copy_from_slice(&ETH_P_IP.to_be_bytes());
            let src = encap_v4_src(settings.encap_v4_prefix, params.flow);
            rest[..Ipv4Hdr::LEN].copy_from_slice(&build_ipv4_header(src, dst, proto, tos, tot_len));
        }
        Addr::V6(dst) => {
            eth[12..14].copy_from_slice(&ETH_P_IPV6.to_be_bytes());
            let src = encap_v6_src(&settings.encap_v6_prefix, params.flow);
            rest[..Ipv6Hdr::LEN].copy_from_slice(&build_ipv6_header(
                &src,
                &dst,
                proto,
                tos,
                params.pkt_bytes,
            ));
        }
    }
    Ok(())
}
