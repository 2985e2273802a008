#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use l4lb_common::{Addr, RealDefinition, VipFlags, VipKey, VipMeta};
use l4lb_dataplane::{Lane, LoadBalancerState, PacketBuf, Settings, SharedDataplane, StateBuilder};

pub const GATEWAY: [u8; 6] = [0x02, 0, 0, 0, 0, 0xfe];
pub const LB_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
pub const CLIENT_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x02];

pub const TCP: u8 = 6;
pub const UDP: u8 = 17;
pub const SYN: u8 = 0x02;
pub const ACK: u8 = 0x10;

pub fn v4(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

pub fn v6(s: &str) -> Ipv6Addr {
    s.parse().unwrap()
}

pub fn addr(s: &str) -> Addr {
    Addr::from(s.parse::<IpAddr>().unwrap())
}

fn ethernet(ether_type: u16) -> Vec<u8> {
    let mut f = Vec::with_capacity(128);
    f.extend_from_slice(&LB_MAC);
    f.extend_from_slice(&CLIENT_MAC);
    f.extend_from_slice(&ether_type.to_be_bytes());
    f
}

fn ipv4_header(proto: u8, src: Ipv4Addr, dst: Ipv4Addr, payload_len: usize) -> Vec<u8> {
    let mut ip = vec![0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&((20 + payload_len) as u16).to_be_bytes());
    ip[8] = 64;
    ip[9] = proto;
    ip[12..16].copy_from_slice(&src.octets());
    ip[16..20].copy_from_slice(&dst.octets());
    ip
}

fn ipv6_header(next: u8, src: Ipv6Addr, dst: Ipv6Addr, payload_len: usize) -> Vec<u8> {
    let mut ip = vec![0u8; 40];
    ip[0] = 0x60;
    ip[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
    ip[6] = next;
    ip[7] = 64;
    ip[8..24].copy_from_slice(&src.octets());
    ip[24..40].copy_from_slice(&dst.octets());
    ip
}

fn tcp_header(sport: u16, dport: u16, flags: u8) -> Vec<u8> {
    let mut t = vec![0u8; 20];
    t[0..2].copy_from_slice(&sport.to_be_bytes());
    t[2..4].copy_from_slice(&dport.to_be_bytes());
    t[12] = 5 << 4;
    t[13] = flags;
    t
}

fn udp_header(sport: u16, dport: u16, payload_len: usize) -> Vec<u8> {
    let mut u = vec![0u8; 8];
    u[0..2].copy_from_slice(&sport.to_be_bytes());
    u[2..4].copy_from_slice(&dport.to_be_bytes());
    u[4..6].copy_from_slice(&((8 + payload_len) as u16).to_be_bytes());
    u
}

pub fn tcp4(src: &str, sport: u16, dst: &str, dport: u16, flags: u8) -> Vec<u8> {
    let mut f = ethernet(0x0800);
    f.extend(ipv4_header(TCP, v4(src), v4(dst), 20));
    f.extend(tcp_header(sport, dport, flags));
    f
}

pub fn udp4(src: &str, sport: u16, dst: &str, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut f = ethernet(0x0800);
    f.extend(ipv4_header(UDP, v4(src), v4(dst), 8 + payload.len()));
    f.extend(udp_header(sport, dport, payload.len()));
    f.extend_from_slice(payload);
    f
}

pub fn tcp6(src: &str, sport: u16, dst: &str, dport: u16, flags: u8) -> Vec<u8> {
    let mut f = ethernet(0x86dd);
    f.extend(ipv6_header(TCP, v6(src), v6(dst), 20));
    f.extend(tcp_header(sport, dport, flags));
    f
}

/// Echo request with a valid ICMP checksum.
pub fn echo4(src: &str, dst: &str) -> Vec<u8> {
    let mut icmp = vec![8u8, 0, 0, 0, 0x12, 0x34, 0, 1, b'h', b'i'];
    let check = internet_checksum(&icmp);
    icmp[2..4].copy_from_slice(&check.to_be_bytes());
    let mut f = ethernet(0x0800);
    f.extend(ipv4_header(1, v4(src), v4(dst), icmp.len()));
    f.extend(icmp);
    f
}

/// Fragmentation needed from `router`, quoting the server -> client segment
/// `server:sport -> client:cport`.
pub fn frag_needed4(router: &str, server: &str, sport: u16, client: &str, cport: u16) -> Vec<u8> {
    let mut f = ethernet(0x0800);
    f.extend(ipv4_header(1, v4(router), v4(server), 8 + 20 + 8));
    f.extend([3u8, 4, 0, 0, 0, 0, 0x05, 0xdc]);
    f.extend(ipv4_header(TCP, v4(server), v4(client), 20));
    f.extend(&tcp_header(sport, cport, ACK)[..8]);
    f
}

/// Packet too big from `router`, quoting `server:sport -> client:cport`.
pub fn packet_too_big6(router: &str, server: &str, sport: u16, client: &str, cport: u16) -> Vec<u8> {
    let mut f = ethernet(0x86dd);
    f.extend(ipv6_header(58, v6(router), v6(server), 8 + 40 + 8));
    f.extend([2u8, 0, 0, 0, 0, 0, 0x05, 0x00]);
    f.extend(ipv6_header(TCP, v6(server), v6(client), 20));
    f.extend(&tcp_header(sport, cport, ACK)[..8]);
    f
}

/// ICMPv6 echo request with a valid checksum.
pub fn echo6(src: &str, dst: &str) -> Vec<u8> {
    let mut icmp = vec![128u8, 0, 0, 0, 0x12, 0x34, 0, 1, b'h', b'i'];
    let check = icmp6_checksum(&v6(src).octets(), &v6(dst).octets(), &icmp);
    icmp[2..4].copy_from_slice(&check.to_be_bytes());
    let mut f = ethernet(0x86dd);
    f.extend(ipv6_header(58, v6(src), v6(dst), icmp.len()));
    f.extend(icmp);
    f
}

/// Checksum over the ICMPv6 pseudo-header and `body`.
pub fn icmp6_checksum(src: &[u8], dst: &[u8], body: &[u8]) -> u16 {
    let mut pseudo = Vec::with_capacity(40 + body.len());
    pseudo.extend_from_slice(src);
    pseudo.extend_from_slice(dst);
    pseudo.extend_from_slice(&(body.len() as u32).to_be_bytes());
    pseudo.extend_from_slice(&[0, 0, 0, 58]);
    pseudo.extend_from_slice(body);
    internet_checksum(&pseudo)
}

pub fn internet_checksum(bytes: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in bytes.chunks(2) {
        let hi = u32::from(chunk[0]) << 8;
        let lo = chunk.get(1).copied().map_or(0, u32::from);
        sum += hi | lo;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

pub fn vip(address: &str, port: u16, proto: u8) -> VipKey {
    VipKey {
        addr: addr(address),
        port,
        proto,
    }
}

pub fn meta(vip_num: u32, flags: VipFlags) -> VipMeta {
    VipMeta { flags, vip_num }
}

pub fn real(address: &str) -> RealDefinition {
    RealDefinition::new(addr(address), false)
}

/// Reals 1 (10.1.0.1) and 2 (10.1.0.2) behind a gateway, ring of `ring_size`.
pub fn base(ring_size: u32) -> StateBuilder {
    StateBuilder::new()
        .settings(Settings {
            ring_size,
            ..Settings::default()
        })
        .gateway_mac(GATEWAY)
        .real(1, real("10.1.0.1"))
        .real(2, real("10.1.0.2"))
}

/// VIP 10.0.0.1:80/TCP, ring `[1, 2]`.
pub fn pinned_state() -> LoadBalancerState {
    base(2)
        .vip(vip("10.0.0.1", 80, TCP), meta(0, VipFlags::NONE), vec![1, 2])
        .build()
        .unwrap()
}

pub fn lane(shard_capacity: usize) -> Lane {
    Lane::new(0, shard_capacity, Arc::new(SharedDataplane::new(1024, 4)))
}

pub fn load(frame: &[u8]) -> PacketBuf {
    let mut pkt = PacketBuf::default();
    pkt.load(frame).unwrap();
    pkt
}
