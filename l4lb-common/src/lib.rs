#![cfg_attr(not(test), no_std)]

use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use core::ops::BitOr;

/// Number of buckets in a VIP's consistent hashing ring unless the snapshot
/// says otherwise. Prime, so that `hash % RING_SIZE` spreads evenly.
pub const DEFAULT_RING_SIZE: u32 = 65537;
pub const MAX_VIPS: u32 = 512;
pub const MAX_REALS: u32 = 4096;
pub const DEFAULT_TTL: u8 = 64;

pub const INIT_JHASH_SEED: u32 = MAX_VIPS * DEFAULT_RING_SIZE;
pub const INIT_JHASH_SEED_V6: u32 = MAX_VIPS;

pub const ONE_SEC_NS: u64 = 1_000_000_000;
pub const DEFAULT_MAX_CONN_RATE: u64 = 125_000;
pub const DEFAULT_UDP_IDLE_TIMEOUT_NS: u64 = 30 * ONE_SEC_NS;

/// Real id 0 is never handed out; a ring slot holding it is unassigned.
pub const UNASSIGNED_REAL: u32 = 0;

// Address of a flow endpoint, VIP or real. Words are kept in host order,
// most significant word first for IPv6.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Addr {
    V4(u32),
    V6([u32; 4]),
}

impl Addr {
    pub fn is_v6(&self) -> bool {
        matches!(self, Addr::V6(_))
    }

    /// Same family, all bits cleared.
    pub fn zeroed(&self) -> Addr {
        match self {
            Addr::V4(_) => Addr::V4(0),
            Addr::V6(_) => Addr::V6([0; 4]),
        }
    }

    pub fn from_v6_octets(octets: [u8; 16]) -> Addr {
        let mut words = [0u32; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let at = i * 4;
            *word = u32::from_be_bytes([
                octets[at],
                octets[at + 1],
                octets[at + 2],
                octets[at + 3],
            ]);
        }
        Addr::V6(words)
    }

    pub fn v6_octets(words: &[u32; 4]) -> [u8; 16] {
        let mut octets = [0u8; 16];
        for (i, word) in words.iter().enumerate() {
            octets[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        octets
    }

    /// Least significant 32 bits of the address.
    pub fn low_word(&self) -> u32 {
        match *self {
            Addr::V4(a) => a,
            Addr::V6(w) => w[3],
        }
    }

    fn encode_into(&self, out: &mut [u8]) {
        match *self {
            Addr::V4(a) => {
                out[0] = 4;
                out[1..5].copy_from_slice(&a.to_be_bytes());
            }
            Addr::V6(w) => {
                out[0] = 6;
                out[1..17].copy_from_slice(&Addr::v6_octets(&w));
            }
        }
    }
}

impl From<Ipv4Addr> for Addr {
    fn from(addr: Ipv4Addr) -> Self {
        Addr::V4(u32::from(addr))
    }
}

impl From<Ipv6Addr> for Addr {
    fn from(addr: Ipv6Addr) -> Self {
        Addr::from_v6_octets(addr.octets())
    }
}

impl From<IpAddr> for Addr {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(a) => a.into(),
            IpAddr::V6(a) => a.into(),
        }
    }
}

impl From<Addr> for IpAddr {
    fn from(addr: Addr) -> Self {
        match addr {
            Addr::V4(a) => IpAddr::V4(Ipv4Addr::from(a)),
            Addr::V6(w) => IpAddr::V6(Ipv6Addr::from(Addr::v6_octets(&w))),
        }
    }
}

// This is a 5tuple which identifies a flow, IPv4 or IPv6.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: Addr,
    pub dst: Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
}

impl FlowKey {
    pub const ENCODED_LEN: usize = 2 * 17 + 2 + 2 + 1;

    /// Both ports packed into one word, source port in the high half.
    pub fn ports(&self) -> u32 {
        (u32::from(self.src_port) << 16) | u32::from(self.dst_port)
    }

    /// Fixed-size byte form of the key, independent of in-memory layout.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        self.src.encode_into(&mut out[0..17]);
        self.dst.encode_into(&mut out[17..34]);
        out[34..36].copy_from_slice(&self.src_port.to_be_bytes());
        out[36..38].copy_from_slice(&self.dst_port.to_be_bytes());
        out[38] = self.proto;
        out
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct VipKey {
    pub addr: Addr,
    pub port: u16,
    pub proto: u8,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct VipFlags(u32);

impl VipFlags {
    pub const NONE: VipFlags = VipFlags(0);
    /// Hash on the destination port only: every client of a port lands on one real.
    pub const HASH_DPORT_ONLY: VipFlags = VipFlags(1 << 0);
    pub const HASH_NO_SRC_PORT: VipFlags = VipFlags(1 << 1);
    pub const SRC_ROUTING: VipFlags = VipFlags(1 << 2);
    pub const LRU_BYPASS: VipFlags = VipFlags(1 << 3);
    pub const QUIC_VIP: VipFlags = VipFlags(1 << 4);
    pub const LOCAL_VIP: VipFlags = VipFlags(1 << 5);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> VipFlags {
        VipFlags(bits)
    }

    pub const fn contains(self, other: VipFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: VipFlags) {
        self.0 |= other.0;
    }
}

impl BitOr for VipFlags {
    type Output = VipFlags;

    fn bitor(self, rhs: VipFlags) -> VipFlags {
        VipFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VipMeta {
    pub flags: VipFlags,
    pub vip_num: u32,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct RealFlags(u8);

impl RealFlags {
    pub const NONE: RealFlags = RealFlags(0);
    pub const IPV6: RealFlags = RealFlags(1 << 0);
    /// The real is this host; traffic goes to the local stack.
    pub const LOCAL_REAL: RealFlags = RealFlags(1 << 1);

    pub const fn contains(self, other: RealFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: RealFlags) {
        self.0 |= other.0;
    }
}

impl BitOr for RealFlags {
    type Output = RealFlags;

    fn bitor(self, rhs: RealFlags) -> RealFlags {
        RealFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RealDefinition {
    pub addr: Addr,
    pub flags: RealFlags,
}

impl RealDefinition {
    /// The `IPV6` flag always follows the address family.
    pub fn new(addr: Addr, local: bool) -> Self {
        let mut flags = RealFlags::NONE;
        if addr.is_v6() {
            flags.insert(RealFlags::IPV6);
        }
        if local {
            flags.insert(RealFlags::LOCAL_REAL);
        }
        RealDefinition { addr, flags }
    }
}

// Tagged form of the control array cell.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControlValue {
    Mac([u8; 6]),
    Ifindex(u32),
    Value(u64),
}

pub const CTL_GATEWAY_MAC: usize = 0;

/// A counter slot. Which half means what depends on the counter.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct StatsPair {
    pub v1: u64,
    pub v2: u64,
}

impl StatsPair {
    pub const fn zeroed() -> Self {
        StatsPair { v1: 0, v2: 0 }
    }
}

/// Global counters, indexed into the stats block after the per-VIP slots.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(usize)]
pub enum GlobalCounter {
    /// v1: load-balanced packets, v2: affinity misses
    Lru = 0,
    /// v1: TCP SYN misses, v2: TCP non-SYN misses
    LruMiss,
    /// v1: packets seen under flood, v2: affinity writes skipped
    NewConnRate,
    /// v1: packets served by the fallback LRU, v2: fallback shard busy
    FallbackLru,
    /// v1: source routing hits, v2: misses
    LpmSrc,
    /// v1: IPv4 too-big, v2: IPv6 too-big
    IcmpTooBig,
    /// v1: IPv4 echo replies, v2: IPv6 echo replies
    IcmpEcho,
    RingUnassigned,
    RealNotFound,
    /// v1: malformed, v2: encapsulation failed
    Drop,
    /// v1: routed by connection id, v2: connection id unusable
    QuicRouting,
}

impl GlobalCounter {
    pub const COUNT: usize = 11;

    pub const ALL: [GlobalCounter; GlobalCounter::COUNT] = [
        GlobalCounter::Lru,
        GlobalCounter::LruMiss,
        GlobalCounter::NewConnRate,
        GlobalCounter::FallbackLru,
        GlobalCounter::LpmSrc,
        GlobalCounter::IcmpTooBig,
        GlobalCounter::IcmpEcho,
        GlobalCounter::RingUnassigned,
        GlobalCounter::RealNotFound,
        GlobalCounter::Drop,
        GlobalCounter::QuicRouting,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            GlobalCounter::Lru => "lru",
            GlobalCounter::LruMiss => "lru_miss",
            GlobalCounter::NewConnRate => "new_conn_rate",
            GlobalCounter::FallbackLru => "fallback_lru",
            GlobalCounter::LpmSrc => "lpm_src",
            GlobalCounter::IcmpTooBig => "icmp_toobig",
            GlobalCounter::IcmpEcho => "icmp_echo",
            GlobalCounter::RingUnassigned => "ring_unassigned",
            GlobalCounter::RealNotFound => "real_not_found",
            GlobalCounter::Drop => "drop",
            GlobalCounter::QuicRouting => "quic_routing",
        }
    }
}
