use serde::Deserialize;

use anyhow::{bail, Context};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use l4lb_common::{
    RealDefinition, VipFlags, VipKey, VipMeta, DEFAULT_MAX_CONN_RATE, DEFAULT_RING_SIZE, ONE_SEC_NS,
};
use l4lb_dataplane::packet::DEFAULT_FRAME_CAPACITY;
use l4lb_dataplane::{LoadBalancerState, Settings, StateBuilder};
use network_types::ip::IpProto;
use std::net::{IpAddr, SocketAddr};

#[derive(Debug, PartialEq, Deserialize)]
pub struct RealServer {
    pub id: u32,
    pub addr: IpAddr,
    /// This host is the real; its traffic goes to the local stack.
    #[serde(default)]
    pub local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VipFlag {
    HashDportOnly,
    HashNoSrcPort,
    SrcRouting,
    LruBypass,
    Quic,
    Local,
}

impl VipFlag {
    fn bits(self) -> VipFlags {
        match self {
            VipFlag::HashDportOnly => VipFlags::HASH_DPORT_ONLY,
            VipFlag::HashNoSrcPort => VipFlags::HASH_NO_SRC_PORT,
            VipFlag::SrcRouting => VipFlags::SRC_ROUTING,
            VipFlag::LruBypass => VipFlags::LRU_BYPASS,
            VipFlag::Quic => VipFlags::QUIC_VIP,
            VipFlag::Local => VipFlags::LOCAL_VIP,
        }
    }
}

/// A ring entry: one slot, or `count` consecutive slots for the same real.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RingSegment {
    Slot(u32),
    Run { real: u32, count: usize },
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct Vip {
    pub vip: IpAddr,
    /// 0 catches every port.
    pub port: u16,
    #[serde(deserialize_with = "deserialize_ip_proto")]
    pub proto: u8,
    pub vip_num: u32,
    #[serde(default)]
    pub flags: Vec<VipFlag>,
    pub ring: Vec<RingSegment>,
}

impl Vip {
    pub fn flags(&self) -> VipFlags {
        self.flags
            .iter()
            .fold(VipFlags::NONE, |acc, flag| acc | flag.bits())
    }

    /// Fails as soon as the segments describe more than `ring_size` slots.
    pub fn expand_ring(&self, ring_size: u32) -> anyhow::Result<Vec<u32>> {
        let limit = ring_size as usize;
        let mut ring = Vec::new();
        for segment in &self.ring {
            let (real, count) = match *segment {
                RingSegment::Slot(real) => (real, 1),
                RingSegment::Run { real, count } => (real, count),
            };
            if count > limit - ring.len() {
                bail!(
                    "ring of vip_num {} is longer than ring_size {}",
                    self.vip_num,
                    ring_size
                );
            }
            ring.extend(std::iter::repeat(real).take(count));
        }
        Ok(ring)
    }
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct SrcRoute {
    pub prefix: IpNetwork,
    pub real: u32,
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Tunables {
    pub ring_size: u32,
    pub max_conn_rate: u64,
    pub udp_idle_timeout_secs: u64,
    pub copy_inner_tos: bool,
    /// Must be a /16. Defaults to 172.16.0.0/16.
    pub encap_v4_prefix: Option<Ipv4Network>,
    /// Must be a /96. Defaults to 100::/96.
    pub encap_v6_prefix: Option<Ipv6Network>,
    pub max_frame_len: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            ring_size: DEFAULT_RING_SIZE,
            max_conn_rate: DEFAULT_MAX_CONN_RATE,
            udp_idle_timeout_secs: 30,
            copy_inner_tos: false,
            encap_v4_prefix: None,
            encap_v6_prefix: None,
            max_frame_len: DEFAULT_FRAME_CAPACITY,
        }
    }
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct LruConfig {
    /// Entries in each lane's private shard.
    pub shard_capacity: usize,
    /// Lanes that run without a shard and use the fallback cache.
    pub shardless_lanes: Vec<usize>,
    pub fallback_capacity: usize,
    pub fallback_shards: usize,
}

impl Default for LruConfig {
    fn default() -> Self {
        LruConfig {
            shard_capacity: 100_000,
            shardless_lanes: Vec::new(),
            fallback_capacity: 100_000,
            fallback_shards: 16,
        }
    }
}

/// Frames are exchanged as UDP datagrams, one Ethernet frame each.
#[derive(Debug, PartialEq, Deserialize)]
pub struct Tap {
    /// Lane `i` listens on this port plus `i`.
    pub listen: SocketAddr,
    /// Encapsulated frames and echo replies.
    pub tx: SocketAddr,
    /// Frames for the local stack. Dropped when unset.
    pub pass: Option<SocketAddr>,
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Tunables,
    #[serde(deserialize_with = "deserialize_mac")]
    pub gateway_mac: [u8; 6],
    #[serde(default)]
    pub lru: LruConfig,
    pub tap: Tap,
    pub reals: Vec<RealServer>,
    pub vips: Vec<Vip>,
    #[serde(default)]
    pub src_routes: Vec<SrcRoute>,
}

impl Config {
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let t = &self.settings;
        let mut settings = Settings {
            ring_size: t.ring_size,
            max_conn_rate: t.max_conn_rate,
            udp_idle_timeout_ns: t.udp_idle_timeout_secs.saturating_mul(ONE_SEC_NS),
            copy_inner_tos: t.copy_inner_tos,
            max_frame_len: t.max_frame_len,
            ..Settings::default()
        };
        if let Some(net) = t.encap_v4_prefix {
            if net.prefix() != 16 {
                bail!("encap_v4_prefix must be a /16, got {net}");
            }
            settings.encap_v4_prefix = u32::from(net.network());
        }
        if let Some(net) = t.encap_v6_prefix {
            if net.prefix() != 96 {
                bail!("encap_v6_prefix must be a /96, got {net}");
            }
            let bits = u128::from(net.network());
            settings.encap_v6_prefix = [(bits >> 96) as u32, (bits >> 64) as u32, (bits >> 32) as u32];
        }
        Ok(settings)
    }

    pub fn build_state(&self) -> anyhow::Result<LoadBalancerState> {
        let settings = self.settings()?;
        let ring_size = settings.ring_size;
        let mut builder = StateBuilder::new()
            .settings(settings)
            .gateway_mac(self.gateway_mac);
        for real in &self.reals {
            builder = builder.real(real.id, RealDefinition::new(real.addr.into(), real.local));
        }
        for vip in &self.vips {
            let key = VipKey {
                addr: vip.vip.into(),
                port: vip.port,
                proto: vip.proto,
            };
            let meta = VipMeta {
                flags: vip.flags(),
                vip_num: vip.vip_num,
            };
            builder = builder.vip(key, meta, vip.expand_ring(ring_size)?);
        }
        for route in &self.src_routes {
            builder = builder.src_route(route.prefix, route.real);
        }
        builder.build().context("load balancer tables are inconsistent")
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProtoRepr {
    Number(u8),
    Name(String),
}

fn deserialize_ip_proto<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    match ProtoRepr::deserialize(deserializer)? {
        ProtoRepr::Number(n) if n == IpProto::Tcp as u8 || n == IpProto::Udp as u8 => Ok(n),
        ProtoRepr::Number(n) => Err(Error::custom(format!("unsupported ip protocol {n}"))),
        ProtoRepr::Name(name) => match name.to_ascii_lowercase().as_str() {
            "tcp" => Ok(IpProto::Tcp as u8),
            "udp" => Ok(IpProto::Udp as u8),
            other => Err(Error::custom(format!("unsupported ip protocol {other:?}"))),
        },
    }
}

pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

fn deserialize_mac<'de, D>(deserializer: D) -> Result<[u8; 6], D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let s = String::deserialize(deserializer)?;
    parse_mac(&s).ok_or_else(|| Error::custom(format!("invalid mac address {s:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use l4lb_common::Addr;

    const EXAMPLE: &str = include_str!("../l4lb.example.yaml");

    fn minimal(extra: &str) -> String {
        format!(
            "gateway_mac: \"02:00:00:00:00:fe\"
tap:
  listen: 127.0.0.1:7000
  tx: 127.0.0.1:7100
reals:
  - id: 1
    addr: 10.1.0.1
{extra}"
        )
    }

    #[test]
    fn example_config_builds() {
        let config: Config = serde_yaml::from_str(EXAMPLE).unwrap();
        let state = config.build_state().unwrap();
        assert_eq!(state.settings().ring_size, 8);
        assert_eq!(state.vips().len(), config.vips.len());
        assert_eq!(state.gateway_mac(), Some([0x02, 0, 0, 0, 0, 0xfe]));
        assert!(config.tap.pass.is_some());
    }

    #[test]
    fn defaults_apply() {
        let config: Config = serde_yaml::from_str(&minimal("vips: []")).unwrap();
        assert_eq!(config.settings().unwrap(), Settings::default());
        assert_eq!(config.lru, LruConfig::default());
        assert!(config.src_routes.is_empty());
        assert_eq!(config.tap.pass, None);
    }

    #[test]
    fn vip_fields() {
        let config: Config = serde_yaml::from_str(&minimal(
            "settings:
  ring_size: 4
vips:
  - vip: 10.0.0.1
    port: 443
    proto: udp
    vip_num: 3
    flags: [quic, hash_no_src_port]
    ring:
      - 1
      - { real: 1, count: 2 }
      - 0
src_routes:
  - prefix: 192.168.0.0/16
    real: 1",
        ))
        .unwrap();
        let vip = &config.vips[0];
        assert_eq!(vip.proto, 17);
        assert_eq!(vip.flags(), VipFlags::QUIC_VIP | VipFlags::HASH_NO_SRC_PORT);
        assert_eq!(vip.expand_ring(4).unwrap(), vec![1, 1, 1, 0]);

        let state = config.build_state().unwrap();
        assert_eq!(state.ring_slot(3, 2), Some(1));
        assert_eq!(state.ring_slot(3, 3), Some(0));
        assert_eq!(state.src_route(&Addr::V4(0xc0a8_0001)), Some(1));
    }

    #[test]
    fn numeric_proto_and_bad_values() {
        let ok = minimal("vips:\n  - {vip: 10.0.0.1, port: 80, proto: 6, vip_num: 0, ring: [{real: 1, count: 65537}]}");
        let config: Config = serde_yaml::from_str(&ok).unwrap();
        assert_eq!(config.vips[0].proto, 6);
        config.build_state().unwrap();

        let gre = minimal("vips:\n  - {vip: 10.0.0.1, port: 80, proto: 47, vip_num: 0, ring: []}");
        assert!(serde_yaml::from_str::<Config>(&gre).is_err());

        let bad_mac = minimal("vips: []").replace("02:00:00:00:00:fe", "02:00:00:00:fe");
        assert!(serde_yaml::from_str::<Config>(&bad_mac).is_err());
    }

    #[test]
    fn inconsistent_tables_are_rejected() {
        let short_ring = minimal("vips:\n  - {vip: 10.0.0.1, port: 80, proto: tcp, vip_num: 0, ring: [1, 1]}");
        let config: Config = serde_yaml::from_str(&short_ring).unwrap();
        let err = config.build_state().err().unwrap();
        assert!(format!("{err:#}").contains("expected 65537"));

        let huge_run = minimal(
            "vips:\n  - {vip: 10.0.0.1, port: 80, proto: tcp, vip_num: 2, ring: [1, {real: 2, count: 1000000000000}]}",
        );
        let config: Config = serde_yaml::from_str(&huge_run).unwrap();
        let err = config.build_state().err().unwrap();
        assert!(format!("{err:#}").contains("ring of vip_num 2 is longer than ring_size 65537"));

        let vip = Vip {
            vip: "10.0.0.1".parse().unwrap(),
            port: 80,
            proto: 6,
            vip_num: 0,
            flags: Vec::new(),
            ring: vec![RingSegment::Slot(1), RingSegment::Run { real: 2, count: 3 }],
        };
        assert_eq!(vip.expand_ring(4).unwrap(), vec![1, 2, 2, 2]);
        assert!(vip.expand_ring(3).is_err());

        let wrong_prefix = minimal("vips: []\nsettings:\n  encap_v4_prefix: 172.16.0.0/12");
        let config: Config = serde_yaml::from_str(&wrong_prefix).unwrap();
        assert!(config.settings().is_err());

        let v6_prefix = minimal("vips: []\nsettings:\n  encap_v6_prefix: \"fd00:1:2:3::/96\"");
        let config: Config = serde_yaml::from_str(&v6_prefix).unwrap();
        assert_eq!(config.settings().unwrap().encap_v6_prefix, [0xfd00_0001, 0x0002_0003, 0]);
    }

    #[test]
    fn mac_parsing() {
        assert_eq!(parse_mac("aa:BB:0c:00:01:ff"), Some([0xaa, 0xbb, 0x0c, 0, 1, 0xff]));
        assert_eq!(parse_mac("aa:bb:cc:dd:ee"), None);
        assert_eq!(parse_mac("aa:bb:cc:dd:ee:ff:00"), None);
        assert_eq!(parse_mac("a:bb:cc:dd:ee:ff"), None);
        assert_eq!(parse_mac("zz:bb:cc:dd:ee:ff"), None);
    }
}
