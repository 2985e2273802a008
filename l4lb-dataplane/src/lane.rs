//! One run-to-completion worker: parse, pick a real, encapsulate, count.

use std::sync::Arc;

use l4lb_common::{GlobalCounter, RealFlags, VipFlags};
use log::{debug, trace};
use network_types::ip::IpProto;

use crate::affinity::{AffinityEntry, AffinityShard, CacheTier, FallbackCache, Lookup};
use crate::encap::{self, EncapParams};
use crate::error::DropReason;
use crate::flood::FloodGuard;
use crate::icmp;
use crate::packet::PacketBuf;
use crate::parse::{self, Packet, Parsed};
use crate::quic;
use crate::ring::{self, Selection};
use crate::state::LoadBalancerState;
use crate::stats::LbStats;
use crate::vip;

/// What happens to the frame after [`Lane::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Drop(DropReason),
    /// Hand the frame, unchanged, to the local stack.
    PassThrough,
    /// The frame was rewritten into an echo reply; send it back out.
    EchoReply,
    TxEncapsulated { real_id: u32 },
}

/// State every lane touches.
pub struct SharedDataplane {
    pub flood: FloodGuard,
    pub fallback: FallbackCache,
}

impl SharedDataplane {
    pub fn new(fallback_capacity: usize, fallback_shards: usize) -> Self {
        SharedDataplane {
            flood: FloodGuard::new(),
            fallback: FallbackCache::new(fallback_capacity, fallback_shards),
        }
    }
}

pub struct Lane {
    id: usize,
    /// `None` sends all affinity traffic to the shared fallback.
    shard: Option<AffinityShard>,
    shared: Arc<SharedDataplane>,
    stats: LbStats,
}

impl Lane {
    /// A `shard_capacity` of zero leaves the lane without a shard of its own.
    pub fn new(id: usize, shard_capacity: usize, shared: Arc<SharedDataplane>) -> Self {
        let shard = (shard_capacity > 0).then(|| AffinityShard::new(shard_capacity));
        debug!(
            "lane {}: {}",
            id,
            match &shard {
                Some(s) => format!("private affinity shard of {} entries", s.capacity()),
                None => "using the fallback affinity cache".to_string(),
            }
        );
        Lane {
            id,
            shard,
            shared,
            stats: LbStats::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn stats(&self) -> &LbStats {
        &self.stats
    }

    pub fn process(&mut self, state: &LoadBalancerState, pkt: &mut PacketBuf, now_ns: u64) -> Disposition {
        let packet = match parse::parse(pkt.data()) {
            Parsed::Flow(packet) => packet,
            Parsed::Pass => return Disposition::PassThrough,
            Parsed::Drop => {
                self.stats.inc_v1(GlobalCounter::Drop);
                return Disposition::Drop(DropReason::Malformed);
            }
            Parsed::EchoRequest { v6 } => {
                return match icmp::echo_reply(pkt.data_mut(), v6) {
                    Some(()) => {
                        self.stats.inc_family(GlobalCounter::IcmpEcho, v6);
                        Disposition::EchoReply
                    }
                    None => {
                        self.stats.inc_v1(GlobalCounter::Drop);
                        Disposition::Drop(DropReason::Malformed)
                    }
                };
            }
        };
        if packet.flags.too_big {
            self.stats.inc_family(GlobalCounter::IcmpTooBig, packet.is_v6);
        }
        self.balance(state, pkt, &packet, now_ns)
    }

    fn balance(
        &mut self,
        state: &LoadBalancerState,
        pkt: &mut PacketBuf,
        packet: &Packet,
        now_ns: u64,
    ) -> Disposition {
        let settings = state.settings();
        let bytes = u64::from(packet.pkt_bytes);
        let mut flow = packet.flow;
        let Some(meta) = vip::resolve(state.vips(), &mut flow) else {
            return Disposition::PassThrough;
        };
        self.stats.vip_packet(meta.vip_num, bytes);

        // Local VIP traffic still counts towards the window.
        let under_flood = self.shared.flood.check(now_ns, settings.max_conn_rate);
        if under_flood {
            self.stats.inc_v1(GlobalCounter::NewConnRate);
        }
        if meta.flags.contains(VipFlags::LOCAL_VIP) {
            return Disposition::PassThrough;
        }

        let key = vip::normalize(&flow, meta.flags);
        let is_udp = key.proto == IpProto::Udp as u8;
        let is_tcp = key.proto == IpProto::Tcp as u8;
        let bypass = meta.flags.contains(VipFlags::LRU_BYPASS);
        self.stats.inc_v1(GlobalCounter::Lru);

        let mut real_id = None;
        if meta.flags.contains(VipFlags::QUIC_VIP) && is_udp && !packet.flags.icmp {
            match packet
                .quic_head
                .and_then(|head| quic::server_id(&head))
                .filter(|id| state.real(*id).is_some())
            {
                Some(id) => {
                    self.stats.inc_v1(GlobalCounter::QuicRouting);
                    real_id = Some(id);
                }
                None => self.stats.inc_v2(GlobalCounter::QuicRouting),
            }
        }

        let mut tier = match self.shard.as_mut() {
            Some(shard) => CacheTier::Shard(shard),
            None => CacheTier::Fallback(&self.shared.fallback),
        };
        let uses_fallback = matches!(tier, CacheTier::Fallback(_));
        // FallbackLru v1 counts packets, not lookups plus inserts.
        let mut fallback_counted = false;

        if real_id.is_none() && !bypass && !packet.flags.syn {
            if uses_fallback {
                self.stats.inc_v1(GlobalCounter::FallbackLru);
                fallback_counted = true;
            }
            match tier.lookup(&key, is_udp, now_ns, settings.udp_idle_timeout_ns) {
                Lookup::Hit(id) if state.real(id).is_some() => real_id = Some(id),
                Lookup::Hit(_) | Lookup::Miss => {}
                Lookup::Busy => self.stats.inc_v2(GlobalCounter::FallbackLru),
            }
        }

        let real_id = match real_id {
            Some(id) => id,
            None => {
                self.stats.inc_v2(GlobalCounter::Lru);
                if is_tcp {
                    if packet.flags.syn {
                        self.stats.inc_v1(GlobalCounter::LruMiss);
                    } else {
                        self.stats.inc_v2(GlobalCounter::LruMiss);
                    }
                }

                let mut routed = None;
                if meta.flags.contains(VipFlags::SRC_ROUTING) && !under_flood {
                    routed = state.src_route(&packet.flow.src);
                    if routed.is_some() {
                        self.stats.inc_v1(GlobalCounter::LpmSrc);
                    } else {
                        self.stats.inc_v2(GlobalCounter::LpmSrc);
                    }
                }
                let id = match routed {
                    Some(id) => id,
                    None => match ring::select(state, meta.vip_num, &key) {
                        Selection::Real(id) => id,
                        Selection::SlotUnassigned => {
                            self.stats.inc_v1(GlobalCounter::RingUnassigned);
                            trace!("lane {}: unassigned ring slot for {:?}", self.id, key);
                            return Disposition::Drop(DropReason::RingSlotUnassigned);
                        }
                    },
                };
                if state.real(id).is_none() {
                    self.stats.inc_v1(GlobalCounter::RealNotFound);
                    trace!("lane {}: ring names unknown real {}", self.id, id);
                    return Disposition::Drop(DropReason::RealNotFound);
                }

                if !bypass {
                    if under_flood {
                        self.stats.inc_v2(GlobalCounter::NewConnRate);
                    } else {
                        if uses_fallback && !fallback_counted {
                            self.stats.inc_v1(GlobalCounter::FallbackLru);
                        }
                        let entry = AffinityEntry {
                            real_id: id,
                            last_access: now_ns,
                        };
                        if !tier.insert(key, entry) {
                            self.stats.inc_v2(GlobalCounter::FallbackLru);
                        }
                    }
                }
                id
            }
        };

        // Checked on every path above.
        let Some(real) = state.real(real_id).copied() else {
            self.stats.inc_v1(GlobalCounter::RealNotFound);
            return Disposition::Drop(DropReason::RealNotFound);
        };
        if real.flags.contains(RealFlags::LOCAL_REAL) {
            self.stats.real_packet(real_id, bytes);
            return Disposition::PassThrough;
        }

        let params = EncapParams {
            flow: &packet.flow,
            real: real.addr,
            inner_v6: packet.is_v6,
            pkt_bytes: packet.pkt_bytes,
            tos: packet.tos,
            gateway_mac: state.gateway_mac(),
            settings,
        };
        match encap::encapsulate(pkt, &params) {
            Ok(()) => {
                self.stats.real_packet(real_id, bytes);
                Disposition::TxEncapsulated { real_id }
            }
            Err(err) => {
                trace!("lane {}: encapsulation towards real {} failed: {}", self.id, real_id, err);
                self.stats.inc_v2(GlobalCounter::Drop);
                Disposition::Drop(DropReason::EncapFailed)
            }
        }
    }
}
