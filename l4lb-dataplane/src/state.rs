//! Control-plane tables as one immutable generation, and the handle lanes
//! load it from.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::HashMapExt;
use arc_swap::{ArcSwap, Guard};
use ipnetwork::IpNetwork;
use l4lb_common::{
    Addr, ControlValue, RealDefinition, VipKey, VipMeta, CTL_GATEWAY_MAC, DEFAULT_MAX_CONN_RATE,
    DEFAULT_RING_SIZE, DEFAULT_UDP_IDLE_TIMEOUT_NS, MAX_REALS, MAX_VIPS, UNASSIGNED_REAL,
};
use log::{debug, warn};

use crate::error::StateError;
use crate::lpm::LpmTable;
use crate::packet::DEFAULT_FRAME_CAPACITY;
use crate::vip::VipTable;

static GENERATION: AtomicU64 = AtomicU64::new(1);

/// Fast-path tunables carried by each snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub ring_size: u32,
    /// New connections per second before the flood guard trips.
    pub max_conn_rate: u64,
    pub udp_idle_timeout_ns: u64,
    /// Copy the inner TOS / traffic class into the outer header.
    pub copy_inner_tos: bool,
    /// Only the top 16 bits are used.
    pub encap_v4_prefix: u32,
    /// Top 96 bits of the outer IPv6 source.
    pub encap_v6_prefix: [u32; 3],
    /// Largest frame an encapsulation may produce, Ethernet header included.
    pub max_frame_len: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            ring_size: DEFAULT_RING_SIZE,
            max_conn_rate: DEFAULT_MAX_CONN_RATE,
            udp_idle_timeout_ns: DEFAULT_UDP_IDLE_TIMEOUT_NS,
            copy_inner_tos: false,
            // 172.16.0.0/16
            encap_v4_prefix: 0xac10_0000,
            // 100::/96
            encap_v6_prefix: [0x0100_0000, 0, 0],
            max_frame_len: DEFAULT_FRAME_CAPACITY,
        }
    }
}

#[derive(Debug)]
pub struct LoadBalancerState {
    vips: VipTable,
    ring: Box<[u32]>,
    reals: Box<[Option<RealDefinition>]>,
    control: Vec<ControlValue>,
    src_routes: LpmTable,
    settings: Settings,
    generation: u64,
}

impl LoadBalancerState {
    pub fn builder() -> StateBuilder {
        StateBuilder::new()
    }

    pub fn vips(&self) -> &VipTable {
        &self.vips
    }

    pub fn vip(&self, key: &VipKey) -> Option<VipMeta> {
        self.vips.get(key).copied()
    }

    /// `None` when the slot lies outside the ring.
    pub fn ring_slot(&self, vip_num: u32, bucket: u32) -> Option<u32> {
        if bucket >= self.settings.ring_size {
            return None;
        }
        let at = u64::from(vip_num) * u64::from(self.settings.ring_size) + u64::from(bucket);
        self.ring.get(usize::try_from(at).ok()?).copied()
    }

    /// Registry lookup. Id 0 never resolves.
    pub fn real(&self, id: u32) -> Option<&RealDefinition> {
        if id == UNASSIGNED_REAL {
            return None;
        }
        self.reals.get(id as usize)?.as_ref()
    }

    pub fn control(&self, index: usize) -> Option<ControlValue> {
        self.control.get(index).copied()
    }

    pub fn gateway_mac(&self) -> Option<[u8; 6]> {
        match self.control(CTL_GATEWAY_MAC)? {
            ControlValue::Mac(mac) => Some(mac),
            _ => None,
        }
    }

    pub fn src_route(&self, addr: &Addr) -> Option<u32> {
        self.src_routes.lookup(addr)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct VipEntry {
    key: VipKey,
    meta: VipMeta,
    ring: Vec<u32>,
}

/// Collects tables and checks them against each other in [`StateBuilder::build`].
#[derive(Default)]
pub struct StateBuilder {
    settings: Settings,
    vips: Vec<VipEntry>,
    reals: Vec<(u32, RealDefinition)>,
    control: Vec<(usize, ControlValue)>,
    src_routes: Vec<(IpNetwork, u32)>,
}

impl StateBuilder {
    pub fn new() -> Self {
        StateBuilder::default()
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// `ring` holds exactly `ring_size` real ids, bucket order.
    pub fn vip(mut self, key: VipKey, meta: VipMeta, ring: Vec<u32>) -> Self {
        self.vips.push(VipEntry { key, meta, ring });
        self
    }

    pub fn real(mut self, id: u32, real: RealDefinition) -> Self {
        self.reals.push((id, real));
        self
    }

    pub fn control(mut self, index: usize, value: ControlValue) -> Self {
        self.control.push((index, value));
        self
    }

    pub fn gateway_mac(self, mac: [u8; 6]) -> Self {
        self.control(CTL_GATEWAY_MAC, ControlValue::Mac(mac))
    }

    pub fn src_route(mut self, net: IpNetwork, real_id: u32) -> Self {
        self.src_routes.push((net, real_id));
        self
    }

    pub fn build(self) -> Result<LoadBalancerState, StateError> {
        let ring_size = self.settings.ring_size;
        if ring_size == 0 {
            return Err(StateError::InvalidRingSize);
        }

        let mut reals = vec![None; MAX_REALS as usize].into_boxed_slice();
        for (id, real) in self.reals {
            if id == UNASSIGNED_REAL {
                return Err(StateError::ReservedRealId);
            }
            let slot = reals
                .get_mut(id as usize)
                .ok_or(StateError::RealIdOutOfRange(id))?;
            if slot.is_some() {
                return Err(StateError::DuplicateReal(id));
            }
            *slot = Some(real);
        }

        let mut vips = VipTable::with_capacity(self.vips.len());
        let mut vip_nums = HashSet::with_capacity(self.vips.len());
        let mut ring_vips = 0usize;
        for entry in &self.vips {
            let vip_num = entry.meta.vip_num;
            if vip_num >= MAX_VIPS {
                return Err(StateError::VipNumOutOfRange(vip_num));
            }
            if !vip_nums.insert(vip_num) {
                return Err(StateError::DuplicateVipNum(vip_num));
            }
            if vips.insert(entry.key, entry.meta).is_some() {
                return Err(StateError::DuplicateVip(entry.key));
            }
            if entry.ring.len() != ring_size as usize {
                return Err(StateError::RingLength {
                    vip_num,
                    expected: ring_size as usize,
                    got: entry.ring.len(),
                });
            }
            ring_vips = ring_vips.max(vip_num as usize + 1);
        }

        let mut ring = vec![UNASSIGNED_REAL; ring_vips * ring_size as usize].into_boxed_slice();
        for entry in self.vips {
            let start = entry.meta.vip_num as usize * ring_size as usize;
            ring[start..start + ring_size as usize].copy_from_slice(&entry.ring);
            let dangling = entry
                .ring
                .iter()
                .filter(|id| **id != UNASSIGNED_REAL && reals.get(**id as usize).map_or(true, Option::is_none))
                .count();
            if dangling > 0 {
                warn!(
                    "vip_num {} has {} ring slots naming unknown reals",
                    entry.meta.vip_num, dangling
                );
            }
        }

        let mut control = Vec::new();
        for (index, value) in self.control {
            if control.len() <= index {
                control.resize(index + 1, ControlValue::Value(0));
            }
            control[index] = value;
        }
        if !matches!(control.get(CTL_GATEWAY_MAC), Some(ControlValue::Mac(_))) {
            return Err(StateError::MissingGatewayMac);
        }

        let mut src_routes = LpmTable::new();
        for (net, real_id) in self.src_routes {
            if reals.get(real_id as usize).map_or(true, Option::is_none) {
                warn!("source route {net} names unknown real {real_id}");
            }
            src_routes.insert(net, real_id);
        }

        let generation = GENERATION.fetch_add(1, Ordering::Relaxed);
        debug!(
            "built snapshot generation {}: {} vips, {} ring slots, {} source routes",
            generation,
            vips.len(),
            ring.len(),
            src_routes.len()
        );
        Ok(LoadBalancerState {
            vips,
            ring,
            reals,
            control,
            src_routes,
            settings: self.settings,
            generation,
        })
    }
}

/// Where lanes pick up the current snapshot. Publishing swaps the whole
/// generation; a lane holding the previous one finishes its packet with it.
pub struct StateHandle {
    current: ArcSwap<LoadBalancerState>,
}

impl StateHandle {
    pub fn new(state: LoadBalancerState) -> Self {
        StateHandle {
            current: ArcSwap::from_pointee(state),
        }
    }

    /// Cheap per-packet load.
    pub fn load(&self) -> Guard<Arc<LoadBalancerState>> {
        self.current.load()
    }

    pub fn snapshot(&self) -> Arc<LoadBalancerState> {
        self.current.load_full()
    }

    /// Returns the generation that was replaced.
    pub fn publish(&self, state: LoadBalancerState) -> u64 {
        self.current.swap(Arc::new(state)).generation()
    }
}
