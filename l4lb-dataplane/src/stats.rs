//! Per-lane counters. Lanes never share a block; readers merge snapshots.

use l4lb_common::{GlobalCounter, StatsPair, MAX_REALS, MAX_VIPS};

/// Counter values at one point in time. For VIPs and reals `v1` is packets
/// and `v2` is bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    vips: Box<[StatsPair]>,
    reals: Box<[StatsPair]>,
    global: [StatsPair; GlobalCounter::COUNT],
}

impl Default for StatsSnapshot {
    fn default() -> Self {
        StatsSnapshot {
            vips: vec![StatsPair::zeroed(); MAX_VIPS as usize].into_boxed_slice(),
            reals: vec![StatsPair::zeroed(); MAX_REALS as usize].into_boxed_slice(),
            global: [StatsPair::zeroed(); GlobalCounter::COUNT],
        }
    }
}

fn add(into: &mut StatsPair, from: &StatsPair) {
    into.v1 += from.v1;
    into.v2 += from.v2;
}

impl StatsSnapshot {
    pub fn global(&self, counter: GlobalCounter) -> StatsPair {
        self.global[counter as usize]
    }

    pub fn vip(&self, vip_num: u32) -> StatsPair {
        self.vips.get(vip_num as usize).copied().unwrap_or_default()
    }

    pub fn real(&self, real_id: u32) -> StatsPair {
        self.reals.get(real_id as usize).copied().unwrap_or_default()
    }

    /// VIP slots that have seen traffic.
    pub fn active_vips(&self) -> impl Iterator<Item = (u32, StatsPair)> + '_ {
        active(&self.vips)
    }

    pub fn active_reals(&self) -> impl Iterator<Item = (u32, StatsPair)> + '_ {
        active(&self.reals)
    }

    /// Adds `other` into `self`, slot by slot.
    pub fn merge(&mut self, other: &StatsSnapshot) {
        for (into, from) in self.vips.iter_mut().zip(other.vips.iter()) {
            add(into, from);
        }
        for (into, from) in self.reals.iter_mut().zip(other.reals.iter()) {
            add(into, from);
        }
        for (into, from) in self.global.iter_mut().zip(other.global.iter()) {
            add(into, from);
        }
    }
}

fn active(slots: &[StatsPair]) -> impl Iterator<Item = (u32, StatsPair)> + '_ {
    slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.v1 != 0 || s.v2 != 0)
        .map(|(i, s)| (i as u32, *s))
}

/// A lane's live counter block, preallocated for every VIP and real slot.
#[derive(Debug, Default)]
pub struct LbStats {
    current: StatsSnapshot,
}

impl LbStats {
    pub fn new() -> Self {
        LbStats::default()
    }

    pub fn inc_v1(&mut self, counter: GlobalCounter) {
        self.current.global[counter as usize].v1 += 1;
    }

    pub fn inc_v2(&mut self, counter: GlobalCounter) {
        self.current.global[counter as usize].v2 += 1;
    }

    /// Bumps `v1` or `v2` depending on the address family, for counters
    /// split that way.
    pub fn inc_family(&mut self, counter: GlobalCounter, v6: bool) {
        if v6 {
            self.inc_v2(counter);
        } else {
            self.inc_v1(counter);
        }
    }

    pub fn vip_packet(&mut self, vip_num: u32, bytes: u64) {
        if let Some(slot) = self.current.vips.get_mut(vip_num as usize) {
            slot.v1 += 1;
            slot.v2 += bytes;
        }
    }

    pub fn real_packet(&mut self, real_id: u32, bytes: u64) {
        if let Some(slot) = self.current.reals.get_mut(real_id as usize) {
            slot.v1 += 1;
            slot.v2 += bytes;
        }
    }

    pub fn view(&self) -> &StatsSnapshot {
        &self.current
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.current.clone()
    }
}
