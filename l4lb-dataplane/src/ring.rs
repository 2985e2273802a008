//! Flow hash and ring lookup on an affinity miss.

use l4lb_common::{Addr, FlowKey, INIT_JHASH_SEED, INIT_JHASH_SEED_V6, UNASSIGNED_REAL};

use crate::jhash::{jhash2, jhash_2words};
use crate::state::LoadBalancerState;

/// Hash of a normalized flow key. IPv6 sources are first folded to one word.
pub fn flow_hash(key: &FlowKey) -> u32 {
    let src = match key.src {
        Addr::V4(a) => a,
        Addr::V6(w) => jhash2(&w, INIT_JHASH_SEED_V6),
    };
    jhash_2words(src, key.ports(), INIT_JHASH_SEED)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Real(u32),
    SlotUnassigned,
}

/// Picks the ring bucket for `key` within `vip_num`'s ring. The registry is
/// not consulted.
pub fn select(state: &LoadBalancerState, vip_num: u32, key: &FlowKey) -> Selection {
    let bucket = flow_hash(key) % state.settings().ring_size;
    match state.ring_slot(vip_num, bucket) {
        Some(UNASSIGNED_REAL) | None => Selection::SlotUnassigned,
        Some(id) => Selection::Real(id),
    }
}
