//! VIP resolution and flow key normalization.

use ahash::HashMap;
use l4lb_common::{FlowKey, VipFlags, VipKey, VipMeta};

pub type VipTable = HashMap<VipKey, VipMeta>;

/// Exact `(addr, port, proto)` match first, then the port-0 wildcard VIP.
///
/// A wildcard hit clears `flow.dst_port` unless the VIP hashes on the
/// destination port.
pub fn resolve(vips: &VipTable, flow: &mut FlowKey) -> Option<VipMeta> {
    let mut key = VipKey {
        addr: flow.dst,
        port: flow.dst_port,
        proto: flow.proto,
    };
    if let Some(meta) = vips.get(&key) {
        return Some(*meta);
    }

    key.port = 0;
    let meta = *vips.get(&key)?;
    if !meta.flags.contains(VipFlags::HASH_DPORT_ONLY) {
        flow.dst_port = 0;
    }
    Some(meta)
}

/// Key used for both the affinity cache and the ring hash.
pub fn normalize(flow: &FlowKey, flags: VipFlags) -> FlowKey {
    let mut key = *flow;
    if flags.contains(VipFlags::HASH_DPORT_ONLY) {
        key.src_port = key.dst_port;
        key.src = key.src.zeroed();
    }
    if flags.contains(VipFlags::HASH_NO_SRC_PORT) {
        key.src_port = 0;
    }
    key
}
