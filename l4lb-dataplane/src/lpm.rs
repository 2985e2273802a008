//! Longest-prefix match of a client address to a real, for `SRC_ROUTING` VIPs.

use std::net::IpAddr;

use ahash::{HashMap, HashMapExt};
use ipnetwork::IpNetwork;
use l4lb_common::Addr;

/// One hash map per prefix length, searched from the longest down.
#[derive(Debug, Clone, Default)]
pub struct LpmTable {
    v4: Vec<(u8, HashMap<u32, u32>)>,
    v6: Vec<(u8, HashMap<u128, u32>)>,
}

fn mask_v4(addr: u32, prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => addr & (u32::MAX << (32 - u32::from(p))),
    }
}

fn mask_v6(addr: u128, prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        p => addr & (u128::MAX << (128 - u32::from(p))),
    }
}

fn bucket<K>(levels: &mut Vec<(u8, HashMap<K, u32>)>, prefix: u8) -> &mut HashMap<K, u32> {
    let at = match levels.binary_search_by(|(p, _)| prefix.cmp(p)) {
        Ok(at) => at,
        Err(at) => {
            levels.insert(at, (prefix, HashMap::new()));
            at
        }
    };
    &mut levels[at].1
}

impl LpmTable {
    pub fn new() -> Self {
        LpmTable::default()
    }

    /// Maps every address in `net` to `real_id`. Host bits of `net` are ignored.
    pub fn insert(&mut self, net: IpNetwork, real_id: u32) -> Option<u32> {
        let prefix = net.prefix();
        match net.ip() {
            IpAddr::V4(ip) => bucket(&mut self.v4, prefix).insert(mask_v4(u32::from(ip), prefix), real_id),
            IpAddr::V6(ip) => bucket(&mut self.v6, prefix).insert(mask_v6(u128::from(ip), prefix), real_id),
        }
    }

    pub fn lookup(&self, addr: &Addr) -> Option<u32> {
        match *addr {
            Addr::V4(a) => self
                .v4
                .iter()
                .find_map(|(prefix, map)| map.get(&mask_v4(a, *prefix)).copied()),
            Addr::V6(w) => {
                let a = u128::from_be_bytes(Addr::v6_octets(&w));
                self.v6
                    .iter()
                    .find_map(|(prefix, map)| map.get(&mask_v6(a, *prefix)).copied())
            }
        }
    }

    pub fn len(&self) -> usize {
        let v4: usize = self.v4.iter().map(|(_, m)| m.len()).sum();
        let v6: usize = self.v6.iter().map(|(_, m)| m.len()).sum();
        v4 + v6
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
