use std::sync::atomic::{AtomicU64, Ordering};

use l4lb_common::ONE_SEC_NS;

/// New-connection rate limiter over a one second window, shared by all lanes.
///
/// Lanes race on the two counters; a lost increment or a double reset only
/// shifts the window by one packet.
#[derive(Debug, Default)]
pub struct FloodGuard {
    window_start: AtomicU64,
    count: AtomicU64,
}

impl FloodGuard {
    pub fn new() -> Self {
        FloodGuard::default()
    }

    /// Counts one packet seen at `now_ns` and reports whether the current
    /// window has gone past `ceiling`.
    ///
    /// Lanes call this for every packet addressed to a VIP, `LOCAL_VIP` ones
    /// included, before any cache or ring work.
    pub fn check(&self, now_ns: u64, ceiling: u64) -> bool {
        let start = self.window_start.load(Ordering::Relaxed);
        let count = if now_ns.saturating_sub(start) > ONE_SEC_NS {
            self.window_start.store(now_ns, Ordering::Relaxed);
            self.count.store(1, Ordering::Relaxed);
            1
        } else {
            self.count.fetch_add(1, Ordering::Relaxed) + 1
        };
        count > ceiling
    }

    pub fn current(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}
