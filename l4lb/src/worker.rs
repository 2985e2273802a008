use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use l4lb_common::GlobalCounter;
use l4lb_dataplane::{Disposition, Lane, PacketBuf, StateHandle, StatsSnapshot};
use log::{debug, info, trace, warn};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time;

use crate::config::Tap;

/// How often a lane hands a copy of its counters to the reporter.
const STATS_PUBLISH_INTERVAL: Duration = Duration::from_secs(1);
/// Large enough that an oversized frame is received whole and then refused.
const RECV_BUFFER: usize = 65536;

/// Drives one [`Lane`] from its tap socket.
pub struct LaneWorker {
    lane: Lane,
    socket: UdpSocket,
    state: Arc<StateHandle>,
    tx: SocketAddr,
    pass: Option<SocketAddr>,
    epoch: Instant,
    stats: watch::Sender<StatsSnapshot>,
}

impl LaneWorker {
    pub fn new(
        lane: Lane,
        socket: UdpSocket,
        state: Arc<StateHandle>,
        tap: &Tap,
        epoch: Instant,
        stats: watch::Sender<StatsSnapshot>,
    ) -> Self {
        LaneWorker {
            lane,
            socket,
            state,
            tx: tap.tx,
            pass: tap.pass,
            epoch,
            stats,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut pkt = PacketBuf::default();
        let mut frame = vec![0u8; RECV_BUFFER];
        let mut publish = time::interval(STATS_PUBLISH_INTERVAL);
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut frame) => {
                    let (len, _) = received.context("tap receive failed")?;
                    self.handle(&mut pkt, &frame[..len]).await;
                }
                _ = publish.tick() => {
                    self.stats.send_replace(self.lane.stats().snapshot());
                }
            }
        }
    }

    async fn handle(&mut self, pkt: &mut PacketBuf, frame: &[u8]) {
        if let Err(err) = pkt.load(frame) {
            warn!("lane {}: {}", self.lane.id(), err);
            return;
        }
        let now = self.epoch.elapsed().as_nanos() as u64;
        let disposition = {
            let state = self.state.load();
            self.lane.process(&state, pkt, now)
        };

        let dest = match disposition {
            Disposition::TxEncapsulated { .. } | Disposition::EchoReply => Some(self.tx),
            Disposition::PassThrough => {
                if self.pass.is_none() {
                    debug!("lane {}: no pass tap, dropping local frame", self.lane.id());
                }
                self.pass
            }
            Disposition::Drop(reason) => {
                trace!("lane {}: dropped: {}", self.lane.id(), reason);
                None
            }
        };
        if let Some(dest) = dest {
            if let Err(err) = self.socket.send_to(pkt.data(), dest).await {
                warn!("lane {}: send to {} failed: {}", self.lane.id(), dest, err);
            }
        }
    }
}

/// Merges every lane's latest counters and logs them every `every`.
pub async fn report_stats(lanes: Vec<watch::Receiver<StatsSnapshot>>, every: Duration) {
    let mut ticker = time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let mut total = StatsSnapshot::default();
        for lane in &lanes {
            total.merge(&lane.borrow());
        }
        log_stats(&total);
    }
}

fn log_stats(total: &StatsSnapshot) {
    let counters = GlobalCounter::ALL
        .iter()
        .map(|c| {
            let pair = total.global(*c);
            format!("{}={}/{}", c.name(), pair.v1, pair.v2)
        })
        .collect::<Vec<_>>()
        .join(" ");
    info!("stats: {}", counters);
    for (vip_num, pair) in total.active_vips() {
        debug!("vip {}: {} packets, {} bytes", vip_num, pair.v1, pair.v2);
    }
    for (real_id, pair) in total.active_reals() {
        debug!("real {}: {} packets, {} bytes", real_id, pair.v1, pair.v2);
    }
}
