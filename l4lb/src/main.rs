mod config;
mod worker;

use anyhow::Context;
use clap::Parser;
use config::Config;
use l4lb_dataplane::{Lane, SharedDataplane, StateHandle, StatsSnapshot};
use log::{error, info, warn};
use std::fs::File;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;
use worker::LaneWorker;

#[derive(Debug, Parser)]
struct Opt {
    #[clap(short, long)]
    config: String,
    /// Worker lanes. Defaults to the number of online CPUs.
    #[clap(short, long)]
    lanes: Option<usize>,
    /// Seconds between stats reports.
    #[clap(long, default_value_t = 10)]
    stats_interval: u64,
}

fn load_config(opt: &Opt) -> Result<Config, anyhow::Error> {
    let mut config_file = File::open(&opt.config)?;
    let mut config_contents = String::new();
    config_file.read_to_string(&mut config_contents)?;
    let config: Config = serde_yaml::from_str(&config_contents)?;
    Ok(config)
}

fn online_cpus() -> usize {
    // SAFETY: sysconf only reads a system value.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    usize::try_from(n).ok().filter(|n| *n > 0).unwrap_or(1)
}

/// Swaps in the tables of a freshly read config. Lanes, taps and cache sizes
/// only change on restart.
fn reload(opt: &Opt, handle: &StateHandle) {
    let state = load_config(opt)
        .context("failed to load config")
        .and_then(|config| config.build_state());
    match state {
        Ok(state) => {
            let generation = state.generation();
            let replaced = handle.publish(state);
            info!("reloaded config: generation {} replaces {}", generation, replaced);
        }
        Err(e) => warn!(
            "reload failed, keeping generation {}: {:#}",
            handle.load().generation(),
            e
        ),
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let opt = Opt::parse();

    let config = load_config(&opt).context("failed to load config")?;
    let state = config
        .build_state()
        .context("failed to build load balancer state")?;
    info!(
        "loaded generation {} with {} vips",
        state.generation(),
        state.vips().len()
    );
    let handle = Arc::new(StateHandle::new(state));

    let lanes = opt.lanes.unwrap_or_else(online_cpus).max(1);
    let shared = Arc::new(SharedDataplane::new(
        config.lru.fallback_capacity,
        config.lru.fallback_shards,
    ));
    let epoch = Instant::now();
    let mut stats = Vec::with_capacity(lanes);
    for id in 0..lanes {
        let port = u16::try_from(id)
            .ok()
            .and_then(|offset| config.tap.listen.port().checked_add(offset))
            .with_context(|| format!("no listen port left for lane {}", id))?;
        let addr = SocketAddr::new(config.tap.listen.ip(), port);
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind lane {} to {}", id, addr))?;

        let shard_capacity = if config.lru.shardless_lanes.contains(&id) {
            0
        } else {
            config.lru.shard_capacity
        };
        let (stats_tx, stats_rx) = watch::channel(StatsSnapshot::default());
        stats.push(stats_rx);
        let worker = LaneWorker::new(
            Lane::new(id, shard_capacity, shared.clone()),
            socket,
            handle.clone(),
            &config.tap,
            epoch,
            stats_tx,
        );
        tokio::spawn(async move {
            if let Err(e) = worker.run().await {
                error!("lane {} stopped: {:#}", id, e);
            }
        });
        info!("lane {} listening on {}", id, addr);
    }
    tokio::spawn(worker::report_stats(
        stats,
        Duration::from_secs(opt.stats_interval.max(1)),
    ));

    let mut hangup = signal::unix::signal(SignalKind::hangup())
        .context("failed to install the SIGHUP handler")?;
    info!("Waiting for Ctrl-C...");
    loop {
        tokio::select! {
            res = signal::ctrl_c() => {
                res?;
                break;
            }
            _ = hangup.recv() => reload(&opt, &handle),
        }
    }
    info!("Exiting...");

    Ok(())
}
