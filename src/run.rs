//! Orchestration of a raw-packet run: plan, handshake, drive, collect.
//!
//! The order here is the concurrency contract. Everything mutable is built
//! and the handshake completed before the first worker spawns; after that
//! the TX worker owns the flow transmit views, the parser owns the receive
//! views, and the shared atomic bundles are the only cross-thread state.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::NetConfig;
use crate::flow::FlowTable;
use crate::handshake::{self, HandshakeConfig};
use crate::measure::{write_records, LatencyRecord};
use crate::port::{PortStats, RawPort};
use crate::rx;
use crate::schedule::{Interarrival, PlanConfig, Schedule, ServerWork};
use crate::time;
use crate::tx;
use crate::wire::payload;

/// Frames below this cannot carry the six payload words.
pub const MIN_FRAME_SIZE: usize = 96;

/// Seconds the collector keeps running after the schedule should have
/// finished, so late responses still land.
pub const GRACE_SECONDS: u64 = 5;

/// Everything a raw-packet run needs to know.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Offered load, packets per second.
    pub rate: u64,
    /// Run length, seconds.
    pub duration: u64,
    pub nr_flows: usize,
    pub frame_size: usize,
    pub seed: u64,
    pub interarrival: Interarrival,
    pub server_work: ServerWork,
    pub srv_iterations0: u64,
    pub srv_iterations1: u64,
    pub srv_mode: f64,
    pub net: NetConfig,
    pub output: PathBuf,
}

/// Shared run state: configuration constants plus the counters and the
/// quit flag every worker observes.
pub struct RunCtx {
    pub ticks_per_us: u64,
    pub frame_size: usize,
    pub quit: AtomicBool,
    pub never_sent: AtomicU64,
    pub rx_dropped: AtomicU64,
}

impl RunCtx {
    pub fn new(ticks_per_us: u64, frame_size: usize) -> RunCtx {
        RunCtx {
            ticks_per_us,
            frame_size,
            quit: AtomicBool::new(false),
            never_sent: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
        }
    }

    /// TCP payload bytes per data frame.
    pub fn payload_size(&self) -> usize {
        self.frame_size - payload::OFFSET
    }
}

/// Best-effort pinning of the calling thread to one core.
#[cfg(target_os = "linux")]
pub fn pin_to_core(core: usize) {
    let ncpu = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core % ncpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            log::debug!("cannot pin to core {core}");
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn pin_to_core(_core: usize) {}

/// What a completed run measured.
#[derive(Debug)]
pub struct RunReport {
    pub records: usize,
    pub never_sent: u64,
    pub rx_dropped: u64,
    pub port_stats: PortStats,
}

/// Execute a full run against `port` and write the measurement file.
pub fn run(cfg: &RunConfig, port: Box<dyn RawPort>) -> Result<RunReport> {
    run_with_handshake(cfg, port, &HandshakeConfig::default())
}

pub fn run_with_handshake(
    cfg: &RunConfig,
    mut port: Box<dyn RawPort>,
    hs: &HandshakeConfig,
) -> Result<RunReport> {
    if cfg.frame_size < MIN_FRAME_SIZE {
        bail!("the minimum frame size is {MIN_FRAME_SIZE}");
    }

    let ticks_per_us = time::calibrate_ticks_per_us();
    info!("timer calibrated: {ticks_per_us} ticks/us");

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let plan_cfg = PlanConfig {
        rate: cfg.rate,
        duration: cfg.duration,
        nr_flows: cfg.nr_flows,
        interarrival: cfg.interarrival,
        server_work: cfg.server_work,
        srv_iterations0: cfg.srv_iterations0,
        srv_iterations1: cfg.srv_iterations1,
        srv_mode: cfg.srv_mode,
    };
    let sched = Schedule::plan(&plan_cfg, ticks_per_us, &mut rng);
    let nr_elements = sched.len();

    let mut table = FlowTable::new(cfg.nr_flows, &cfg.net, &mut rng);

    info!("establishing {} flow(s)", cfg.nr_flows);
    handshake::establish_all(&mut *port, &mut table, &cfg.net, ticks_per_us, hs)?;
    info!("all flows established");

    // handshake done; split the port and hand each worker its own state
    let (mut txq, mut rxq, ctl) = port.split();
    let (mut ring_prod, mut ring_cons) = rx::rx_ring();

    let ctx = Arc::new(RunCtx::new(ticks_per_us, cfg.frame_size));
    let shared = table.shared.clone();
    let mut flows_tx = table.tx;
    let mut flows_rx = table.rx;
    let net = cfg.net;

    let parser = {
        let ctx = ctx.clone();
        let shared = shared.clone();
        thread::spawn(move || -> Vec<LatencyRecord> {
            pin_to_core(1);
            let mut records = Vec::with_capacity(nr_elements);
            rx::run_parser(&mut ring_cons, &mut flows_rx, &shared, &mut records, &ctx);
            records
        })
    };

    let ingest = {
        let ctx = ctx.clone();
        thread::spawn(move || -> Result<()> {
            pin_to_core(2);
            rx::run_ingest(&mut *rxq, &mut ring_prod, &ctx)
        })
    };

    let transmit = {
        let ctx = ctx.clone();
        let shared = shared.clone();
        thread::spawn(move || -> u64 {
            pin_to_core(3);
            tx::run_tx(&mut *txq, &sched, &mut flows_tx, &shared, &net, &ctx)
        })
    };

    // wait out the run, then stop every worker
    thread::sleep(Duration::from_secs(cfg.duration + GRACE_SECONDS));
    ctx.quit.store(true, Ordering::Release);

    let sent = transmit
        .join()
        .map_err(|_| anyhow!("transmit worker panicked"))?;
    let ingest_result = ingest
        .join()
        .map_err(|_| anyhow!("ingest worker panicked"))?;
    let records = parser
        .join()
        .map_err(|_| anyhow!("parser worker panicked"))?;
    ingest_result?;

    let never_sent = ctx.never_sent.load(Ordering::Relaxed);
    let rx_dropped = ctx.rx_dropped.load(Ordering::Relaxed);
    info!("sent {sent}, received {}, never sent {never_sent}", records.len());
    if rx_dropped > 0 {
        warn!("{rx_dropped} response(s) dropped on flow-id mismatch");
    }

    // every planned slot must be accounted for, as a response or a slip
    if records.len() as u64 + never_sent != (cfg.rate * cfg.duration) {
        bail!(
            "accounting mismatch: received {} and {} never sent of {}",
            records.len(),
            never_sent,
            cfg.rate * cfg.duration
        );
    }

    write_records(&cfg.output, &records, ticks_per_us)?;

    let port_stats = ctl.stats();
    info!(
        "port: rx {} pkts / {} bytes, tx {} pkts / {} bytes",
        port_stats.rx_packets, port_stats.rx_bytes, port_stats.tx_packets, port_stats.tx_bytes
    );

    Ok(RunReport {
        records: records.len(),
        never_sent,
        rx_dropped,
        port_stats,
    })
}
