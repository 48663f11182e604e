//! Sockets-based key-value load generator.
//!
//! Workers drive non-blocking connection pools against a RESP server; the
//! orchestrator samples completed-request counters once per second and
//! folds everything into the throughput table and the shared latency
//! histogram at the end.

pub mod conn;
pub mod worker;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::keygen::{KeyDist, KeyGen, ZipfTable, MAX_KEY};
use crate::measure::{log_summary, Histogram, ThroughputSamples};
use crate::run::pin_to_core;
use crate::time::monotonic_us;
use crate::wire::Ipv4Address;

use conn::{ConnOpts, Connection};

/// Everything a key-value run needs to know.
#[derive(Debug, Clone)]
pub struct KvConfig {
    pub host: Ipv4Address,
    pub port: u16,
    /// Run length, seconds.
    pub duration: u64,
    /// Per-connection token-bucket rate; zero disables the limiter.
    pub rate: u64,
    /// Connections per worker.
    pub nconns: usize,
    /// Worker threads.
    pub ncores: usize,
    /// In-flight cap per connection.
    pub max_pending: usize,
    pub vsize: usize,
    pub set_ratio: u32,
    pub get_ratio: u32,
    pub dist: KeyDist,
    pub seed: u64,
}

/// What a completed run measured.
pub struct KvReport {
    pub hist: Arc<Histogram>,
    pub throughput: ThroughputSamples,
    pub total_requests: u64,
}

/// Execute a full key-value run.
pub fn run(cfg: &KvConfig) -> Result<KvReport> {
    let hist = Arc::new(Histogram::new());
    let quit = Arc::new(AtomicBool::new(false));
    let zipf = match cfg.dist {
        KeyDist::Zipfian => Some(Arc::new(ZipfTable::new(MAX_KEY))),
        _ => None,
    };

    // one completed-request counter per connection, sampled by this thread
    let counters: Vec<Arc<AtomicU64>> = (0..cfg.ncores * cfg.nconns)
        .map(|_| Arc::new(AtomicU64::new(0)))
        .collect();

    let opts = ConnOpts {
        max_pending: cfg.max_pending,
        rate: cfg.rate,
        set_ratio: cfg.set_ratio,
        get_ratio: cfg.get_ratio,
        vsize: cfg.vsize,
    };

    info!(
        "starting {} worker(s) with {} connection(s) each against {}:{}",
        cfg.ncores, cfg.nconns, cfg.host, cfg.port
    );

    let mut workers = Vec::with_capacity(cfg.ncores);
    for w in 0..cfg.ncores {
        let hist = hist.clone();
        let quit = quit.clone();
        let opts = opts.clone();
        let zipf = zipf.clone();
        let counters: Vec<Arc<AtomicU64>> = counters
            [w * cfg.nconns..(w + 1) * cfg.nconns]
            .iter()
            .cloned()
            .collect();
        let host = cfg.host;
        let port = cfg.port;
        let dist = cfg.dist;
        let seed = cfg.seed;

        workers.push(thread::spawn(move || -> Result<()> {
            pin_to_core(w + 1);
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(w as u64));
            let conns = counters
                .iter()
                .map(|counter| {
                    Connection::connect(
                        host,
                        port,
                        opts.clone(),
                        KeyGen::new(dist, zipf.clone()),
                        counter.clone(),
                    )
                })
                .collect::<Result<Vec<Connection>>>()?;
            worker::run_worker(conns, &hist, &mut rng, &quit)
        }));
    }

    // once-a-second throughput sampling for the whole run
    let mut throughput = ThroughputSamples::with_capacity(cfg.duration as usize);
    for _ in 0..cfg.duration {
        thread::sleep(Duration::from_secs(1));
        let cumulative: u64 = counters.iter().map(|c| c.load(Ordering::Relaxed)).sum();
        throughput.push(monotonic_us(), cumulative);
    }

    quit.store(true, Ordering::Release);
    for worker in workers {
        worker.join().map_err(|_| anyhow!("worker panicked"))??;
    }

    let total_requests: u64 = counters.iter().map(|c| c.load(Ordering::Relaxed)).sum();
    log_summary(&hist, &throughput);

    Ok(KvReport {
        hist,
        throughput,
        total_requests,
    })
}
