//! Measurement store: latency records, the shared histogram, throughput
//! samples, and the end-of-run summary.
//!
//! The histogram is a flat array of atomic counters, one bucket per
//! microsecond; every worker records into it with a fetch-add and nobody
//! reads it until the workers are joined. Percentiles come out of the
//! cumulative bucket walk, so a percentile is always the smallest bucket
//! whose cumulative count reaches the target.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};

/// One kernel-bypass response, appended by the RX parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyRecord {
    pub tx_tsc: u64,
    pub rx_tsc: u64,
    pub flow_id: u64,
    pub worker_id: u64,
}

impl LatencyRecord {
    /// Round-trip time in nanoseconds.
    pub fn rtt_ns(&self, ticks_per_us: u64) -> u64 {
        let ticks = self.rx_tsc.wrapping_sub(self.tx_tsc);
        (ticks as f64 / (ticks_per_us as f64 / 1000.0)) as u64
    }
}

/// Write one record per line: `<rtt_ns>\t<flow_id>\t0x<worker_id_hex>`.
pub fn write_records(path: &Path, records: &[LatencyRecord], ticks_per_us: u64) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("cannot open the output file {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for record in records {
        writeln!(
            out,
            "{}\t{}\t0x{:02x}",
            record.rtt_ns(ticks_per_us),
            record.flow_id,
            record.worker_id
        )?;
    }
    out.flush()?;
    Ok(())
}

/// Bucket count: one bucket per microsecond of latency, 100 ms cap.
pub const HIST_BUCKETS: usize = 100_000;

/// Shared fixed-capacity latency histogram.
pub struct Histogram {
    buckets: Box<[AtomicU64]>,
}

impl Histogram {
    pub fn new() -> Histogram {
        let mut buckets = Vec::with_capacity(HIST_BUCKETS);
        buckets.resize_with(HIST_BUCKETS, || AtomicU64::new(0));
        Histogram {
            buckets: buckets.into_boxed_slice(),
        }
    }

    /// Record one sample, clamping anything beyond the cap into the last
    /// bucket.
    pub fn record_us(&self, us: u64) {
        let idx = (us as usize).min(HIST_BUCKETS - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .sum()
    }

    /// Latency (µs) at the given fraction: the smallest bucket whose
    /// cumulative count reaches `fraction` of the histogram's own total.
    pub fn percentile(&self, fraction: f64) -> u64 {
        let total = self.total();
        if total == 0 {
            return 0;
        }
        let target = (fraction * total as f64).ceil() as u64;
        let mut cumulative = 0u64;
        for (idx, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return idx as u64;
            }
        }
        (HIST_BUCKETS - 1) as u64
    }
}

impl Default for Histogram {
    fn default() -> Histogram {
        Histogram::new()
    }
}

/// Once-a-second throughput snapshots taken by the orchestrator.
#[derive(Debug, Default)]
pub struct ThroughputSamples {
    /// (wall timestamp µs, cumulative completed requests)
    samples: Vec<(u64, u64)>,
}

impl ThroughputSamples {
    pub fn with_capacity(seconds: usize) -> ThroughputSamples {
        ThroughputSamples {
            samples: Vec::with_capacity(seconds),
        }
    }

    pub fn push(&mut self, now_us: u64, cumulative: u64) {
        self.samples.push((now_us, cumulative));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean requests per second over the sampled window.
    pub fn mean_per_second(&self) -> f64 {
        match self.samples.last() {
            Some(&(_, cumulative)) => cumulative as f64 / self.samples.len() as f64,
            None => 0.0,
        }
    }
}

/// The percentiles reported at end-of-run.
pub const SUMMARY_FRACTIONS: [f64; 5] = [0.50, 0.90, 0.99, 0.999, 0.9999];

/// Log the throughput mean and the latency percentiles.
pub fn log_summary(hist: &Histogram, tput: &ThroughputSamples) {
    log::info!(
        "mean throughput: {:.1} req/s over {} samples",
        tput.mean_per_second(),
        tput.len()
    );
    for fraction in SUMMARY_FRACTIONS {
        log::info!(
            "p{:<6}: {} us",
            fraction * 100.0,
            hist.percentile(fraction)
        );
    }
}
