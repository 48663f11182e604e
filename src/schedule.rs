//! Pre-materialized send schedule.
//!
//! Everything the transmit loop needs per slot is produced here, before the
//! drive phase starts: the inter-arrival gap in timestamp-counter ticks,
//! the flow the slot goes to, and the work descriptor the server executes.
//! The arrays are immutable once built, so the hot path never allocates.

use core::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, RngCore};

/// Inter-arrival distribution of the offered load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interarrival {
    Uniform,
    Exponential,
    Lognormal,
    Pareto,
}

impl FromStr for Interarrival {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "uniform" => Ok(Interarrival::Uniform),
            "exponential" => Ok(Interarrival::Exponential),
            "lognormal" => Ok(Interarrival::Lognormal),
            "pareto" => Ok(Interarrival::Pareto),
            _ => Err(()),
        }
    }
}

/// Distribution of the per-request work the server is asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerWork {
    Constant,
    Exponential,
    Bimodal,
}

impl FromStr for ServerWork {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "constant" => Ok(ServerWork::Constant),
            "exponential" => Ok(ServerWork::Exponential),
            "bimodal" => Ok(ServerWork::Bimodal),
            _ => Err(()),
        }
    }
}

/// Per-slot request descriptor sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkDesc {
    pub iterations: u64,
    pub randomness: u64,
}

/// Knobs for the planner.
#[derive(Debug, Clone, Copy)]
pub struct PlanConfig {
    /// Offered load, requests per second.
    pub rate: u64,
    /// Run length, seconds.
    pub duration: u64,
    pub nr_flows: usize,
    pub interarrival: Interarrival,
    pub server_work: ServerWork,
    pub srv_iterations0: u64,
    pub srv_iterations1: u64,
    /// Probability of picking `srv_iterations0` under the bimodal work
    /// distribution.
    pub srv_mode: f64,
}

/// The complete send schedule: one entry of each array per planned slot.
pub struct Schedule {
    /// Gap to the previous slot, timestamp-counter ticks.
    pub gaps: Vec<u64>,
    /// Target flow per slot. The first `nr_flows` entries cover every flow
    /// once; the rest rotate round-robin.
    pub flow_indexes: Vec<u16>,
    pub work: Vec<WorkDesc>,
}

/// Uniform in (0, 1]; keeps `ln` finite.
fn uniform_open(rng: &mut StdRng) -> f64 {
    1.0 - rng.gen::<f64>()
}

fn sample_exponential(rng: &mut StdRng, lambda: f64) -> f64 {
    -uniform_open(rng).ln() / lambda
}

/// Box-Muller transform.
fn sample_lognormal(rng: &mut StdRng, mu: f64, sigma: f64) -> f64 {
    let u1 = uniform_open(rng);
    let u2 = rng.gen::<f64>();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * core::f64::consts::PI * u2).cos();
    (mu + sigma * z).exp()
}

fn sample_pareto(rng: &mut StdRng, alpha: f64, xm: f64) -> f64 {
    xm / uniform_open(rng).powf(1.0 / alpha)
}

impl Schedule {
    /// Materialize all `rate * duration` slots.
    pub fn plan(cfg: &PlanConfig, ticks_per_us: u64, rng: &mut StdRng) -> Schedule {
        let nr_elements = (cfg.rate * cfg.duration) as usize;
        Schedule {
            gaps: build_gaps(cfg, nr_elements, ticks_per_us, rng),
            flow_indexes: build_flow_indexes(cfg.nr_flows, nr_elements),
            work: build_work(cfg, nr_elements, rng),
        }
    }

    pub fn len(&self) -> usize {
        self.gaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gaps.is_empty()
    }
}

fn build_gaps(
    cfg: &PlanConfig,
    nr_elements: usize,
    ticks_per_us: u64,
    rng: &mut StdRng,
) -> Vec<u64> {
    let tpus = ticks_per_us as f64;
    // mean gap in microseconds
    let mean = 1_000_000.0 / cfg.rate as f64;
    let mut gaps = Vec::with_capacity(nr_elements);
    match cfg.interarrival {
        Interarrival::Uniform => {
            let gap = (mean * tpus) as u64;
            gaps.resize(nr_elements, gap);
        }
        Interarrival::Exponential => {
            let lambda = 1.0 / mean;
            for _ in 0..nr_elements {
                gaps.push((sample_exponential(rng, lambda) * tpus) as u64);
            }
        }
        Interarrival::Lognormal => {
            let sigma = (2.0 * (mean.ln() - (mean / 2.0).ln())).sqrt();
            let mu = mean.ln() - (sigma * sigma) / 2.0;
            for _ in 0..nr_elements {
                gaps.push((sample_lognormal(rng, mu, sigma) * tpus) as u64);
            }
        }
        Interarrival::Pareto => {
            let alpha = 1.0 + mean / (mean - 1.0);
            let xm = mean * (alpha - 1.0) / alpha;
            for _ in 0..nr_elements {
                gaps.push((sample_pareto(rng, alpha, xm) * tpus) as u64);
            }
        }
    }
    gaps
}

fn build_flow_indexes(nr_flows: usize, nr_elements: usize) -> Vec<u16> {
    let mut indexes = Vec::with_capacity(nr_elements);
    // one cold request per flow first
    for i in 0..nr_flows.min(nr_elements) {
        indexes.push(i as u16);
    }
    for i in indexes.len()..nr_elements {
        indexes.push((i % nr_flows) as u16);
    }
    indexes
}

fn build_work(cfg: &PlanConfig, nr_elements: usize, rng: &mut StdRng) -> Vec<WorkDesc> {
    let mut work = Vec::with_capacity(nr_elements);
    match cfg.server_work {
        ServerWork::Constant => {
            for _ in 0..nr_elements {
                work.push(WorkDesc {
                    iterations: cfg.srv_iterations0,
                    randomness: rng.next_u64(),
                });
            }
        }
        ServerWork::Exponential => {
            for _ in 0..nr_elements {
                let u = uniform_open(rng);
                work.push(WorkDesc {
                    iterations: (-(cfg.srv_iterations0 as f64) * u.ln()) as u64,
                    randomness: rng.next_u64(),
                });
            }
        }
        ServerWork::Bimodal => {
            for _ in 0..nr_elements {
                let u = rng.gen::<f64>();
                let iterations = if u < cfg.srv_mode {
                    cfg.srv_iterations0
                } else {
                    cfg.srv_iterations1
                };
                work.push(WorkDesc {
                    iterations,
                    randomness: rng.next_u64(),
                });
            }
        }
    }
    work
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    const TPUS: u64 = 1000;

    fn plan(interarrival: Interarrival, rate: u64, duration: u64, nr_flows: usize) -> Schedule {
        let cfg = PlanConfig {
            rate,
            duration,
            nr_flows,
            interarrival,
            server_work: ServerWork::Constant,
            srv_iterations0: 10,
            srv_iterations1: 0,
            srv_mode: 0.0,
        };
        let mut rng = StdRng::seed_from_u64(7);
        Schedule::plan(&cfg, TPUS, &mut rng)
    }

    #[test]
    fn uniform_gaps_cover_the_duration() {
        // 1000 pps for 2 s: 2000 gaps of ~1000 us each
        let sched = plan(Interarrival::Uniform, 1000, 2, 1);
        assert_eq!(sched.len(), 2000);
        assert!(sched.gaps.iter().all(|&g| g == 1000 * TPUS));
        let total: u64 = sched.gaps.iter().sum();
        assert_eq!(total, 2 * 1_000_000 * TPUS);
    }

    #[test]
    fn first_entries_cover_every_flow_once() {
        let sched = plan(Interarrival::Exponential, 10_000, 1, 8);
        let mut seen = [false; 8];
        for (i, &f) in sched.flow_indexes[..8].iter().enumerate() {
            assert_eq!(f as usize, i);
            seen[f as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
        for (i, &f) in sched.flow_indexes.iter().enumerate().skip(8) {
            assert_eq!(f as usize, i % 8);
        }
    }

    #[test]
    fn exponential_mean_close_to_nominal() {
        let sched = plan(Interarrival::Exponential, 10_000, 1, 1);
        let mean_us =
            sched.gaps.iter().sum::<u64>() as f64 / sched.len() as f64 / TPUS as f64;
        // nominal 100 us; 10k samples keep the estimate within a few percent
        assert!((mean_us - 100.0).abs() < 5.0, "mean {mean_us}");
    }

    #[test]
    fn pareto_gaps_have_a_floor() {
        let sched = plan(Interarrival::Pareto, 10_000, 1, 1);
        let mean = 100.0f64;
        let alpha = 1.0 + mean / (mean - 1.0);
        let xm = mean * (alpha - 1.0) / alpha;
        let floor = (xm * TPUS as f64) as u64;
        assert!(sched.gaps.iter().all(|&g| g >= floor));
    }

    #[test]
    fn bimodal_work_uses_both_modes() {
        let cfg = PlanConfig {
            rate: 1000,
            duration: 1,
            nr_flows: 1,
            interarrival: Interarrival::Uniform,
            server_work: ServerWork::Bimodal,
            srv_iterations0: 5,
            srv_iterations1: 500,
            srv_mode: 0.5,
        };
        let mut rng = StdRng::seed_from_u64(3);
        let sched = Schedule::plan(&cfg, TPUS, &mut rng);
        let low = sched.work.iter().filter(|w| w.iterations == 5).count();
        let high = sched.work.iter().filter(|w| w.iterations == 500).count();
        assert_eq!(low + high, 1000);
        assert!(low > 300 && high > 300);
    }

    #[test]
    fn plan_is_reproducible_for_a_seed() {
        let a = plan(Interarrival::Lognormal, 5000, 1, 4);
        let b = plan(Interarrival::Lognormal, 5000, 1, 4);
        assert_eq!(a.gaps, b.gaps);
        assert_eq!(a.work.first().map(|w| w.randomness), b.work.first().map(|w| w.randomness));
    }
}
