//! Key generation for the key-value workload.
//!
//! Three shapes: uniform over the key space, zipfian with a pre-built
//! CDF over the key ranks, and a per-connection sequential walk where GETs
//! only ever touch keys that connection has already SET.

use core::str::FromStr;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;

pub const MIN_KEY: u64 = 1;
pub const MAX_KEY: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDist {
    Uniform,
    Zipfian,
    Sequential,
}

impl FromStr for KeyDist {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "uniform" => Ok(KeyDist::Uniform),
            "zipfian" => Ok(KeyDist::Zipfian),
            "sequential" => Ok(KeyDist::Sequential),
            _ => Err(()),
        }
    }
}

/// Cumulative distribution over ranks `1..=n` with exponent s = 1,
/// built once and shared by every connection.
#[derive(Debug)]
pub struct ZipfTable {
    cdf: Vec<f64>,
}

impl ZipfTable {
    pub fn new(n: u64) -> ZipfTable {
        let mut cdf = Vec::with_capacity(n as usize);
        let mut sum = 0.0;
        for i in 1..=n {
            sum += 1.0 / i as f64;
        }
        let mut cumulative = 0.0;
        for i in 1..=n {
            cumulative += (1.0 / i as f64) / sum;
            cdf.push(cumulative);
        }
        ZipfTable { cdf }
    }

    /// First rank whose cumulative probability reaches `u`.
    pub fn sample(&self, u: f64) -> u64 {
        let idx = self.cdf.partition_point(|&c| c < u);
        (idx.min(self.cdf.len() - 1) + 1) as u64
    }
}

/// Per-connection key source.
#[derive(Debug)]
pub struct KeyGen {
    dist: KeyDist,
    zipf: Option<Arc<ZipfTable>>,
    /// Next key the sequential SET walk hands out.
    set_cursor: u64,
    /// Highest key this connection has SET so far.
    set_max: u64,
    get_cursor: u64,
}

impl KeyGen {
    /// `zipf` must be provided iff the distribution is zipfian.
    pub fn new(dist: KeyDist, zipf: Option<Arc<ZipfTable>>) -> KeyGen {
        debug_assert_eq!(dist == KeyDist::Zipfian, zipf.is_some());
        KeyGen {
            dist,
            zipf,
            set_cursor: MIN_KEY,
            set_max: 0,
            get_cursor: MIN_KEY,
        }
    }

    pub fn next_set_key(&mut self, rng: &mut StdRng) -> u64 {
        match self.dist {
            KeyDist::Uniform => rng.gen_range(MIN_KEY..=MAX_KEY),
            KeyDist::Zipfian => self.zipf.as_ref().unwrap().sample(rng.gen::<f64>()),
            KeyDist::Sequential => {
                let key = self.set_cursor;
                self.set_cursor = key % MAX_KEY + 1;
                self.set_max = self.set_max.max(key);
                key
            }
        }
    }

    pub fn next_get_key(&mut self, rng: &mut StdRng) -> u64 {
        match self.dist {
            KeyDist::Uniform => rng.gen_range(MIN_KEY..=MAX_KEY),
            KeyDist::Zipfian => self.zipf.as_ref().unwrap().sample(rng.gen::<f64>()),
            KeyDist::Sequential => {
                // nothing SET yet: fall back to the lowest key
                if self.set_max == 0 {
                    return MIN_KEY;
                }
                let key = self.get_cursor.min(self.set_max);
                self.get_cursor = key % self.set_max + 1;
                key
            }
        }
    }
}
