//! Monotonic time sources.
//!
//! The packet pipelines run entirely on the processor timestamp counter:
//! `rdtsc()` is read on the hot path and converted with a cycles-per-µs
//! constant calibrated once against the OS clock before any worker starts.
//! The sockets pipeline only needs microsecond resolution and uses a
//! process-relative monotonic clock instead.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Read the timestamp counter.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Nanosecond fallback for targets without a TSC; calibration then yields
/// roughly 1000 "ticks" per microsecond.
#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn rdtsc() -> u64 {
    epoch().elapsed().as_nanos() as u64
}

fn epoch() -> &'static Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now)
}

/// Microseconds since the first call in this process.
#[inline]
pub fn monotonic_us() -> u64 {
    epoch().elapsed().as_micros() as u64
}

/// Measure how many timestamp-counter ticks elapse per microsecond.
///
/// Called exactly once, before the workers are spawned; the result is then
/// carried read-only in the run context.
pub fn calibrate_ticks_per_us() -> u64 {
    let _ = epoch();
    let t0 = rdtsc();
    let w0 = Instant::now();
    std::thread::sleep(Duration::from_millis(100));
    let ticks = rdtsc().wrapping_sub(t0);
    let us = w0.elapsed().as_micros() as u64;
    (ticks / us.max(1)).max(1)
}

/// Spin until the timestamp counter reaches `deadline`.
#[inline]
pub fn busy_wait_until(deadline: u64) {
    while rdtsc() < deadline {
        core::hint::spin_loop();
    }
}
