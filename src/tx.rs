//! Deadline-paced transmit pipeline.
//!
//! One core owns the TX queue and walks the pre-built schedule slot by
//! slot. A slot whose deadline has already slipped by more than 5 µs is
//! skipped and counted, and its deadline advanced by one extra microsecond;
//! there is no burst catch-up. The timestamp written into the payload is
//! the *scheduled* send instant, so recorded round-trips measure from the
//! moment the request was supposed to leave, queueing delay included.

use std::sync::atomic::Ordering;

use crate::config::NetConfig;
use crate::flow::{FlowShared, FlowTx};
use crate::packet::{build_data, refresh_ack};
use crate::port::TxQueue;
use crate::run::RunCtx;
use crate::schedule::Schedule;
use crate::time::{busy_wait_until, rdtsc};
use crate::wire::payload;

/// Slack beyond the deadline before a slot is abandoned.
const SLIP_US: u64 = 5;

/// Drive the whole schedule. Returns the number of frames actually handed
/// to the port.
pub fn run_tx(
    queue: &mut dyn TxQueue,
    sched: &Schedule,
    flows: &mut [FlowTx],
    shared: &[FlowShared],
    net: &NetConfig,
    ctx: &RunCtx,
) -> u64 {
    let tpus = ctx.ticks_per_us;
    let payload_size = ctx.payload_size() as u16;
    let total = sched.len();
    let mut sent = 0u64;

    if total == 0 {
        return 0;
    }
    let mut next_tsc = rdtsc() + sched.gaps[0];

    for i in 0..total {
        if ctx.quit.load(Ordering::Relaxed) {
            // the rest of the schedule is never transmitted; account for it
            ctx.never_sent
                .fetch_add((total - i) as u64, Ordering::Relaxed);
            return sent;
        }

        // unable to keep up with the requested rate
        if rdtsc() > next_tsc + SLIP_US * tpus {
            ctx.never_sent.fetch_add(1, Ordering::Relaxed);
            next_tsc += sched.gaps[i] + tpus;
            continue;
        }

        let fi = sched.flow_indexes[i] as usize;
        let mut frame = build_data(&mut flows[fi], net, ctx.frame_size);

        let work = &sched.work[i];
        payload::set(&mut frame.data, payload::WORD_TX_TSC, next_tsc);
        payload::set(&mut frame.data, payload::WORD_FLOW_ID, fi as u64);
        payload::set(&mut frame.data, payload::WORD_ITERATIONS, work.iterations);
        payload::set(&mut frame.data, payload::WORD_RANDOMNESS, work.randomness);

        // receive-window gate: wait until the peer can take the payload
        while shared[fi].rwin() < payload_size {
            if ctx.quit.load(Ordering::Relaxed) {
                ctx.never_sent
                    .fetch_add((total - i) as u64, Ordering::Relaxed);
                return sent;
            }
            core::hint::spin_loop();
        }

        busy_wait_until(next_tsc);

        // the freshest acknowledgement, stamped last
        refresh_ack(&mut frame, shared[fi].next_ack());
        queue.tx_burst(vec![frame]);
        sent += 1;

        next_tsc += sched.gaps[i];
    }

    sent
}
