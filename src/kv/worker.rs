//! Per-worker readiness loop.
//!
//! Each worker owns its connections and multiplexes them over one epoll
//! instance with a zero timeout, so the loop never blocks: readiness
//! events finish connects and drain responses, then every live connection
//! gets a chance to issue requests while its window and token bucket
//! permit. A connection whose response stream turns to garbage is
//! abandoned; a failed connect kills the run.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use log::warn;
use rand::rngs::StdRng;

use super::conn::{Connection, Phase};
use crate::measure::Histogram;
use crate::time::monotonic_us;

const MAX_EVENTS: usize = 64;

struct Epoll {
    fd: libc::c_int,
}

impl Epoll {
    fn new() -> Result<Epoll> {
        let fd = unsafe { libc::epoll_create1(0) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| "epoll_create1".to_string());
        }
        Ok(Epoll { fd })
    }

    fn add(&self, fd: libc::c_int, index: usize, events: u32) -> Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: index as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if ret != 0 {
            bail!("epoll_ctl add: {}", std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn modify(&self, fd: libc::c_int, index: usize, events: u32) -> Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: index as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        if ret != 0 {
            bail!("epoll_ctl mod: {}", std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn remove(&self, fd: libc::c_int) {
        unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
    }

    /// Zero-timeout poll.
    fn wait(&self, events: &mut [libc::epoll_event]) -> usize {
        let n = unsafe {
            libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as libc::c_int, 0)
        };
        n.max(0) as usize
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Drive `conns` until the quit flag flips.
pub fn run_worker(
    mut conns: Vec<Connection>,
    hist: &Histogram,
    rng: &mut StdRng,
    quit: &AtomicBool,
) -> Result<()> {
    let epoll = Epoll::new()?;
    for (i, conn) in conns.iter().enumerate() {
        let interest = if conn.phase == Phase::Connecting {
            libc::EPOLLIN | libc::EPOLLOUT
        } else {
            libc::EPOLLIN
        };
        epoll.add(conn.fd(), i, interest as u32)?;
    }

    let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

    while !quit.load(Ordering::Relaxed) {
        let n = epoll.wait(&mut events);
        for ev in &events[..n] {
            let idx = ev.u64 as usize;
            let conn = &mut conns[idx];

            let connect_done =
                ev.events & (libc::EPOLLOUT | libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
            if conn.phase == Phase::Connecting && connect_done {
                // a connect that cannot complete is fatal to the run
                conn.finish_connect()?;
                // established: from here on only readability matters
                epoll.modify(conn.fd(), idx, libc::EPOLLIN as u32)?;
            }

            let readable =
                ev.events & (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
            if readable && conn.phase == Phase::Connected {
                if let Err(err) = conn.on_readable(hist) {
                    // decode errors abandon the connection, not the run
                    warn!("abandoning connection {idx}: {err}");
                    epoll.remove(conn.fd());
                    conn.phase = Phase::Disconnected;
                }
            }
        }

        let now = monotonic_us();
        for (idx, conn) in conns.iter_mut().enumerate() {
            if conn.phase != Phase::Connected {
                continue;
            }
            if let Err(err) = conn.pump(rng, now) {
                warn!("abandoning connection {idx}: {err}");
                epoll.remove(conn.fd());
                conn.phase = Phase::Disconnected;
            }
        }
    }

    Ok(())
}
