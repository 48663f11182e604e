//! Raw Ethernet port over an `AF_PACKET` socket.
//!
//! The commodity stand-in for a hardware port: frames go out and come in
//! unmodified, and the steering table runs in software on the receive
//! path. Kernel checksum offload does not apply here, so the target
//! server must tolerate zero TCP/IPv4 checksums (the bundled echo servers
//! do).

use std::ffi::CString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};

use super::{steer, Frame, PortCtl, PortStats, RawPort, RuleHandle, RxQueue, SteeringRule, TxQueue};

const ETH_P_ALL_BE: u16 = (libc::ETH_P_ALL as u16).to_be();

#[derive(Default)]
struct StatCells {
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    rx_errors: AtomicU64,
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    tx_errors: AtomicU64,
}

impl StatCells {
    fn snapshot(&self) -> PortStats {
        PortStats {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_errors: self.rx_errors.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.rx_packets.store(0, Ordering::Relaxed);
        self.rx_bytes.store(0, Ordering::Relaxed);
        self.rx_errors.store(0, Ordering::Relaxed);
        self.tx_packets.store(0, Ordering::Relaxed);
        self.tx_bytes.store(0, Ordering::Relaxed);
        self.tx_errors.store(0, Ordering::Relaxed);
    }
}

struct Shared {
    fd: libc::c_int,
    stats: StatCells,
    rules: Mutex<Vec<SteeringRule>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// A raw port bound to one network interface.
pub struct AfPacketPort {
    shared: Arc<Shared>,
}

impl AfPacketPort {
    /// Open a non-blocking packet socket bound to `ifname`.
    pub fn open(ifname: &str) -> Result<AfPacketPort> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                ETH_P_ALL_BE as libc::c_int,
            )
        };
        if fd < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| "cannot open the packet socket".to_string());
        }

        let name = CString::new(ifname).with_context(|| context!())?;
        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            unsafe { libc::close(fd) };
            bail!("no such interface: {ifname}");
        }

        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as libc::sa_family_t;
        sll.sll_protocol = ETH_P_ALL_BE;
        sll.sll_ifindex = ifindex as libc::c_int;
        let ret = unsafe {
            libc::bind(
                fd,
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err).with_context(|| format!("cannot bind to {ifname}"));
        }

        Ok(AfPacketPort {
            shared: Arc::new(Shared {
                fd,
                stats: StatCells::default(),
                rules: Mutex::new(Vec::new()),
            }),
        })
    }
}

fn do_tx(shared: &Shared, frames: Vec<Frame>) -> usize {
    let mut accepted = 0;
    for frame in frames {
        let n = unsafe {
            libc::send(
                shared.fd,
                frame.data.as_ptr() as *const libc::c_void,
                frame.data.len(),
                0,
            )
        };
        if n < 0 {
            shared.stats.tx_errors.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        shared.stats.tx_packets.fetch_add(1, Ordering::Relaxed);
        shared
            .stats
            .tx_bytes
            .fetch_add(frame.data.len() as u64, Ordering::Relaxed);
        accepted += 1;
    }
    accepted
}

fn do_rx(shared: &Shared, out: &mut Vec<Frame>, max: usize) -> usize {
    let rules = shared.rules.lock().unwrap();
    let mut buf = [0u8; 2048];
    let mut got = 0;
    while got < max {
        let mut from: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        let mut from_len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                shared.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut from as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                &mut from_len,
            )
        };
        if n < 0 {
            break;
        }
        // the packet socket also sees what we transmit; skip those
        if from.sll_pkttype == libc::PACKET_OUTGOING {
            continue;
        }
        let mut frame = Frame {
            data: buf[..n as usize].to_vec(),
            mark: None,
        };
        frame.mark = steer(&rules, &frame);
        shared.stats.rx_packets.fetch_add(1, Ordering::Relaxed);
        shared.stats.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);
        out.push(frame);
        got += 1;
    }
    got
}

impl RawPort for AfPacketPort {
    fn install_steering(&mut self, rule: &SteeringRule) -> Result<RuleHandle> {
        let mut rules = self.shared.rules.lock().unwrap();
        rules.push(*rule);
        Ok(RuleHandle(rules.len() - 1))
    }

    fn flush_steering(&mut self) {
        self.shared.rules.lock().unwrap().clear();
    }

    fn reset_stats(&mut self) {
        self.shared.stats.reset();
    }

    fn stats(&self) -> PortStats {
        self.shared.stats.snapshot()
    }

    fn tx_burst(&mut self, frames: Vec<Frame>) -> usize {
        do_tx(&self.shared, frames)
    }

    fn rx_burst(&mut self, out: &mut Vec<Frame>, max: usize) -> usize {
        do_rx(&self.shared, out, max)
    }

    fn split(self: Box<Self>) -> (Box<dyn TxQueue>, Box<dyn RxQueue>, Box<dyn PortCtl>) {
        (
            Box::new(AfPacketTx {
                shared: self.shared.clone(),
            }),
            Box::new(AfPacketRx {
                shared: self.shared.clone(),
            }),
            Box::new(AfPacketCtl {
                shared: self.shared,
            }),
        )
    }
}

pub struct AfPacketTx {
    shared: Arc<Shared>,
}

impl TxQueue for AfPacketTx {
    fn tx_burst(&mut self, frames: Vec<Frame>) -> usize {
        do_tx(&self.shared, frames)
    }
}

pub struct AfPacketRx {
    shared: Arc<Shared>,
}

impl RxQueue for AfPacketRx {
    fn rx_burst(&mut self, out: &mut Vec<Frame>, max: usize) -> usize {
        do_rx(&self.shared, out, max)
    }
}

pub struct AfPacketCtl {
    shared: Arc<Shared>,
}

impl PortCtl for AfPacketCtl {
    fn stats(&self) -> PortStats {
        self.shared.stats.snapshot()
    }
}
