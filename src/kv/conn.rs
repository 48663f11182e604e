//! One non-blocking connection to the key-value store.
//!
//! The connection owns everything its traffic needs: the socket, the
//! write buffer and its cursor, the incremental response parser, the
//! in-flight window with its queue of transmit timestamps, the token
//! bucket, and the key/ratio generators. The worker's event loop only
//! decides *when* to call in; all protocol state lives here.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;

use crate::keygen::KeyGen;
use crate::limiter::TokenBucket;
use crate::measure::Histogram;
use crate::resp;
use crate::time::monotonic_us;
use crate::wire::Ipv4Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
}

/// Static per-connection knobs, shared by every connection of a run.
#[derive(Debug, Clone)]
pub struct ConnOpts {
    pub max_pending: usize,
    pub rate: u64,
    pub set_ratio: u32,
    pub get_ratio: u32,
    pub vsize: usize,
}

pub struct Connection {
    fd: RawFd,
    pub phase: Phase,
    wbuf: Vec<u8>,
    wpos: usize,
    parser: resp::Parser,
    /// Transmit timestamp of every outstanding request, oldest first.
    /// The server answers in order, so a completed response always pairs
    /// with the front entry; the queue length is the pending count.
    tx_ts: VecDeque<u64>,
    bucket: TokenBucket,
    keys: KeyGen,
    ratio_counter: u32,
    opts: ConnOpts,
    value: Vec<u8>,
    /// Completed requests, read by the orchestrator's throughput sampler.
    requests: Arc<AtomicU64>,
}

impl Connection {
    /// Open a non-blocking socket and start the connect. The connection
    /// comes back in `Connecting` (or already `Connected` on a loopback
    /// fast path) and is finished off by the event loop.
    pub fn connect(
        addr: Ipv4Address,
        port: u16,
        opts: ConnOpts,
        keys: KeyGen,
        requests: Arc<AtomicU64>,
    ) -> Result<Connection> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
            )
        };
        if fd < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| "socket creation failed".to_string());
        }

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(addr.octets()),
            },
            sin_zero: [0; 8],
        };
        let ret = unsafe {
            libc::connect(
                fd,
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        let phase = if ret == 0 {
            Phase::Connected
        } else {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                unsafe { libc::close(fd) };
                return Err(err).with_context(|| format!("connection to {addr}:{port} failed"));
            }
            Phase::Connecting
        };

        let now = monotonic_us();
        Ok(Connection {
            fd,
            phase,
            wbuf: Vec::with_capacity(4096),
            wpos: 0,
            parser: resp::Parser::new(),
            tx_ts: VecDeque::with_capacity(opts.max_pending),
            bucket: TokenBucket::new(opts.rate, now),
            keys,
            ratio_counter: 0,
            value: vec![b'a'; opts.vsize],
            opts,
            requests,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn pending(&self) -> usize {
        self.tx_ts.len()
    }

    /// The socket became writable while connecting: query the socket-level
    /// error and either transition to Connected or fail.
    pub fn finish_connect(&mut self) -> Result<()> {
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            bail!("getsockopt failed: {}", std::io::Error::last_os_error());
        }
        if err != 0 {
            bail!(
                "connection failed: {}",
                std::io::Error::from_raw_os_error(err)
            );
        }
        self.phase = Phase::Connected;
        Ok(())
    }

    /// Drain everything the socket has, feeding the parser. Each completed
    /// response closes one pending slot and lands in the histogram.
    pub fn on_readable(&mut self, hist: &Histogram) -> Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            let n = unsafe {
                libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EAGAIN)
                    || err.raw_os_error() == Some(libc::EWOULDBLOCK)
                {
                    return Ok(());
                }
                bail!("read failed: {err}");
            }
            if n == 0 {
                bail!("peer closed the connection");
            }

            let mut data = &buf[..n as usize];
            while !data.is_empty() {
                let feed = self.parser.feed(data);
                if feed.failed {
                    bail!("protocol error in response stream");
                }
                if feed.completed {
                    self.complete_one(hist);
                }
                data = &data[feed.consumed..];
            }
        }
    }

    fn complete_one(&mut self, hist: &Histogram) {
        // responses arrive in request order: pair with the oldest
        // outstanding timestamp
        let Some(tx_ts) = self.tx_ts.pop_front() else {
            // a response nothing is waiting for; the server is confused
            return;
        };
        let latency = monotonic_us().saturating_sub(tx_ts);
        hist.record_us(latency);
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Issue as many requests as the window and the token bucket allow,
    /// then push the write buffer out.
    pub fn pump(&mut self, rng: &mut StdRng, now_us: u64) -> Result<()> {
        self.flush()?;
        while self.tx_ts.len() < self.opts.max_pending && self.bucket.try_acquire(now_us) {
            self.tx_ts.push_back(now_us);
            self.encode_next(rng);
            self.flush()?;
        }
        Ok(())
    }

    /// SET or GET according to the ratio counter, key per the distribution.
    fn encode_next(&mut self, rng: &mut StdRng) {
        let total = self.opts.set_ratio + self.opts.get_ratio;
        let is_set = self.ratio_counter < self.opts.set_ratio;
        self.ratio_counter = (self.ratio_counter + 1) % total;

        if is_set {
            let key = self.keys.next_set_key(rng).to_string();
            resp::encode_set(&mut self.wbuf, &key, &self.value);
        } else {
            let key = self.keys.next_get_key(rng).to_string();
            resp::encode_get(&mut self.wbuf, &key);
        }
    }

    /// Write as much buffered request data as the socket accepts.
    fn flush(&mut self) -> Result<()> {
        while self.wpos < self.wbuf.len() {
            let n = unsafe {
                libc::write(
                    self.fd,
                    self.wbuf[self.wpos..].as_ptr() as *const libc::c_void,
                    self.wbuf.len() - self.wpos,
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EAGAIN)
                    || err.raw_os_error() == Some(libc::EWOULDBLOCK)
                {
                    return Ok(());
                }
                bail!("write failed: {err}");
            }
            self.wpos += n as usize;
        }
        self.wbuf.clear();
        self.wpos = 0;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keygen::KeyDist;
    use rand::SeedableRng;
    use std::io::Read;
    use std::net::TcpListener;

    fn opts() -> ConnOpts {
        ConnOpts {
            max_pending: 4,
            rate: 0,
            set_ratio: 1,
            get_ratio: 1,
            vsize: 8,
        }
    }

    #[test]
    fn connects_to_a_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut conn = Connection::connect(
            Ipv4Address::new(127, 0, 0, 1),
            port,
            opts(),
            KeyGen::new(KeyDist::Uniform, None),
            Arc::new(AtomicU64::new(0)),
        )
        .unwrap();
        let (_peer, _) = listener.accept().unwrap();

        if conn.phase == Phase::Connecting {
            // writable now that the accept happened
            std::thread::sleep(std::time::Duration::from_millis(10));
            conn.finish_connect().unwrap();
        }
        assert_eq!(conn.phase, Phase::Connected);
    }

    #[test]
    fn pump_respects_the_pending_window() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut conn = Connection::connect(
            Ipv4Address::new(127, 0, 0, 1),
            port,
            opts(),
            KeyGen::new(KeyDist::Sequential, None),
            Arc::new(AtomicU64::new(0)),
        )
        .unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        if conn.phase == Phase::Connecting {
            conn.finish_connect().unwrap();
        }

        let mut rng = StdRng::seed_from_u64(1);
        conn.pump(&mut rng, monotonic_us()).unwrap();
        // the window caps the number of in-flight requests
        assert_eq!(conn.pending(), 4);
        conn.pump(&mut rng, monotonic_us()).unwrap();
        assert_eq!(conn.pending(), 4);

        // the peer sees four complete commands, alternating SET/GET
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut seen = Vec::new();
        peer.set_read_timeout(Some(std::time::Duration::from_millis(200)))
            .unwrap();
        let mut chunk = [0u8; 4096];
        while let Ok(n) = peer.read(&mut chunk) {
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&chunk[..n]);
            let starts = seen
                .windows(3)
                .filter(|w| *w == &b"*3\r"[..] || *w == &b"*2\r"[..])
                .count();
            if starts >= 4 {
                break;
            }
        }
        let sets = seen.windows(3).filter(|w| *w == &b"*3\r"[..]).count();
        let gets = seen.windows(3).filter(|w| *w == &b"*2\r"[..]).count();
        assert_eq!(sets, 2);
        assert_eq!(gets, 2);
    }

    #[test]
    fn responses_close_pending_slots_and_feed_the_histogram() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let requests = Arc::new(AtomicU64::new(0));
        let mut conn = Connection::connect(
            Ipv4Address::new(127, 0, 0, 1),
            port,
            opts(),
            KeyGen::new(KeyDist::Uniform, None),
            requests.clone(),
        )
        .unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        if conn.phase == Phase::Connecting {
            conn.finish_connect().unwrap();
        }

        let mut rng = StdRng::seed_from_u64(2);
        conn.pump(&mut rng, monotonic_us()).unwrap();
        assert_eq!(conn.pending(), 4);

        // three ordinary replies and one nil
        use std::io::Write;
        peer.write_all(b"+OK\r\n$3\r\nabc\r\n$-1\r\n+OK\r\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let hist = Histogram::new();
        conn.on_readable(&hist).unwrap();
        assert_eq!(conn.pending(), 0);
        assert_eq!(hist.total(), 4);
        assert_eq!(requests.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn responses_consume_timestamps_oldest_first() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut two_deep = opts();
        two_deep.max_pending = 2;
        let mut conn = Connection::connect(
            Ipv4Address::new(127, 0, 0, 1),
            port,
            two_deep,
            KeyGen::new(KeyDist::Uniform, None),
            Arc::new(AtomicU64::new(0)),
        )
        .unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        if conn.phase == Phase::Connecting {
            conn.finish_connect().unwrap();
        }

        use std::io::Write;
        let hist = Histogram::new();
        let mut rng = StdRng::seed_from_u64(6);

        // two in flight, both stamped 100
        conn.pump(&mut rng, 100).unwrap();
        assert_eq!(conn.pending(), 2);

        // one response retires the older slot and opens room for a
        // request stamped 200
        peer.write_all(b"+OK\r\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        conn.on_readable(&hist).unwrap();
        assert_eq!(conn.pending(), 1);
        conn.pump(&mut rng, 200).unwrap();
        assert_eq!(
            conn.tx_ts.iter().copied().collect::<Vec<u64>>(),
            vec![100, 200]
        );

        // the next response pairs with the oldest timestamp, not the
        // newest
        peer.write_all(b"+OK\r\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        conn.on_readable(&hist).unwrap();
        assert_eq!(
            conn.tx_ts.iter().copied().collect::<Vec<u64>>(),
            vec![200]
        );
        assert_eq!(hist.total(), 2);
    }

    #[test]
    fn error_reply_poisons_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut conn = Connection::connect(
            Ipv4Address::new(127, 0, 0, 1),
            port,
            opts(),
            KeyGen::new(KeyDist::Uniform, None),
            Arc::new(AtomicU64::new(0)),
        )
        .unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        if conn.phase == Phase::Connecting {
            conn.finish_connect().unwrap();
        }

        use std::io::Write;
        peer.write_all(b"-ERR nope\r\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let hist = Histogram::new();
        assert!(conn.on_readable(&hist).is_err());
    }
}
