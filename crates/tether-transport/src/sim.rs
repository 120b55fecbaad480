//! # Simulated Network
//!
//! An in-memory datagram network for deterministic tests. Every socket bound
//! on a [`SimNetwork`] shares one mock clock and one seeded RNG, so a run is
//! reproducible from its seed.
//!
//! Waiting on a [`SimSocket`] never sleeps: it advances the shared clock to
//! the next delivery (or by the full timeout), which lets a test drive
//! several hosts from a single thread.
//!
//! Impairments follow `tc netem` terminology: delay with jitter, random
//! loss, duplication and reordering. Individual sources can be blackholed
//! and a drop filter can discard specific datagrams.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use quanta::{Clock, Mock};
use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;

use crate::socket::Socket;

/// Netem-style impairment applied to every datagram on the network.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImpairmentConfig {
    pub delay_ms: u32,
    /// Uniform extra delay in `[0, jitter_ms]`.
    pub jitter_ms: u32,
    pub loss_percent: f32,
    pub duplicate_percent: f32,
    /// Share of datagrams held back past their successors.
    pub reorder_percent: f32,
}

/// Counters for everything that crossed the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
}

/// Return `true` to drop a datagram travelling `from` → `to`.
pub type DropFilter = Box<dyn FnMut(SocketAddr, SocketAddr, &[u8]) -> bool + Send>;

struct InFlight {
    deliver_at: Duration,
    order: u64,
    from: SocketAddr,
    data: Vec<u8>,
}

impl PartialEq for InFlight {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for InFlight {}

impl PartialOrd for InFlight {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InFlight {
    // Min-heap on (deliver_at, order).
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deliver_at, other.order).cmp(&(self.deliver_at, self.order))
    }
}

struct Inner {
    clock: Clock,
    mock: Arc<Mock>,
    now: Duration,
    rng: StdRng,
    impairment: ImpairmentConfig,
    blocked: HashSet<SocketAddr>,
    drop_filter: Option<DropFilter>,
    queues: HashMap<SocketAddr, BinaryHeap<InFlight>>,
    next_order: u64,
    next_port: u16,
    stats: SimStats,
}

impl Inner {
    fn advance(&mut self, by: Duration) {
        self.now += by;
        self.mock.increment(by);
    }

    fn roll(&mut self, percent: f32) -> bool {
        percent > 0.0 && self.rng.random::<f32>() * 100.0 < percent
    }

    fn transit_delay(&mut self) -> Duration {
        let mut delay = self.impairment.delay_ms;
        if self.impairment.jitter_ms > 0 {
            delay += self.rng.random_range(0..=self.impairment.jitter_ms);
        }
        if self.roll(self.impairment.reorder_percent) {
            let hold = self.impairment.delay_ms.max(1);
            delay += hold + self.rng.random_range(0..=hold);
        }
        Duration::from_millis(delay as u64)
    }

    fn enqueue(&mut self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
        let deliver_at = self.now + self.transit_delay();
        let order = self.next_order;
        self.next_order += 1;
        if let Some(queue) = self.queues.get_mut(&to) {
            queue.push(InFlight {
                deliver_at,
                order,
                from,
                data: data.to_vec(),
            });
        } else {
            self.stats.dropped += 1;
        }
    }

    fn next_delivery(&self, addr: SocketAddr) -> Option<Duration> {
        self.queues.get(&addr)?.peek().map(|d| d.deliver_at)
    }
}

// ─── Network ────────────────────────────────────────────────────────────────

/// Shared handle to an in-memory network.
#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<Mutex<Inner>>,
}

impl SimNetwork {
    pub fn new(seed: u64) -> Self {
        let (clock, mock) = Clock::mock();
        SimNetwork {
            inner: Arc::new(Mutex::new(Inner {
                clock,
                mock,
                now: Duration::ZERO,
                rng: StdRng::seed_from_u64(seed),
                impairment: ImpairmentConfig::default(),
                blocked: HashSet::new(),
                drop_filter: None,
                queues: HashMap::new(),
                next_order: 0,
                next_port: 40000,
                stats: SimStats::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The mock clock every host on this network should be built with.
    pub fn clock(&self) -> Clock {
        self.lock().clock.clone()
    }

    /// Simulated time elapsed since the network was created.
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    pub fn advance(&self, by: Duration) {
        self.lock().advance(by);
    }

    /// Bind a socket at `addr`. Port 0 picks a free port.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<SimSocket> {
        let mut inner = self.lock();
        let mut addr = addr;
        if addr.port() == 0 {
            loop {
                addr.set_port(inner.next_port);
                inner.next_port = inner.next_port.wrapping_add(1).max(1024);
                if !inner.queues.contains_key(&addr) {
                    break;
                }
            }
        }
        if inner.queues.contains_key(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} already bound"),
            ));
        }
        inner.queues.insert(addr, BinaryHeap::new());
        Ok(SimSocket {
            addr,
            network: self.clone(),
        })
    }

    pub fn set_impairment(&self, impairment: ImpairmentConfig) {
        self.lock().impairment = impairment;
    }

    /// Silently drop everything sent from `addr` while `blocked`.
    pub fn set_blocked(&self, addr: SocketAddr, blocked: bool) {
        let mut inner = self.lock();
        if blocked {
            inner.blocked.insert(addr);
        } else {
            inner.blocked.remove(&addr);
        }
    }

    pub fn set_drop_filter(&self, filter: Option<DropFilter>) {
        self.lock().drop_filter = filter;
    }

    pub fn stats(&self) -> SimStats {
        self.lock().stats
    }
}

// ─── Socket ─────────────────────────────────────────────────────────────────

/// One endpoint on a [`SimNetwork`]. Unbinds on drop.
pub struct SimSocket {
    addr: SocketAddr,
    network: SimNetwork,
}

impl Socket for SimSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    fn send_to(&mut self, data: &[u8], to: SocketAddr) -> io::Result<usize> {
        let mut inner = self.network.lock();
        inner.stats.sent += 1;

        let filtered = match inner.drop_filter.as_mut() {
            Some(filter) => filter(self.addr, to, data),
            None => false,
        };
        let lost = inner.impairment.loss_percent > 0.0 && {
            let percent = inner.impairment.loss_percent;
            inner.roll(percent)
        };
        if inner.blocked.contains(&self.addr) || filtered || lost {
            inner.stats.dropped += 1;
            return Ok(data.len());
        }

        inner.enqueue(self.addr, to, data);
        let duplicate = inner.impairment.duplicate_percent;
        if inner.roll(duplicate) {
            inner.stats.duplicated += 1;
            inner.enqueue(self.addr, to, data);
        }
        Ok(data.len())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut inner = self.network.lock();
        let now = inner.now;
        let Some(queue) = inner.queues.get_mut(&self.addr) else {
            return Ok(None);
        };
        match queue.peek() {
            Some(next) if next.deliver_at <= now => {}
            _ => return Ok(None),
        }
        let Some(datagram) = queue.pop() else {
            return Ok(None);
        };
        let n = datagram.data.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram.data[..n]);
        inner.stats.delivered += 1;
        Ok(Some((n, datagram.from)))
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<bool> {
        let mut inner = self.network.lock();
        let now = inner.now;
        match inner.next_delivery(self.addr) {
            Some(at) if at <= now => Ok(true),
            Some(at) if at <= now + timeout => {
                inner.advance(at - now);
                Ok(true)
            }
            _ => {
                inner.advance(timeout);
                Ok(false)
            }
        }
    }
}

impl Drop for SimSocket {
    fn drop(&mut self) {
        self.network.lock().queues.remove(&self.addr);
    }
}
