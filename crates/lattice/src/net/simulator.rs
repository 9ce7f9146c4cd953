//! Deterministic lossy-link simulation for tests and local soak runs.
//!
//! A [`SimulatedNetwork`] hands out [`SimSocket`] endpoints that implement
//! [`Transport`]; each endpoint's outbound traffic is dropped or delayed per
//! its [`LinkConditions`]. Time is driven explicitly so runs replay exactly.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use super::endpoint::Transport;

/// Impairments applied to an endpoint's outgoing packets.
#[derive(Debug, Clone, Default)]
pub struct LinkConditions {
    pub enabled: bool,
    /// Drop chance in `[0, 100]`.
    pub loss_percent: f32,
    pub min_latency_ms: u32,
    pub max_latency_ms: u32,
    pub jitter_ms: u32,
}

impl LinkConditions {
    pub fn lossy(loss_percent: f32) -> Self {
        Self {
            enabled: true,
            loss_percent,
            ..Self::default()
        }
    }
}

struct Delivery {
    deliver_at: f64,
    data: Vec<u8>,
    from: SocketAddr,
    // Tiebreaker so equal-timestamp packets keep send order.
    order: u64,
}

impl PartialEq for Delivery {
    fn eq(&self, other: &Self) -> bool {
        self.deliver_at == other.deliver_at && self.order == other.order
    }
}

impl Eq for Delivery {}

impl PartialOrd for Delivery {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delivery {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap.
        other
            .deliver_at
            .total_cmp(&self.deliver_at)
            .then(other.order.cmp(&self.order))
    }
}

/// Small deterministic generator (xorshift64*) so loss patterns replay.
#[derive(Debug)]
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }
}

struct Inner {
    now: f64,
    rng: Rng,
    order: u64,
    inboxes: HashMap<SocketAddr, BinaryHeap<Delivery>>,
    conditions: HashMap<SocketAddr, LinkConditions>,
}

/// Shared single-threaded network fabric.
#[derive(Clone)]
pub struct SimulatedNetwork {
    inner: Rc<RefCell<Inner>>,
}

impl SimulatedNetwork {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                now: 0.0,
                rng: Rng::new(seed),
                order: 0,
                inboxes: HashMap::new(),
                conditions: HashMap::new(),
            })),
        }
    }

    /// Register an endpoint. `conditions` shape this endpoint's sends.
    pub fn endpoint(&self, addr: SocketAddr, conditions: LinkConditions) -> SimSocket {
        let mut inner = self.inner.borrow_mut();
        inner.inboxes.entry(addr).or_default();
        inner.conditions.insert(addr, conditions);
        SimSocket {
            network: self.clone(),
            addr,
        }
    }

    /// Advance the fabric clock; queued packets whose delivery time has
    /// passed become receivable.
    pub fn set_time(&self, now: f64) {
        self.inner.borrow_mut().now = now;
    }

    /// Swap an endpoint's outbound impairments mid-run (e.g. to simulate
    /// a blackout window).
    pub fn set_conditions(&self, addr: SocketAddr, conditions: LinkConditions) {
        self.inner.borrow_mut().conditions.insert(addr, conditions);
    }
}

/// One endpoint on a [`SimulatedNetwork`].
pub struct SimSocket {
    network: SimulatedNetwork,
    addr: SocketAddr,
}

impl Transport for SimSocket {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let mut inner = self.network.inner.borrow_mut();
        let conditions = inner.conditions.get(&self.addr).cloned().unwrap_or_default();

        if conditions.enabled
            && conditions.loss_percent > 0.0
            && inner.rng.next_f32() * 100.0 < conditions.loss_percent
        {
            return Ok(data.len()); // swallowed by the link
        }

        let delay_ms = if conditions.enabled && conditions.max_latency_ms > 0 {
            let range = conditions
                .max_latency_ms
                .saturating_sub(conditions.min_latency_ms);
            let jitter = if conditions.jitter_ms > 0 {
                (inner.rng.next_f32() * conditions.jitter_ms as f32) as u32
            } else {
                0
            };
            conditions.min_latency_ms + (inner.rng.next_f32() * range as f32) as u32 + jitter
        } else {
            0
        };

        let deliver_at = inner.now + f64::from(delay_ms) / 1000.0;
        let order = inner.order;
        inner.order += 1;
        let from = self.addr;
        let delivery = Delivery {
            deliver_at,
            data: data.to_vec(),
            from,
            order,
        };
        inner
            .inboxes
            .entry(addr)
            .or_default()
            .push(delivery);
        Ok(data.len())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut inner = self.network.inner.borrow_mut();
        let now = inner.now;
        let Some(inbox) = inner.inboxes.get_mut(&self.addr) else {
            return Ok(None);
        };
        match inbox.peek() {
            Some(delivery) if delivery.deliver_at <= now => {
                let delivery = inbox.pop().unwrap();
                let len = delivery.data.len().min(buf.len());
                buf[..len].copy_from_slice(&delivery.data[..len]);
                Ok(Some((len, delivery.from)))
            }
            _ => Ok(None),
        }
    }
}
