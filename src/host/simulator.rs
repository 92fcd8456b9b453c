//! Network condition simulator.
//!
//! Drops datagrams with a configured probability and delays the rest by
//! `latency ± jitter`. Delayed datagrams wait in a deadline queue that the
//! host drains on every tick.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::SimulatorConfig;

/// Direction of a simulated datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Read from the socket.
    Incoming,
    /// About to be written to the socket.
    Outgoing,
}

/// What to do with a datagram right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Handle it immediately.
    Pass,
    /// Lost.
    Drop,
    /// Queued; it comes back from [`Simulator::due`].
    Delayed,
}

/// A datagram released by the simulator.
#[derive(Debug)]
pub struct Delayed {
    /// Direction.
    pub flow: Flow,
    /// Source (incoming) or destination (outgoing).
    pub remote: SocketAddr,
    /// Datagram bytes.
    pub data: Vec<u8>,
    deadline: Instant,
    order: u64,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.order).cmp(&(other.deadline, other.order))
    }
}

/// Simulated loss, latency and jitter.
#[derive(Debug)]
pub struct Simulator {
    config: SimulatorConfig,
    rng: StdRng,
    queue: BinaryHeap<Reverse<Delayed>>,
    order: u64,
}

impl Simulator {
    /// Create a simulator; a configured seed makes it deterministic.
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = config
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Self {
            config,
            rng,
            queue: BinaryHeap::new(),
            order: 0,
        }
    }

    /// Judge a datagram read from the socket.
    pub fn incoming(&mut self, now: Instant, remote: SocketAddr, data: &[u8]) -> Verdict {
        let (loss, latency, jitter) = (
            self.config.incoming_loss,
            self.config.incoming_latency,
            self.config.incoming_jitter,
        );
        self.judge(now, Flow::Incoming, remote, data, loss, latency, jitter)
    }

    /// Judge a datagram about to be sent.
    pub fn outgoing(&mut self, now: Instant, remote: SocketAddr, data: &[u8]) -> Verdict {
        let (loss, latency, jitter) = (
            self.config.outgoing_loss,
            self.config.outgoing_latency,
            self.config.outgoing_jitter,
        );
        self.judge(now, Flow::Outgoing, remote, data, loss, latency, jitter)
    }

    #[allow(clippy::too_many_arguments)]
    fn judge(
        &mut self,
        now: Instant,
        flow: Flow,
        remote: SocketAddr,
        data: &[u8],
        loss: f32,
        latency: Duration,
        jitter: Duration,
    ) -> Verdict {
        if loss > 0.0 && self.rng.r#gen::<f32>() < loss {
            tracing::trace!(?flow, %remote, len = data.len(), "simulator dropped datagram");
            return Verdict::Drop;
        }

        let offset = if jitter.is_zero() {
            0.0
        } else {
            self.rng.gen_range(-1.0f64..=1.0) * jitter.as_secs_f64()
        };
        let delay = (latency.as_secs_f64() + offset).max(0.0);
        if delay == 0.0 {
            return Verdict::Pass;
        }

        self.order += 1;
        self.queue.push(Reverse(Delayed {
            flow,
            remote,
            data: data.to_vec(),
            deadline: now + Duration::from_secs_f64(delay),
            order: self.order,
        }));
        Verdict::Delayed
    }

    /// Take every datagram whose delay has elapsed, earliest first.
    pub fn due(&mut self, now: Instant) -> Vec<Delayed> {
        let mut due = Vec::new();
        while self
            .queue
            .peek()
            .is_some_and(|Reverse(delayed)| delayed.deadline <= now)
        {
            if let Some(Reverse(delayed)) = self.queue.pop() {
                due.push(delayed);
            }
        }
        due
    }

    /// Number of datagrams waiting.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}
