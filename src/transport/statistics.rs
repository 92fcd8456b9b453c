//! Traffic counters for peers and hosts.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::compression::CompressionStats;
use crate::core::HostTimestamp;

/// Per-peer traffic counters. Owned by the peer and copied out on request.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeerStatistics {
    /// Host time of the last received packet.
    pub packet_receive_ticks: HostTimestamp,
    /// Bytes of received packets.
    pub packet_receive_bytes: u64,
    /// Received packets.
    pub packet_receive_count: u64,
    /// Host time of the last sent packet.
    pub packet_send_ticks: HostTimestamp,
    /// Bytes of sent packets.
    pub packet_send_bytes: u64,
    /// Sent packets.
    pub packet_send_count: u64,

    /// Bytes of received messages.
    pub message_receive_bytes: u64,
    /// Sequenced messages that never arrived.
    pub message_receive_lost: u64,
    /// Received messages.
    pub message_receive_total: u64,
    /// Received reliable messages.
    pub message_receive_reliable: u64,
    /// Received unreliable messages.
    pub message_receive_unreliable: u64,
    /// Received duplicates that were dropped.
    pub message_receive_duplicated: u64,
    /// Received acknowledgements.
    pub message_receive_acknowledge: u64,
    /// Received pings.
    pub message_receive_ping: u64,

    /// Bytes of sent messages.
    pub message_send_bytes: u64,
    /// Sent messages, counting first sends only.
    pub message_send_total: u64,
    /// Sent reliable messages.
    pub message_send_reliable: u64,
    /// Sent unreliable messages.
    pub message_send_unreliable: u64,
    /// Resends of reliable messages.
    pub message_send_duplicated: u64,
    /// Sent acknowledgements.
    pub message_send_acknowledge: u64,
    /// Sent pings.
    pub message_send_ping: u64,

    /// Compression decisions on outgoing bodies.
    pub compression: CompressionStats,
}

impl PeerStatistics {
    /// Record a received datagram.
    pub fn record_packet_received(&mut self, now: HostTimestamp, bytes: usize) {
        self.packet_receive_ticks = now;
        self.packet_receive_bytes += bytes as u64;
        self.packet_receive_count += 1;
    }

    /// Record a sent datagram.
    pub fn record_packet_sent(&mut self, now: HostTimestamp, bytes: usize) {
        self.packet_send_ticks = now;
        self.packet_send_bytes += bytes as u64;
        self.packet_send_count += 1;
    }

    /// Fraction of sequenced messages lost, zero without traffic.
    pub fn loss_ratio(&self) -> f64 {
        let expected = self.message_receive_total + self.message_receive_lost;
        if expected == 0 {
            0.0
        } else {
            self.message_receive_lost as f64 / expected as f64
        }
    }

    /// Reset every counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Host-wide socket counters, updated concurrently by the receive threads.
#[derive(Debug, Default)]
pub struct HostStatistics {
    socket_send_ticks: AtomicI64,
    socket_send_bytes: AtomicU64,
    socket_send_count: AtomicU64,
    socket_receive_ticks: AtomicI64,
    socket_receive_bytes: AtomicU64,
    socket_receive_count: AtomicU64,
}

/// Point-in-time copy of [`HostStatistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStatisticsSnapshot {
    /// Host time of the last datagram sent.
    pub socket_send_ticks: HostTimestamp,
    /// Bytes sent.
    pub socket_send_bytes: u64,
    /// Datagrams sent.
    pub socket_send_count: u64,
    /// Host time of the last datagram received.
    pub socket_receive_ticks: HostTimestamp,
    /// Bytes received.
    pub socket_receive_bytes: u64,
    /// Datagrams received.
    pub socket_receive_count: u64,
}

impl HostStatistics {
    /// Record a datagram handed to the socket.
    pub fn record_send(&self, now: HostTimestamp, bytes: usize) {
        self.socket_send_ticks.store(now.ticks(), Ordering::Relaxed);
        self.socket_send_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.socket_send_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a datagram read from the socket.
    pub fn record_receive(&self, now: HostTimestamp, bytes: usize) {
        self.socket_receive_ticks.store(now.ticks(), Ordering::Relaxed);
        self.socket_receive_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.socket_receive_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> HostStatisticsSnapshot {
        HostStatisticsSnapshot {
            socket_send_ticks: HostTimestamp(self.socket_send_ticks.load(Ordering::Relaxed)),
            socket_send_bytes: self.socket_send_bytes.load(Ordering::Relaxed),
            socket_send_count: self.socket_send_count.load(Ordering::Relaxed),
            socket_receive_ticks: HostTimestamp(self.socket_receive_ticks.load(Ordering::Relaxed)),
            socket_receive_bytes: self.socket_receive_bytes.load(Ordering::Relaxed),
            socket_receive_count: self.socket_receive_count.load(Ordering::Relaxed),
        }
    }

    /// Reset every counter.
    pub fn reset(&self) {
        for counter in [
            &self.socket_send_bytes,
            &self.socket_send_count,
            &self.socket_receive_bytes,
            &self.socket_receive_count,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.socket_send_ticks.store(0, Ordering::Relaxed);
        self.socket_receive_ticks.store(0, Ordering::Relaxed);
    }
}
