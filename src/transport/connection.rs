//! Peer connection lifecycle.
//!
//! ```text
//!   connect()/accept()        accept/request ok         disconnect()/remote disconnect
//! ───────────────────▶ Connecting ─────────▶ Connected ─────────▶ Disconnecting
//!                          │                     │                      │
//!                          │ reject/timeout      │ timeout/bad sig      │ linger elapsed
//!                          ▼                     ▼                      ▼
//!                    Disconnected ◀──────────────┴──────────────────────┘
//! ```
//!
//! [`ConnectionState`] owns the timers driving these transitions; the peer
//! decides what to send when one fires.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::statistics::PeerStatistics;
use crate::core::PeerConfig;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// Handshake in progress.
    Connecting,
    /// Connection established, messages flow.
    Connected,
    /// Connection closing, waiting out the disconnect delay.
    Disconnecting,
    /// Connection closed; the peer is inert.
    Disconnected,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnecting => "disconnecting",
            PeerState::Disconnected => "disconnected",
        })
    }
}

/// Which side initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Created by a local `connect`.
    Outbound,
    /// Created by accepting a remote request.
    Inbound,
}

/// Why a peer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// A local error ended the connection.
    Exception,
    /// Closed locally.
    Disconnected,
    /// Closed by the remote.
    Terminated,
    /// The remote rejected the connection request.
    Rejected,
    /// The remote failed authentication.
    BadSignature,
    /// The remote stopped answering.
    Timeout,
    /// The peer was disposed before it disconnected.
    Disposed,
}

impl DisconnectReason {
    /// Whether the remote caused the disconnect.
    pub fn is_remote(self) -> bool {
        matches!(
            self,
            DisconnectReason::Terminated | DisconnectReason::Rejected
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DisconnectReason::Exception => "exception",
            DisconnectReason::Disconnected => "disconnected",
            DisconnectReason::Terminated => "terminated",
            DisconnectReason::Rejected => "rejected",
            DisconnectReason::BadSignature => "bad signature",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::Disposed => "disposed",
        })
    }
}

/// Snapshot of a peer for callers outside the host.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Remote address.
    pub remote: SocketAddr,
    /// Lifecycle state.
    pub state: PeerState,
    /// Who initiated the connection.
    pub direction: Direction,
    /// Smoothed round trip time, `None` before the first ping round trip.
    pub rtt: Option<Duration>,
    /// Averaged `local - remote` tick delta, `None` before it is known.
    pub clock_delta: Option<u16>,
    /// Whether connected traffic is encrypted.
    pub encrypted: bool,
    /// Whether the remote proved its identity with a signature.
    pub authenticated: bool,
    /// Traffic counters.
    pub statistics: PeerStatistics,
}

/// What the connecting side should do about its connection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    /// Nothing is due.
    Wait,
    /// Send (or resend) the request.
    Send,
    /// Every attempt went unanswered.
    Exhausted,
}

#[derive(Debug, Clone)]
struct Linger {
    deadline: Instant,
    reason: DisconnectReason,
    payload: Vec<u8>,
}

/// Lifecycle timers of one peer.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    state: PeerState,
    direction: Direction,
    /// Requests sent so far.
    requests_sent: u32,
    /// When the next request is due.
    next_request: Instant,
    /// When anything was last received from the remote.
    last_receive: Instant,
    /// When the next ping is due.
    next_ping: Option<Instant>,
    linger: Option<Linger>,
}

impl ConnectionState {
    /// Lifecycle of a locally initiated connection. The first request is due
    /// immediately.
    pub fn outbound(now: Instant) -> Self {
        Self::new(Direction::Outbound, now)
    }

    /// Lifecycle of an accepted connection.
    pub fn inbound(now: Instant) -> Self {
        Self::new(Direction::Inbound, now)
    }

    fn new(direction: Direction, now: Instant) -> Self {
        Self {
            state: PeerState::Connecting,
            direction,
            requests_sent: 0,
            next_request: now,
            last_receive: now,
            next_ping: None,
            linger: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Who initiated the connection.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether messages may be sent.
    pub fn is_connected(&self) -> bool {
        self.state == PeerState::Connected
    }

    /// Whether the peer has stopped.
    pub fn is_disconnected(&self) -> bool {
        self.state == PeerState::Disconnected
    }

    /// Record traffic from the remote.
    pub fn on_receive(&mut self, now: Instant) {
        self.last_receive = now;
    }

    /// When the remote was last heard from.
    pub fn last_receive(&self) -> Instant {
        self.last_receive
    }

    /// Decide whether a connection request is due at `now`.
    ///
    /// Every `Send` counts as one attempt; after `connect_attempts` sends
    /// and one more `connect_delay` the request is exhausted.
    pub fn poll_request(&mut self, now: Instant, config: &PeerConfig) -> RequestAction {
        if self.state != PeerState::Connecting
            || self.direction != Direction::Outbound
            || now < self.next_request
        {
            return RequestAction::Wait;
        }
        if self.requests_sent >= config.connect_attempts {
            return RequestAction::Exhausted;
        }
        self.requests_sent += 1;
        self.next_request = now + config.connect_delay;
        RequestAction::Send
    }

    /// Number of connection requests sent.
    pub fn requests_sent(&self) -> u32 {
        self.requests_sent
    }

    /// Enter `Connected`. The first ping goes out after `connect_delay`.
    pub fn establish(&mut self, now: Instant, config: &PeerConfig) {
        self.state = PeerState::Connected;
        self.last_receive = now;
        self.next_ping = Some(now + config.connect_delay);
    }

    /// Check whether a ping is due, scheduling the next one if so.
    pub fn poll_ping(&mut self, now: Instant, config: &PeerConfig) -> bool {
        match self.next_ping {
            Some(due) if self.state == PeerState::Connected && now >= due => {
                self.next_ping = Some(now + config.ping_delay);
                true
            }
            _ => false,
        }
    }

    /// Whether a connected peer has heard nothing for `idle_timeout`.
    pub fn is_idle(&self, now: Instant, config: &PeerConfig) -> bool {
        self.state == PeerState::Connected
            && now.saturating_duration_since(self.last_receive) >= config.idle_timeout
    }

    /// Enter `Disconnecting` until `now + delay`, then report `reason`.
    pub fn linger(&mut self, now: Instant, delay: Duration, reason: DisconnectReason, payload: Vec<u8>) {
        self.state = PeerState::Disconnecting;
        self.next_ping = None;
        self.linger = Some(Linger {
            deadline: now + delay,
            reason,
            payload,
        });
    }

    /// Return the pending reason once the disconnect delay has elapsed.
    pub fn poll_linger(&mut self, now: Instant) -> Option<(DisconnectReason, Vec<u8>)> {
        match &self.linger {
            Some(linger) if now >= linger.deadline => {
                let linger = self.linger.take()?;
                self.state = PeerState::Disconnected;
                Some((linger.reason, linger.payload))
            }
            _ => None,
        }
    }

    /// Enter `Disconnected` immediately.
    pub fn close(&mut self) {
        self.state = PeerState::Disconnected;
        self.next_ping = None;
        self.linger = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PeerConfig {
        PeerConfig::builder()
            .connect(3, Duration::from_millis(100))
            .build()
    }

    #[test]
    fn test_request_attempts() {
        let config = config();
        let start = Instant::now();
        let mut conn = ConnectionState::outbound(start);

        assert_eq!(conn.poll_request(start, &config), RequestAction::Send);
        assert_eq!(conn.poll_request(start, &config), RequestAction::Wait);

        let mut now = start;
        for _ in 0..2 {
            now += Duration::from_millis(100);
            assert_eq!(conn.poll_request(now, &config), RequestAction::Send);
        }
        assert_eq!(conn.requests_sent(), 3);

        now += Duration::from_millis(100);
        assert_eq!(conn.poll_request(now, &config), RequestAction::Exhausted);
    }

    #[test]
    fn test_inbound_never_requests() {
        let config = config();
        let now = Instant::now();
        let mut conn = ConnectionState::inbound(now);
        assert_eq!(conn.poll_request(now, &config), RequestAction::Wait);
        assert_eq!(conn.direction(), Direction::Inbound);
    }

    #[test]
    fn test_connection_lifecycle() {
        let config = config();
        let start = Instant::now();
        let mut conn = ConnectionState::outbound(start);
        assert_eq!(conn.state(), PeerState::Connecting);

        conn.establish(start, &config);
        assert!(conn.is_connected());
        assert!(!conn.poll_ping(start, &config));
        assert!(conn.poll_ping(start + config.connect_delay, &config));
        assert!(!conn.poll_ping(start + config.connect_delay, &config));

        conn.linger(start, Duration::from_millis(300), DisconnectReason::Terminated, b"bye".to_vec());
        assert_eq!(conn.state(), PeerState::Disconnecting);
        assert_eq!(conn.poll_linger(start + Duration::from_millis(299)), None);
        assert_eq!(
            conn.poll_linger(start + Duration::from_millis(300)),
            Some((DisconnectReason::Terminated, b"bye".to_vec()))
        );
        assert!(conn.is_disconnected());
        assert_eq!(conn.poll_linger(start + Duration::from_secs(1)), None);
    }

    #[test]
    fn test_idle_detection() {
        let config = config();
        let start = Instant::now();
        let mut conn = ConnectionState::inbound(start);
        conn.establish(start, &config);

        let later = start + config.idle_timeout;
        assert!(conn.is_idle(later, &config));

        conn.on_receive(later);
        assert!(!conn.is_idle(later, &config));
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(DisconnectReason::BadSignature.to_string(), "bad signature");
        assert!(DisconnectReason::Terminated.is_remote());
        assert!(!DisconnectReason::Timeout.is_remote());
    }
}
