//! Host events and the bounded queue that carries them to the application.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};

use super::request::ConnectionRequest;
use crate::core::EVENT_QUEUE_TIMEOUT;
use crate::transport::{DisconnectReason, ReceivedMessage, TransportError};

/// Opaque handle of a peer owned by a host.
///
/// Handles are never reused within one host, so a stale handle fails with
/// [`NetError::UnknownPeer`](crate::core::NetError::UnknownPeer) instead of
/// reaching another connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub(crate) u64);

impl PeerId {
    /// Raw value, for logs and maps.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Something that happened on a host.
#[derive(Debug)]
pub enum HostEvent {
    /// A peer finished its handshake.
    PeerConnected {
        /// Peer handle.
        peer: PeerId,
        /// Remote address.
        remote: SocketAddr,
    },
    /// A peer delivered an application message.
    PeerReceived {
        /// Peer handle.
        peer: PeerId,
        /// The message.
        message: ReceivedMessage,
    },
    /// A peer reached `Disconnected` and was removed from the host.
    PeerDisconnected {
        /// Peer handle, no longer valid.
        peer: PeerId,
        /// Remote address.
        remote: SocketAddr,
        /// Why.
        reason: DisconnectReason,
        /// Payload sent with the disconnect or reject.
        payload: Vec<u8>,
    },
    /// A peer dropped a malformed packet.
    PeerException {
        /// Peer handle.
        peer: PeerId,
        /// What was wrong with it.
        error: TransportError,
    },
    /// A peer took a round trip sample.
    PeerRttUpdated {
        /// Peer handle.
        peer: PeerId,
        /// Raw sample.
        rtt: Duration,
    },
    /// The remote acknowledged a reliable message.
    MessageAcknowledged {
        /// Peer handle.
        peer: PeerId,
        /// Channel of the message.
        channel: u8,
        /// Sequence returned by the send.
        sequence: u16,
    },
    /// An unknown address asked to connect.
    ConnectionRequested(ConnectionRequest),
    /// A connectionless message arrived.
    UnconnectedReceived {
        /// Sender.
        remote: SocketAddr,
        /// Payload.
        payload: Vec<u8>,
    },
    /// A broadcast message arrived.
    BroadcastReceived {
        /// Sender.
        remote: SocketAddr,
        /// Payload.
        payload: Vec<u8>,
    },
    /// A datagram that belongs to no peer was dropped, or a send failed.
    Exception {
        /// Address involved.
        remote: SocketAddr,
        /// What went wrong.
        error: TransportError,
    },
    /// The host stopped. `error` is set when a socket failure forced it.
    Shutdown {
        /// Socket failure, if any.
        error: Option<io::Error>,
    },
}

/// Receiving end of a host's event queue.
#[derive(Debug)]
pub struct HostEvents {
    receiver: Receiver<HostEvent>,
}

impl HostEvents {
    /// Block until an event arrives. `None` once the host is gone and the
    /// queue is empty.
    pub fn recv(&self) -> Option<HostEvent> {
        self.receiver.recv().ok()
    }

    /// Block for at most `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<HostEvent> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take an event if one is queued.
    pub fn try_recv(&self) -> Option<HostEvent> {
        self.receiver.try_recv().ok()
    }

    /// Take every queued event.
    pub fn drain(&self) -> Vec<HostEvent> {
        self.receiver.try_iter().collect()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether no event is queued.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Sending end, shared by the host's threads.
#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    sender: Sender<HostEvent>,
}

impl EventSender {
    pub(crate) fn emit(&self, event: HostEvent) {
        let event = match self.sender.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => return,
            Err(TrySendError::Full(event)) => event,
        };
        // Back-pressure, bounded so an application thread that is also the
        // consumer cannot deadlock itself
        if let Err(SendTimeoutError::Timeout(event)) =
            self.sender.send_timeout(event, EVENT_QUEUE_TIMEOUT)
        {
            tracing::warn!(?event, "event queue full, dropping event");
        }
    }
}

/// Create a bounded event queue.
pub(crate) fn event_queue(capacity: usize) -> (EventSender, HostEvents) {
    let (sender, receiver) = channel::bounded(capacity.max(1));
    (EventSender { sender }, HostEvents { receiver })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn test_peer_id_display() {
        assert_eq!(PeerId(7).to_string(), "peer#7");
        assert_eq!(PeerId(7).as_u64(), 7);
    }

    #[test]
    fn test_queue_order_and_drain() {
        let (sender, events) = event_queue(8);
        for i in 0..3u8 {
            sender.emit(HostEvent::UnconnectedReceived {
                remote: remote(),
                payload: vec![i],
            });
        }
        assert_eq!(events.len(), 3);
        let drained = events.drain();
        let payloads: Vec<u8> = drained
            .into_iter()
            .filter_map(|event| match event {
                HostEvent::UnconnectedReceived { payload, .. } => payload.first().copied(),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec![0, 1, 2]);
        assert!(events.is_empty());
        assert!(events.try_recv().is_none());
    }

    #[test]
    fn test_closed_queue() {
        let (sender, events) = event_queue(1);
        drop(sender);
        assert!(events.recv().is_none());
        assert!(events.recv_timeout(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (sender, events) = event_queue(1);
        drop(events);
        sender.emit(HostEvent::Shutdown { error: None });
    }
}
