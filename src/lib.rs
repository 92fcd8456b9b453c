//! # netcode
//!
//! Reliable, ordered, encrypted messaging over UDP.
//!
//! A [`Host`] owns one UDP socket and any number of peers. Each peer is a
//! connection with its own handshake, acknowledgements, retransmission,
//! fragmentation and round-trip estimate. Messages choose their guarantees
//! per send:
//!
//! - **Reliable**: retransmitted until acknowledged
//! - **Ordered**: delivered in sequence within their channel
//! - **Unique**: delivered at most once within the duplicate window
//! - **Timed**: carry the sender's timestamp, mapped onto the local clock
//!
//! Packets can be CRC32-verified, compressed (LZF or DEFLATE) and encrypted
//! with AES-256-CBC under a key agreed by X25519. A host with an RSA private
//! key can prove its identity to peers that know its public key.
//!
//! ## Modules
//!
//! - [`core`]: constants, configuration, errors, the wire codec and traits
//! - [`alloc`]: pooled buffers shared by everything on a host
//! - [`crypto`]: random bytes, key exchange, encryption and signatures
//! - [`compression`]: LZF and DEFLATE
//! - [`transport`]: framing, reliability and the peer state machine
//! - [`host`]: the socket owner, its threads and its event queue
//!
//! ## Example Usage
//!
//! ```no_run
//! use netcode::prelude::*;
//!
//! # fn main() -> Result<(), NetError> {
//! let (host, events) = Host::new(HostConfig::default())?;
//! host.start()?;
//!
//! let server = "127.0.0.1:7777".parse().unwrap();
//! let peer = host.connect(server, b"hello")?;
//!
//! while let Some(event) = events.recv() {
//!     match event {
//!         HostEvent::PeerConnected { .. } => {
//!             let message = BytesMessage::new(1, b"ping".to_vec())
//!                 .with_reliable()
//!                 .with_ordered();
//!             host.send(peer, &message)?;
//!         }
//!         HostEvent::PeerReceived { message, .. } => {
//!             println!("got {} bytes", message.payload.len());
//!         }
//!         HostEvent::PeerDisconnected { reason, .. } => {
//!             println!("disconnected: {reason}");
//!             break;
//!         }
//!         _ => {}
//!     }
//! }
//! host.shutdown();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod alloc;
pub mod compression;
pub mod core;
pub mod crypto;
pub mod host;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{
        BytesMessage, CompressorKind, HostConfig, HostTimestamp, Message, NetError, NetResult,
        PeerConfig, Reader, SimulatorConfig, Writer,
    };
    pub use crate::host::{ConnectionRequest, Host, HostEvent, HostEvents, PeerId};
    pub use crate::transport::{
        DisconnectReason, PeerInfo, PeerState, ReceivedMessage, TransportError,
    };
}

// Re-export commonly used items at crate root
pub use crate::core::{HostConfig, Message, NetError, NetResult, PeerConfig};
pub use crate::host::{ConnectionRequest, Host, HostEvent, HostEvents, PeerId};
pub use crate::transport::{DisconnectReason, ReceivedMessage};
