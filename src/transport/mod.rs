//! Transport layer: framing, reliability and the per-peer state machine.
//!
//! - **Framing**: [`PacketHeader`], [`MessageHeader`] and the handshake
//!   payloads, with CRC32 verification
//! - **Connection lifecycle**: [`ConnectionState`] and [`DisconnectReason`]
//! - **Reliability**: acknowledgement windows, the [`ResendQueue`], ordered
//!   delivery and duplicate suppression
//! - **Fragmentation**: [`split_fragments`] and [`FragmentAssembler`]
//! - **Timing**: [`RttEstimator`] (RFC 6298) and the remote [`ClockDelta`]
//! - **Peer**: [`Peer`], driven through a [`PeerContext`]
//! - **Socket**: [`HostSocket`], a `socket2`-configured UDP socket
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Host                       │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   peers, reliability, fragments         │
//! ├─────────────────────────────────────────┤
//! │   Crypto Suite    │  Compressor Suite   │
//! ├─────────────────────────────────────────┤
//! │              UDP                        │
//! └─────────────────────────────────────────┘
//! ```

mod connection;
mod error;
mod fragment;
mod frame;
mod peer;
mod reliability;
mod socket;
mod statistics;
mod timing;

pub use connection::*;
pub use error::*;
pub use fragment::{split_fragments, FragmentAssembler};
pub use frame::*;
pub use peer::{Peer, PeerContext, PeerEvent, PeerOutput, PeerShared, ReceivedMessage};
pub use reliability::*;
pub use socket::{normalize, HostSocket};
pub use statistics::{HostStatistics, HostStatisticsSnapshot, PeerStatistics};
pub use timing::{constants as timing_constants, ClockDelta, RttEstimator};
