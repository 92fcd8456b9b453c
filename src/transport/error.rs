//! Transport layer error types.
//!
//! Errors raised while handling a single datagram never tear down the
//! connection: the packet is dropped and the error is reported as an
//! exception event. Only the fatal variants end a peer.

use std::io;

use thiserror::Error;

use super::frame::FrameError;
use crate::core::{CompressionError, CryptoError, DecodeError};

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Packet or message framing error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Decryption, key exchange or signing failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Body could not be decompressed.
    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),

    /// Handshake payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// I/O error (socket operations).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// CRC32 of the packet does not match its contents.
    #[error("checksum mismatch: packet says {expected:08x}, computed {actual:08x}")]
    ChecksumMismatch {
        /// Checksum carried by the packet.
        expected: u32,
        /// Checksum computed over the received bytes.
        actual: u32,
    },

    /// A packet arrived that the peer cannot handle in its current state.
    #[error("unexpected {0} packet")]
    UnexpectedPacket(&'static str),

    /// A message exceeds the allocator's maximum length.
    #[error("message too large: {size} > {limit}")]
    MessageTooLarge {
        /// Encoded message size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// The peer is not connected.
    #[error("peer not connected")]
    NotConnected,

    /// No answer to any connection request.
    #[error("connection attempt timed out")]
    ConnectTimeout,

    /// A reliable message was never acknowledged.
    #[error("reliable message {sequence} on channel {channel} was not acknowledged")]
    ResendExhausted {
        /// Channel of the message.
        channel: u8,
        /// Sequence of the message.
        sequence: u16,
    },

    /// No traffic from the remote for too long.
    #[error("connection idle timeout")]
    IdleTimeout,

    /// The remote host failed to prove its identity.
    #[error("remote signature verification failed")]
    BadSignature,

    /// The peer has been disposed.
    #[error("peer disposed")]
    Disposed,
}

impl TransportError {
    /// Check if this error only drops the offending packet.
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            TransportError::Frame(_)
                | TransportError::Crypto(_)
                | TransportError::Compression(_)
                | TransportError::Decode(_)
                | TransportError::ChecksumMismatch { .. }
                | TransportError::UnexpectedPacket(_)
        )
    }

    /// Check if this error is fatal to the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectTimeout
                | TransportError::ResendExhausted { .. }
                | TransportError::IdleTimeout
                | TransportError::BadSignature
                | TransportError::Disposed
        )
    }

    /// Check if this error means the remote sent something malformed.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TransportError::Frame(_)
                | TransportError::Crypto(_)
                | TransportError::Compression(_)
                | TransportError::Decode(_)
                | TransportError::ChecksumMismatch { .. }
        )
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_drop_errors() {
        assert!(TransportError::Frame(FrameError::Empty).is_silent_drop());
        assert!(TransportError::Crypto(CryptoError::BadPadding).is_silent_drop());
        assert!(TransportError::Compression(CompressionError::Truncated).is_silent_drop());
        assert!(TransportError::ChecksumMismatch {
            expected: 1,
            actual: 2
        }
        .is_silent_drop());

        assert!(!TransportError::IdleTimeout.is_silent_drop());
        assert!(!TransportError::Io(io::Error::other("test")).is_silent_drop());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(TransportError::ConnectTimeout.is_fatal());
        assert!(TransportError::IdleTimeout.is_fatal());
        assert!(TransportError::BadSignature.is_fatal());
        assert!(TransportError::ResendExhausted {
            channel: 0,
            sequence: 1
        }
        .is_fatal());

        assert!(!TransportError::NotConnected.is_fatal());
        assert!(!TransportError::Crypto(CryptoError::BadPadding).is_fatal());
    }

    #[test]
    fn test_protocol_violations() {
        assert!(TransportError::Decode(DecodeError::InvalidEncoding("x".into()))
            .is_protocol_violation());
        assert!(!TransportError::UnexpectedPacket("accept").is_protocol_violation());
        assert!(!TransportError::NotConnected.is_protocol_violation());
    }
}
