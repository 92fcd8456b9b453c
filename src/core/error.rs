//! Error types for the netcode crate.

use thiserror::Error;

/// Errors that can occur when decoding application payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Invalid encoding.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Unexpected end of data.
    #[error("unexpected end of data: needed {needed} more bytes, {remaining} remaining")]
    UnexpectedEof {
        /// Bytes requested.
        needed: usize,
        /// Bytes left in the reader.
        remaining: usize,
    },
}

/// Errors in the crypto layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key material has the wrong size.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Ciphertext is shorter than an IV plus one block, or not block aligned.
    #[error("malformed ciphertext of length {0}")]
    MalformedCiphertext(usize),

    /// PKCS7 padding check failed after decryption.
    #[error("bad padding")]
    BadPadding,

    /// Output buffer cannot hold the result.
    #[error("output buffer too small: need {needed}, have {available}")]
    OutputTooSmall {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        available: usize,
    },

    /// Base64 decoding of a key failed.
    #[error("invalid key encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// RSA key construction or signing failed.
    #[error("rsa failure: {0}")]
    Rsa(#[from] rsa::Error),

    /// Signature did not verify.
    #[error("signature verification failed")]
    BadSignature,

    /// No private key is available for signing.
    #[error("no private key loaded")]
    MissingPrivateKey,

    /// No public key is available for verification.
    #[error("no public key loaded")]
    MissingPublicKey,
}

/// Errors in the compression layer.
#[derive(Debug, Error)]
pub enum CompressionError {
    /// Compressed stream contains an invalid control byte or back reference.
    #[error("invalid compressed data at offset {0}")]
    InvalidData(usize),

    /// Compressed stream ended early.
    #[error("truncated compressed data")]
    Truncated,

    /// Decompressed size exceeds the allocator limit.
    #[error("decompressed size exceeded limit: {size} > {limit}")]
    SizeExceeded {
        /// Size that would be required.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// Underlying deflate stream failed.
    #[error("deflate failure: {0}")]
    Deflate(String),
}

/// Top-level netcode errors.
#[derive(Debug, Error)]
pub enum NetError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Compression error.
    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A peer with this address already exists.
    #[error("peer already exists for {0}")]
    PeerExists(std::net::SocketAddr),

    /// The peer handle does not refer to a live peer.
    #[error("unknown peer {0}")]
    UnknownPeer(crate::host::PeerId),

    /// The host has been shut down.
    #[error("host shut down")]
    Shutdown,

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for host-level operations.
pub type NetResult<T> = Result<T, NetError>;
