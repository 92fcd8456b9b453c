//! Protocol constants.
//!
//! Wire-level values are fixed by the protocol and MUST NOT be changed
//! without breaking compatibility with existing peers.

use std::time::Duration;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 private key size.
pub const PRIVATE_KEY_SIZE: usize = 32;

/// AES-256 key size.
pub const AES_KEY_SIZE: usize = 32;

/// AES block size, also the size of the per-packet IV prefix.
pub const AES_BLOCK_SIZE: usize = 16;

/// RSA modulus size in bytes (RSA-2048).
pub const RSA_MODULUS_SIZE: usize = 256;

/// RSA signature size in bytes.
pub const RSA_SIGNATURE_SIZE: usize = 256;

/// Size of the RSA CRT parameters (P, Q, DP, DQ, InverseQ) in bytes.
pub const RSA_HALF_SIZE: usize = 128;

/// Exported private key size: D, DP, DQ, InverseQ, Modulus, P, Q.
pub const RSA_PRIVATE_EXPORT_SIZE: usize = RSA_MODULUS_SIZE * 2 + RSA_HALF_SIZE * 5;

/// RSA public exponent used for all authenticator keys.
pub const RSA_PUBLIC_EXPONENT: u32 = 65537;

/// Size of the handshake challenge signed by the accepting host.
pub const CHALLENGE_SIZE: usize = RSA_SIGNATURE_SIZE;

// =============================================================================
// COMPRESSION CONSTANTS
// =============================================================================

/// LZF hash table bits.
pub const LZF_HLOG: u32 = 14;

/// LZF hash table size.
pub const LZF_HSIZE: usize = 1 << LZF_HLOG;

/// LZF maximum literal run.
pub const LZF_MAX_LIT: usize = 1 << 5;

/// LZF maximum back-reference offset.
pub const LZF_MAX_OFF: usize = 1 << 13;

/// LZF maximum back-reference length.
pub const LZF_MAX_REF: usize = (1 << 8) + (1 << 3);

/// DEFLATE block size used by the compressed length bound.
pub const DEFLATE_BLOCK_SIZE: usize = 16383;

// =============================================================================
// CHANNELS
// =============================================================================

/// Channel used when a message does not specify one.
pub const CHANNEL_DEFAULT: u8 = 0;

/// Channel carrying ping messages.
pub const CHANNEL_PING: u8 = 0;

/// Channel carrying disconnect messages.
pub const CHANNEL_DISCONNECT: u8 = 0;

/// Number of distinct channels.
pub const CHANNEL_COUNT: usize = 256;

// =============================================================================
// ACKNOWLEDGEMENT WINDOW
// =============================================================================

/// Number of earlier sequences covered by the acknowledgement bitmask.
pub const ACK_WINDOW_BITS: u16 = 32;

/// Acknowledgement payload size (attempt + latest + mask).
pub const ACK_PAYLOAD_SIZE: usize = 1 + 2 + 4;

// =============================================================================
// HOST DEFAULTS
// =============================================================================

/// Default socket send buffer size.
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 32768;

/// Default socket receive buffer size.
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 32768;

/// Default number of receive threads.
pub const DEFAULT_RECEIVE_COUNT: usize = 8;

/// Default maximum datagram size accepted by the receive loop.
pub const DEFAULT_RECEIVE_MTU: usize = 1500;

/// Default IP time-to-live.
pub const DEFAULT_TTL: u32 = 128;

/// Default number of pooled buffers per pool.
pub const DEFAULT_ALLOCATOR_COUNT: usize = 256;

/// Default maximum length of a pooled buffer.
pub const DEFAULT_ALLOCATOR_POOLED_LENGTH: usize = 32768;

/// Default growth step while a buffer is below the pooled length.
pub const DEFAULT_ALLOCATOR_POOLED_EXPAND_LENGTH: usize = 1024;

/// Default growth step once a buffer exceeds the pooled length.
pub const DEFAULT_ALLOCATOR_EXPAND_LENGTH: usize = 65536;

/// Default maximum message length.
pub const DEFAULT_ALLOCATOR_MAX_LENGTH: usize = 16 * 1024 * 1024;

/// Default interval between host ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(5);

/// Default capacity of the host event queue.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 4096;

/// How long a network thread waits on a full event queue before dropping the event.
pub const EVENT_QUEUE_TIMEOUT: Duration = Duration::from_millis(1000);

/// How long a receive thread blocks on the socket before checking for shutdown.
pub const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

// =============================================================================
// PEER DEFAULTS
// =============================================================================

/// Default number of connection requests sent before giving up.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 24;

/// Default delay between connection requests.
pub const DEFAULT_CONNECT_DELAY: Duration = Duration::from_millis(250);

/// Default maximum datagram size produced by a peer.
pub const DEFAULT_MTU: usize = 1350;

/// Default interval between pings.
pub const DEFAULT_PING_DELAY: Duration = Duration::from_millis(1000);

/// Default batching delay before queued messages are flushed.
pub const DEFAULT_SEND_DELAY: Duration = Duration::from_millis(15);

/// Default number of sends of a reliable message before the peer times out.
pub const DEFAULT_RESEND_COUNT: u32 = 12;

/// Default jitter added to the RTT when computing the resend delay.
pub const DEFAULT_RESEND_DELAY_JITTER: Duration = Duration::from_millis(40);

/// Default lower bound of the resend delay.
pub const DEFAULT_RESEND_DELAY_MIN: Duration = Duration::from_millis(120);

/// Default upper bound of the resend delay.
pub const DEFAULT_RESEND_DELAY_MAX: Duration = Duration::from_millis(800);

/// Default lifetime of an incomplete fragment group.
pub const DEFAULT_FRAGMENT_TIMEOUT: Duration = Duration::from_millis(16000);

/// Default lifetime of a unique-window entry.
pub const DEFAULT_DUPLICATE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default number of consecutive unsequenced messages before one is sequenced.
pub const DEFAULT_UNSEQUENCED_MAX: u32 = 64;

/// Default number of later deliveries an ordered message may wait for.
pub const DEFAULT_ORDERED_DELAY_MAX: u32 = 8;

/// Default maximum wait of a buffered ordered message.
pub const DEFAULT_ORDERED_DELAY_TIMEOUT: Duration = Duration::from_millis(4000);

/// Default linger after a disconnect before the peer is released.
pub const DEFAULT_DISCONNECT_DELAY: Duration = Duration::from_millis(300);

/// Default silence after which a connected peer times out.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(10000);

/// Default weight of the previous clock delta average.
pub const DEFAULT_TIME_STABILITY: f64 = 0.98;
