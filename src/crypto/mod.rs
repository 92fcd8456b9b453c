//! Cryptographic primitives for the connection handshake and packet encryption.
//!
//! - [`OsRandom`]: secure random bytes
//! - [`X25519Exchanger`]: ephemeral ECDH key exchange
//! - [`AesSession`]: AES-256-CBC with a random IV per packet
//! - [`RsaAuthenticator`]: RSA-2048 signatures proving a host's identity
//!
//! The traits below are the seams the transport talks to; the concrete types
//! are the only implementations the crate ships.

mod auth;
mod keys;
mod random;
mod session;

pub use auth::RsaAuthenticator;
pub use keys::X25519Exchanger;
pub use random::OsRandom;
pub use session::AesSession;

use crate::core::CryptoError;

/// Source of cryptographically secure random bytes.
pub trait CryptoRandom: Send + Sync {
    /// Fill `buf` with random bytes.
    fn fill(&self, buf: &mut [u8]);
}

/// Key exchange that derives a shared encryptor from the remote public key.
pub trait CryptoExchanger: Send {
    /// Encryptor produced by a completed exchange.
    type Encryptor: CryptoEncryptor;

    /// Local public key to send to the remote side.
    fn public_key(&self) -> &[u8];

    /// Combine the local private key with `remote_key` into an encryptor.
    fn derive_encryptor(&self, remote_key: &[u8]) -> Result<Self::Encryptor, CryptoError>;
}

/// Symmetric packet encryption.
pub trait CryptoEncryptor: Send {
    /// Upper bound of the ciphertext length for `len` plaintext bytes.
    fn max_encrypted_length(&self, len: usize) -> usize;

    /// Encrypt `input` into `output`, growing it as needed. Returns the
    /// ciphertext length.
    fn encrypt(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<usize, CryptoError>;

    /// Decrypt `input` into `output`, growing it as needed. Returns the
    /// plaintext length.
    fn decrypt(&self, input: &[u8], output: &mut Vec<u8>) -> Result<usize, CryptoError>;
}

/// Signature scheme used to authenticate the accepting host.
pub trait CryptoAuthenticator: Send + Sync {
    /// Length of every signature.
    fn signature_length(&self) -> usize;

    /// Sign `data` with the local private key.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Verify that `signature` over `data` was made by the owner of
    /// `public_key`.
    fn verify(&self, data: &[u8], signature: &[u8], public_key: &str) -> Result<(), CryptoError>;
}
