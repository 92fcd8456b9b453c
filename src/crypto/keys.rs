//! X25519 key exchange
//!
//! Each connection attempt generates a fresh keypair. The raw shared secret
//! becomes the AES-256 session key.

use std::sync::Arc;

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use super::{AesSession, CryptoExchanger};
use crate::alloc::Allocator;
use crate::core::{CryptoError, PUBLIC_KEY_SIZE};

/// An ephemeral X25519 keypair.
///
/// The private scalar is zeroized on drop.
pub struct X25519Exchanger {
    secret: StaticSecret,
    public: PublicKey,
    allocator: Arc<Allocator>,
}

impl X25519Exchanger {
    /// Generate a new random keypair.
    pub fn generate(allocator: Arc<Allocator>) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            allocator,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_private_bytes(private: [u8; 32], allocator: Arc<Allocator>) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            allocator,
        }
    }
}

impl std::fmt::Debug for X25519Exchanger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X25519Exchanger")
            .field("public", self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

impl CryptoExchanger for X25519Exchanger {
    type Encryptor = AesSession;

    fn public_key(&self) -> &[u8] {
        self.public.as_bytes()
    }

    fn derive_encryptor(&self, remote_key: &[u8]) -> Result<AesSession, CryptoError> {
        let remote: [u8; PUBLIC_KEY_SIZE] =
            remote_key
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: PUBLIC_KEY_SIZE,
                    actual: remote_key.len(),
                })?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(remote));
        AesSession::new(Arc::clone(&self.allocator), shared.as_bytes())
    }
}
