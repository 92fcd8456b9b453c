//! AES-256-CBC packet encryption
//!
//! Every encrypted body is `iv(16) || ciphertext`, where the IV is fresh
//! random bytes and the plaintext is PKCS7 padded. A session is bound to one
//! peer and created once during the handshake.

use std::sync::Arc;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};

use super::CryptoEncryptor;
use crate::alloc::Allocator;
use crate::core::{CryptoError, AES_BLOCK_SIZE, AES_KEY_SIZE};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES-256-CBC session with a per-packet random IV.
///
/// The key lives in an allocator key buffer and is wiped when the session
/// is dropped.
pub struct AesSession {
    key: Vec<u8>,
    iv: Vec<u8>,
    allocator: Arc<Allocator>,
}

impl AesSession {
    /// Create a session from a 32-byte key.
    pub fn new(allocator: Arc<Allocator>, key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != AES_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: AES_KEY_SIZE,
                actual: key.len(),
            });
        }
        let mut stored = allocator.create_key(AES_KEY_SIZE);
        stored.copy_from_slice(key);
        let iv = allocator.create_iv(AES_BLOCK_SIZE);
        Ok(Self {
            key: stored,
            iv,
            allocator,
        })
    }

    /// Ciphertext length for `len` plaintext bytes, IV included.
    pub fn encrypted_length(len: usize) -> usize {
        AES_BLOCK_SIZE + (len / AES_BLOCK_SIZE + 1) * AES_BLOCK_SIZE
    }

    #[cfg(test)]
    pub(crate) fn key(&self) -> &[u8] {
        &self.key
    }
}

impl std::fmt::Debug for AesSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesSession").finish_non_exhaustive()
    }
}

impl Drop for AesSession {
    fn drop(&mut self) {
        self.allocator.return_key(std::mem::take(&mut self.key));
        self.allocator.return_iv(std::mem::take(&mut self.iv));
    }
}

impl CryptoEncryptor for AesSession {
    fn max_encrypted_length(&self, len: usize) -> usize {
        Self::encrypted_length(len)
    }

    fn encrypt(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<usize, CryptoError> {
        let total = Self::encrypted_length(input.len());
        if output.len() < total {
            output.resize(total, 0);
        }

        OsRng.fill_bytes(&mut self.iv);
        output[..AES_BLOCK_SIZE].copy_from_slice(&self.iv);

        let available = output.len();
        let cipher = Aes256CbcEnc::new_from_slices(&self.key, &self.iv).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: AES_KEY_SIZE,
                actual: self.key.len(),
            }
        })?;
        let written = cipher
            .encrypt_padded_b2b_mut::<Pkcs7>(input, &mut output[AES_BLOCK_SIZE..total])
            .map_err(|_| CryptoError::OutputTooSmall {
                needed: total,
                available,
            })?
            .len();
        Ok(AES_BLOCK_SIZE + written)
    }

    fn decrypt(&self, input: &[u8], output: &mut Vec<u8>) -> Result<usize, CryptoError> {
        if input.len() < AES_BLOCK_SIZE * 2 || input.len() % AES_BLOCK_SIZE != 0 {
            return Err(CryptoError::MalformedCiphertext(input.len()));
        }
        let (iv, ciphertext) = input.split_at(AES_BLOCK_SIZE);
        if output.len() < ciphertext.len() {
            output.resize(ciphertext.len(), 0);
        }

        let cipher = Aes256CbcDec::new_from_slices(&self.key, iv).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: AES_KEY_SIZE,
                actual: self.key.len(),
            }
        })?;
        let plaintext = cipher
            .decrypt_padded_b2b_mut::<Pkcs7>(ciphertext, &mut output[..ciphertext.len()])
            .map_err(|_| CryptoError::BadPadding)?;
        Ok(plaintext.len())
    }
}
