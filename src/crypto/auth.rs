//! RSA host authentication
//!
//! A host configured with a private key signs the random challenge carried
//! by each connection request. Connecting peers that know the host's public
//! key verify the signature before completing the handshake.
//!
//! Key formats (Base64):
//! - public key: the 256-byte big-endian modulus, exponent 65537
//! - private key: D, DP, DQ, InverseQ, Modulus, P, Q concatenated at fixed
//!   widths (256, 128, 128, 128, 256, 128, 128 bytes)

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use super::CryptoAuthenticator;
use crate::core::{
    CryptoError, RSA_HALF_SIZE, RSA_MODULUS_SIZE, RSA_PRIVATE_EXPORT_SIZE, RSA_PUBLIC_EXPONENT,
    RSA_SIGNATURE_SIZE,
};

/// RSA-2048 / SHA-256 / PKCS#1 v1.5 authenticator.
#[derive(Clone, Default)]
pub struct RsaAuthenticator {
    private: Option<RsaPrivateKey>,
    signer: Option<SigningKey<Sha256>>,
}

impl std::fmt::Debug for RsaAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaAuthenticator")
            .field("has_private_key", &self.private.is_some())
            .finish()
    }
}

impl RsaAuthenticator {
    /// Create an authenticator that can only verify.
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh 2048-bit private key.
    pub fn generate() -> Result<Self, CryptoError> {
        let key = RsaPrivateKey::new(&mut OsRng, RSA_MODULUS_SIZE * 8)?;
        Ok(Self::with_private_key(key))
    }

    /// Load a private key exported with [`RsaAuthenticator::export_private_key`].
    pub fn from_private_key(encoded: &str) -> Result<Self, CryptoError> {
        let raw = STANDARD.decode(encoded.trim())?;
        if raw.len() != RSA_PRIVATE_EXPORT_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: RSA_PRIVATE_EXPORT_SIZE,
                actual: raw.len(),
            });
        }

        let mut parts = Layout::new(&raw);
        let d = parts.take(RSA_MODULUS_SIZE);
        // DP, DQ and InverseQ are recomputed from the primes
        parts.take(RSA_HALF_SIZE * 3);
        let n = parts.take(RSA_MODULUS_SIZE);
        let p = parts.take(RSA_HALF_SIZE);
        let q = parts.take(RSA_HALF_SIZE);

        let mut key = RsaPrivateKey::from_components(
            BigUint::from_bytes_be(n),
            BigUint::from(RSA_PUBLIC_EXPONENT),
            BigUint::from_bytes_be(d),
            vec![BigUint::from_bytes_be(p), BigUint::from_bytes_be(q)],
        )?;
        key.validate()?;
        key.precompute()?;
        Ok(Self::with_private_key(key))
    }

    fn with_private_key(key: RsaPrivateKey) -> Self {
        Self {
            signer: Some(SigningKey::new(key.clone())),
            private: Some(key),
        }
    }

    /// Whether a private key is loaded.
    pub fn has_private_key(&self) -> bool {
        self.private.is_some()
    }

    /// Export the private key as Base64.
    pub fn export_private_key(&self) -> Result<String, CryptoError> {
        let key = self.private.as_ref().ok_or(CryptoError::MissingPrivateKey)?;
        let dp = key.dp().ok_or(CryptoError::MissingPrivateKey)?;
        let dq = key.dq().ok_or(CryptoError::MissingPrivateKey)?;
        let inverse_q = key.crt_coefficient().ok_or(CryptoError::MissingPrivateKey)?;
        let [p, q] = key.primes() else {
            return Err(CryptoError::MissingPrivateKey);
        };

        let mut raw = Vec::with_capacity(RSA_PRIVATE_EXPORT_SIZE);
        write_fixed(&mut raw, key.d(), RSA_MODULUS_SIZE)?;
        write_fixed(&mut raw, dp, RSA_HALF_SIZE)?;
        write_fixed(&mut raw, dq, RSA_HALF_SIZE)?;
        write_fixed(&mut raw, &inverse_q, RSA_HALF_SIZE)?;
        write_fixed(&mut raw, key.n(), RSA_MODULUS_SIZE)?;
        write_fixed(&mut raw, p, RSA_HALF_SIZE)?;
        write_fixed(&mut raw, q, RSA_HALF_SIZE)?;
        Ok(STANDARD.encode(raw))
    }

    /// Export the public key (modulus) as Base64.
    pub fn export_public_key(&self) -> Result<String, CryptoError> {
        let key = self.private.as_ref().ok_or(CryptoError::MissingPrivateKey)?;
        let mut raw = Vec::with_capacity(RSA_MODULUS_SIZE);
        write_fixed(&mut raw, key.n(), RSA_MODULUS_SIZE)?;
        Ok(STANDARD.encode(raw))
    }

    fn import_public_key(encoded: &str) -> Result<RsaPublicKey, CryptoError> {
        let modulus = STANDARD.decode(encoded.trim())?;
        if modulus.len() != RSA_MODULUS_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: RSA_MODULUS_SIZE,
                actual: modulus.len(),
            });
        }
        Ok(RsaPublicKey::new(
            BigUint::from_bytes_be(&modulus),
            BigUint::from(RSA_PUBLIC_EXPONENT),
        )?)
    }
}

impl CryptoAuthenticator for RsaAuthenticator {
    fn signature_length(&self) -> usize {
        RSA_SIGNATURE_SIZE
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let signer = self.signer.as_ref().ok_or(CryptoError::MissingPrivateKey)?;
        let signature = signer
            .try_sign(data)
            .map_err(|_| CryptoError::BadSignature)?;
        Ok(signature.to_vec())
    }

    fn verify(&self, data: &[u8], signature: &[u8], public_key: &str) -> Result<(), CryptoError> {
        if signature.len() != RSA_SIGNATURE_SIZE {
            return Err(CryptoError::BadSignature);
        }
        let verifying_key = VerifyingKey::<Sha256>::new(Self::import_public_key(public_key)?);
        let signature = Signature::try_from(signature).map_err(|_| CryptoError::BadSignature)?;
        verifying_key
            .verify(data, &signature)
            .map_err(|_| CryptoError::BadSignature)
    }
}

/// Sequential fixed-width slicer over an exported key.
struct Layout<'a> {
    raw: &'a [u8],
    offset: usize,
}

impl<'a> Layout<'a> {
    fn new(raw: &'a [u8]) -> Self {
        Self { raw, offset: 0 }
    }

    fn take(&mut self, len: usize) -> &'a [u8] {
        let part = &self.raw[self.offset..self.offset + len];
        self.offset += len;
        part
    }
}

/// Append `value` big-endian, left padded with zeros to `width` bytes.
fn write_fixed(out: &mut Vec<u8>, value: &BigUint, width: usize) -> Result<(), CryptoError> {
    let bytes = value.to_bytes_be();
    if bytes.len() > width {
        return Err(CryptoError::InvalidKeyLength {
            expected: width,
            actual: bytes.len(),
        });
    }
    out.resize(out.len() + width - bytes.len(), 0);
    out.extend_from_slice(&bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    // Key generation is slow, share one key across tests
    fn authenticator() -> &'static RsaAuthenticator {
        static KEY: OnceLock<RsaAuthenticator> = OnceLock::new();
        KEY.get_or_init(|| RsaAuthenticator::generate().unwrap())
    }

    #[test]
    fn test_sign_verify() {
        let auth = authenticator();
        let public = auth.export_public_key().unwrap();
        let signature = auth.sign(b"challenge").unwrap();
        assert_eq!(signature.len(), RSA_SIGNATURE_SIZE);

        let verifier = RsaAuthenticator::new();
        assert!(verifier.verify(b"challenge", &signature, &public).is_ok());
        assert!(matches!(
            verifier.verify(b"other", &signature, &public),
            Err(CryptoError::BadSignature)
        ));
    }

    #[test]
    fn test_private_key_roundtrip() {
        let auth = authenticator();
        let exported = auth.export_private_key().unwrap();
        assert_eq!(
            STANDARD.decode(&exported).unwrap().len(),
            RSA_PRIVATE_EXPORT_SIZE
        );

        let imported = RsaAuthenticator::from_private_key(&exported).unwrap();
        assert_eq!(
            imported.export_public_key().unwrap(),
            auth.export_public_key().unwrap()
        );
        assert_eq!(imported.export_private_key().unwrap(), exported);

        let signature = imported.sign(b"data").unwrap();
        auth.verify(b"data", &signature, &auth.export_public_key().unwrap())
            .unwrap();
    }

    #[test]
    fn test_imported_key_signs_identically() {
        let auth = authenticator();
        let imported = RsaAuthenticator::from_private_key(&auth.export_private_key().unwrap())
            .unwrap()
            .clone();
        // PKCS#1 v1.5 signatures are deterministic
        assert_eq!(
            imported.sign(b"challenge").unwrap(),
            auth.sign(b"challenge").unwrap()
        );
        assert_eq!(imported.sign(b"again").unwrap(), auth.sign(b"again").unwrap());
    }

    #[test]
    fn test_import_length_mismatch() {
        let short = STANDARD.encode([1u8; RSA_PRIVATE_EXPORT_SIZE - 1]);
        assert!(matches!(
            RsaAuthenticator::from_private_key(&short),
            Err(CryptoError::InvalidKeyLength { .. })
        ));

        let verifier = RsaAuthenticator::new();
        let bad_public = STANDARD.encode([1u8; 100]);
        assert!(matches!(
            verifier.verify(b"x", &[0u8; RSA_SIGNATURE_SIZE], &bad_public),
            Err(CryptoError::InvalidKeyLength { .. })
        ));
    }

    #[test]
    fn test_sign_without_key() {
        let auth = RsaAuthenticator::new();
        assert!(matches!(
            auth.sign(b"x"),
            Err(CryptoError::MissingPrivateKey)
        ));
        assert!(auth.export_public_key().is_err());
    }

    #[test]
    fn test_bad_signature_length() {
        let auth = authenticator();
        let public = auth.export_public_key().unwrap();
        assert!(matches!(
            auth.verify(b"x", &[0u8; 10], &public),
            Err(CryptoError::BadSignature)
        ));
    }
}
