//! Inbound connection requests.

use std::net::SocketAddr;

use crate::core::{Reader, CHALLENGE_SIZE, PUBLIC_KEY_SIZE};
use crate::transport::{FrameError, RequestPayload};

/// A connection attempt from an address the host has no peer for.
///
/// Pass it to [`Host::accept`](super::Host::accept) or
/// [`Host::reject`](super::Host::reject). Dropping it sends nothing; the
/// remote keeps retrying until its connect attempts run out, and every retry
/// raises a fresh request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    remote: SocketAddr,
    key: Vec<u8>,
    challenge: Vec<u8>,
    payload: Vec<u8>,
}

impl ConnectionRequest {
    /// Parse the body of a `Request` packet from `remote`.
    pub fn parse(remote: SocketAddr, body: &[u8]) -> Result<Self, FrameError> {
        let request = RequestPayload::read(body)?;
        if !request.key.is_empty() && request.key.len() != PUBLIC_KEY_SIZE {
            return Err(FrameError::MalformedPayload("request key length"));
        }
        if !request.challenge.is_empty() && request.challenge.len() != CHALLENGE_SIZE {
            return Err(FrameError::MalformedPayload("request challenge length"));
        }
        Ok(Self {
            remote,
            key: request.key.to_vec(),
            challenge: request.challenge.to_vec(),
            payload: request.payload.to_vec(),
        })
    }

    /// Address of the requesting host.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Remote ECDH public key, empty when the remote does not encrypt.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Challenge to sign, empty when the remote does not authenticate us.
    pub fn challenge(&self) -> &[u8] {
        &self.challenge
    }

    /// Application payload sent with the request.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Reader over the payload.
    pub fn reader(&self) -> Reader<'_> {
        Reader::new(&self.payload)
    }

    /// Whether the remote offered encryption.
    pub fn is_encrypted(&self) -> bool {
        !self.key.is_empty()
    }

    /// Whether the remote expects a signed challenge.
    pub fn is_authenticated(&self) -> bool {
        !self.challenge.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Writer;

    fn encode(key: &[u8], challenge: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut writer = Writer::new();
        RequestPayload {
            key,
            challenge,
            payload,
        }
        .write(&mut writer);
        writer.into_inner()
    }

    #[test]
    fn test_parse_request() {
        let remote: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let body = encode(&[1; PUBLIC_KEY_SIZE], &[], b"join");
        let request = ConnectionRequest::parse(remote, &body).unwrap();
        assert_eq!(request.remote(), remote);
        assert!(request.is_encrypted());
        assert!(!request.is_authenticated());
        assert_eq!(request.payload(), b"join");
        assert_eq!(request.reader().remaining(), 4);
    }

    #[test]
    fn test_reject_bad_lengths() {
        let remote: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        assert!(ConnectionRequest::parse(remote, &encode(&[1; 5], &[], &[])).is_err());
        assert!(ConnectionRequest::parse(remote, &encode(&[], &[2; 10], &[])).is_err());
        assert!(ConnectionRequest::parse(remote, &[1]).is_err());
    }
}
