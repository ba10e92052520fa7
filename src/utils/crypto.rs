//! # HMAC-SHA256 Packet Signing
//!
//! Each connection gets its own 256-bit key, generated by the server from
//! the OS CSPRNG and delivered once over the (optionally TLS-protected) TCP
//! stream. Signed packets carry a trailing 32-byte tag computed over every
//! preceding byte of the frame payload.
//!
//! Verification recomputes the tag over everything but the last 32 bytes
//! and compares in constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::packet::{Packet, HMAC_TAG_LEN};
use crate::error::{constants, ProtocolError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Length of freshly generated keys.
pub const HMAC_KEY_LEN: usize = 32;

/// Per-connection HMAC key. Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HmacKey {
    bytes: Vec<u8>,
}

impl HmacKey {
    /// Generate a random 256-bit key.
    pub fn generate() -> Result<Self> {
        let mut bytes = vec![0u8; HMAC_KEY_LEN];
        getrandom::fill(&mut bytes)
            .map_err(|e| ProtocolError::SecurityError(format!("Random generator failed: {e}")))?;
        Ok(Self { bytes })
    }

    /// Wrap a key received from the server.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(ProtocolError::SecurityError("Empty HMAC key".into()));
        }
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.bytes)
            .map_err(|e| ProtocolError::SecurityError(format!("Invalid HMAC key: {e}")))
    }

    /// Tag for `data`.
    pub fn compute(&self, data: &[u8]) -> Result<[u8; HMAC_TAG_LEN]> {
        let mut mac = self.mac()?;
        mac.update(data);
        let mut tag = [0u8; HMAC_TAG_LEN];
        tag.copy_from_slice(&mac.finalize().into_bytes());
        Ok(tag)
    }

    /// Append a tag covering the packet's current contents.
    pub fn sign(&self, packet: &mut Packet) -> Result<()> {
        let tag = self.compute(packet.as_bytes())?;
        packet.write_raw(&tag);
        Ok(())
    }

    /// Check `tag` against `content` in constant time.
    pub fn verify_parts(&self, content: &[u8], tag: &[u8]) -> Result<()> {
        let mut mac = self.mac()?;
        mac.update(content);
        mac.verify_slice(tag)
            .map_err(|_| ProtocolError::IntegrityFailure(constants::ERR_INTEGRITY_FAILURE))
    }

    /// Check the trailing tag of a signed packet.
    pub fn verify(&self, packet: &Packet) -> Result<()> {
        let (content, tag) = packet
            .split_hmac()
            .ok_or(ProtocolError::IntegrityFailure(constants::ERR_MISSING_HMAC))?;
        self.verify_parts(content, tag)
    }
}

impl std::fmt::Debug for HmacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacKey")
            .field("len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}
