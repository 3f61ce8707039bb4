//! Content identifiers, multihashes and Kademlia identifier-space math.
//!
//! A node advertises raw multihashes; users name content by CID strings.
//! [`Identifier`] is the multihash form used for every comparison, and
//! [`KadId`] is its position in the DHT keyspace (`SHA-256(multihash)`).

use crate::error::{Result, VerifyError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cid::Cid;
use sha2::{Digest, Sha256};
use std::fmt;

/// Raw multihash bytes naming one piece of content.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(Vec<u8>);

impl Identifier {
    /// Wrap raw multihash bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Decode a CID string (CIDv0 base58 or multibase CIDv1) to its multihash.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::MalformedIdentifier`] when the string is not a
    /// valid content identifier.
    pub fn from_content_id(cid: &str) -> Result<Self> {
        let trimmed = cid.trim();
        let parsed = Cid::try_from(trimmed).map_err(|e| VerifyError::MalformedIdentifier {
            input: trimmed.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self(parsed.hash().to_bytes()))
    }

    /// Decode a base64 (standard alphabet) key as it appears in provider records.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::MalformedKeyEncoding`] when the key is not base64.
    pub fn from_base64(key: &str) -> Result<Self> {
        STANDARD
            .decode(key)
            .map(Self)
            .map_err(|e| VerifyError::MalformedKeyEncoding(format!("{key:?}: {e}")))
    }

    /// Base64 form, as the node writes it into provider records.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex of the raw bytes.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Kademlia identifier of this multihash.
    pub fn kad_id(&self) -> KadId {
        KadId(Sha256::digest(&self.0).into())
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self.to_hex())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Position of a multihash in the DHT keyspace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KadId([u8; 32]);

impl KadId {
    /// The leading `bits` bits as an integer. `bits` is clamped to `1..=32`.
    pub fn prefix(&self, bits: u8) -> u32 {
        let bits = bits.clamp(1, 32);
        let head = u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        head >> (32 - u32::from(bits))
    }

    /// Lowercase hex of the full identifier.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for KadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KadId({})", self.to_hex())
    }
}

impl fmt::Display for KadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Render a prefix value as `0x.. (binary)` using the width implied by `bits`.
pub fn format_prefix(value: u32, bits: u8) -> String {
    let bits = usize::from(bits.clamp(1, 32));
    let hex_width = bits.div_ceil(4);
    format!("0x{value:0hex_width$x} ({value:0bits$b})")
}
