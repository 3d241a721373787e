use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Size in bytes of every identifier in the cluster.
pub const ID_SIZE: usize = 32;

/// Fixed-size identifier naming an object or a node.
///
/// Identifiers are produced by the transform chain from either an object's
/// name or its content. The same bytes double as the routing key used to
/// pick the peer responsible for an object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; ID_SIZE]);

impl ObjectId {
    /// Wrap a pre-computed hash.
    pub const fn from_hash(hash: [u8; ID_SIZE]) -> Self {
        Self(hash)
    }

    /// Copy an identifier out of a byte slice of exactly [`ID_SIZE`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TypeError> {
        let arr: [u8; ID_SIZE] = bytes.try_into().map_err(|_| TypeError::InvalidLength {
            expected: ID_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// The null identifier (all zeros).
    pub const fn null() -> Self {
        Self([0u8; ID_SIZE])
    }

    /// Returns `true` if this is the null identifier.
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; ID_SIZE]
    }

    /// The raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Name of the shard directory holding this object: the first byte in hex.
    pub fn shard(&self) -> String {
        format!("{:02x}", self.0[0])
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ID_SIZE]> for ObjectId {
    fn from(bytes: [u8; ID_SIZE]) -> Self {
        Self(bytes)
    }
}

impl From<ObjectId> for [u8; ID_SIZE] {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}
