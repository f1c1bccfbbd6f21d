use crate::{Result, TypesError};
use blake3::Hasher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Commitment to an execution's output. Two executions agree when their
/// digests are byte-equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResultDigest([u8; 32]);

impl ResultDigest {
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| TypesError::InvalidDigest(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(TypesError::InvalidDigest(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for ResultDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResultDigest({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for ResultDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Descriptor returned by the publish backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedResult {
    /// Backend-specific location (content id, URL, bucket key)
    pub location: String,
    pub digest: ResultDigest,
    pub published_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_hex() {
        let d1 = ResultDigest::of(b"output");
        let d2 = ResultDigest::of(b"output");
        assert_eq!(d1, d2);
        assert_ne!(d1, ResultDigest::of(b"other"));

        let parsed = ResultDigest::from_hex(&d1.to_hex()).unwrap();
        assert_eq!(parsed, d1);
        assert!(ResultDigest::from_hex("abcd").is_err());
    }
}
