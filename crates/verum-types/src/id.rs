use crate::{Result, TypesError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Random 128-bit identifier body, hex encoded.
fn random_suffix() -> String {
    let seed: [u8; 32] = rand::random();
    let hash = blake3::hash(&seed);
    hex::encode(&hash.as_bytes()[..16])
}

fn validate(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(TypesError::InvalidId(format!("{} cannot be empty", kind)));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(TypesError::InvalidId(format!(
            "{} '{}' contains whitespace",
            kind, value
        )));
    }
    Ok(())
}

/// Identifier of a submitted job
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(format!("j-{}", random_suffix()))
    }

    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        validate("job id", &value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log fields
    pub fn short(&self) -> &str {
        let end = self.0.len().min(10);
        &self.0[..end]
    }
}

/// Identifier of one participant's attempt at one shard
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn generate() -> Self {
        Self(format!("e-{}", random_suffix()))
    }

    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        validate("execution id", &value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        let end = self.0.len().min(10);
        &self.0[..end]
    }
}

/// Peer identifier of a requester or compute participant
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        validate("node id", &value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One shard of one job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub job_id: JobId,
    pub index: u32,
}

impl ShardId {
    pub fn new(job_id: JobId, index: u32) -> Self {
        Self { job_id, index }
    }
}

macro_rules! impl_string_id_fmt {
    ($ty:ident) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($ty), self.0)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

impl_string_id_fmt!(JobId);
impl_string_id_fmt!(ExecutionId);
impl_string_id_fmt!(NodeId);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.job_id, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = ExecutionId::generate();
        let b = ExecutionId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("e-"));
        assert!(JobId::generate().as_str().starts_with("j-"));
    }

    #[test]
    fn test_parse_rejects_empty_and_whitespace() {
        assert!(NodeId::new("").is_err());
        assert!(NodeId::new("node 1").is_err());
        assert!(JobId::parse("j-abc").is_ok());
    }

    #[test]
    fn test_shard_display() {
        let shard = ShardId::new(JobId::parse("j-1").unwrap(), 3);
        assert_eq!(shard.to_string(), "j-1#3");
    }
}
