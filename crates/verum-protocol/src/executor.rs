//! Execution and publish backends used by a compute participant.
//!
//! The protocol treats both as black boxes; the implementations here are
//! deterministic stand-ins used by the devstack and tests.

use crate::{ProtocolError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use verum_types::{ExecutionId, Job, PublishedResult, ResultDigest};

/// Output of one shard run, held until published or released
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub data: Vec<u8>,
    pub digest: ResultDigest,
}

impl ExecutionOutput {
    pub fn new(data: Vec<u8>) -> Self {
        let digest = ResultDigest::of(&data);
        Self { data, digest }
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, job: &Job, shard_index: u32) -> Result<ExecutionOutput>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        execution_id: &ExecutionId,
        output: &ExecutionOutput,
    ) -> Result<PublishedResult>;
}

/// Hashes the payload together with the shard index. Honest participants
/// running it agree byte for byte.
#[derive(Debug, Clone, Default)]
pub struct Blake3Executor {
    delay: Duration,
    salt: Option<Vec<u8>>,
}

impl Blake3Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated run time
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Mix extra bytes into the output, producing a digest honest peers
    /// will not match
    pub fn with_salt(mut self, salt: impl Into<Vec<u8>>) -> Self {
        self.salt = Some(salt.into());
        self
    }
}

#[async_trait]
impl Executor for Blake3Executor {
    async fn run(&self, job: &Job, shard_index: u32) -> Result<ExecutionOutput> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut hasher = blake3::Hasher::new();
        hasher.update(&job.spec.payload);
        hasher.update(&shard_index.to_le_bytes());
        if let Some(salt) = &self.salt {
            hasher.update(salt);
        }
        Ok(ExecutionOutput::new(hasher.finalize().as_bytes().to_vec()))
    }
}

/// Always fails with the configured message
#[derive(Debug, Clone)]
pub struct FailingExecutor {
    message: String,
}

impl FailingExecutor {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Executor for FailingExecutor {
    async fn run(&self, _job: &Job, _shard_index: u32) -> Result<ExecutionOutput> {
        Err(ProtocolError::ExecutionFailed(self.message.clone()))
    }
}

/// In-memory publish backend addressed by digest
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    fail_with: Option<String>,
    delay: Duration,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that rejects every publish
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_with: Some(message.into()),
            ..Self::default()
        }
    }

    /// Take `delay` before each object is stored
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub async fn get(&self, location: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(location).cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(
        &self,
        _execution_id: &ExecutionId,
        output: &ExecutionOutput,
    ) -> Result<PublishedResult> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(message) = &self.fail_with {
            return Err(ProtocolError::PublishFailed(message.clone()));
        }
        let location = format!("mem://{}", output.digest.to_hex());
        self.objects
            .write()
            .await
            .insert(location.clone(), output.data.clone());
        Ok(PublishedResult {
            location,
            digest: output.digest,
            published_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verum_types::{Deal, JobSpec};

    fn job() -> Job {
        Job::new("client", JobSpec::new(2, b"payload".to_vec()), Deal::default()).unwrap()
    }

    #[tokio::test]
    async fn test_honest_runs_agree_per_shard() {
        let job = job();
        let a = Blake3Executor::new().run(&job, 0).await.unwrap();
        let b = Blake3Executor::new().run(&job, 0).await.unwrap();
        let other_shard = Blake3Executor::new().run(&job, 1).await.unwrap();
        let salted = Blake3Executor::new().with_salt("x").run(&job, 0).await.unwrap();

        assert_eq!(a.digest, b.digest);
        assert_ne!(a.digest, other_shard.digest);
        assert_ne!(a.digest, salted.digest);
    }

    #[tokio::test]
    async fn test_memory_publisher() {
        let publisher = MemoryPublisher::new();
        let output = ExecutionOutput::new(vec![1, 2, 3]);
        let published = publisher
            .publish(&ExecutionId::generate(), &output)
            .await
            .unwrap();

        assert_eq!(published.digest, output.digest);
        assert_eq!(publisher.get(&published.location).await, Some(vec![1, 2, 3]));

        let failing = MemoryPublisher::failing("disk full");
        assert!(matches!(
            failing.publish(&ExecutionId::generate(), &output).await,
            Err(ProtocolError::PublishFailed(_))
        ));
    }
}
