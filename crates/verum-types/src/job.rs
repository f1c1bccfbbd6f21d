use crate::{JobId, Result, ShardId, TypesError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Redundancy and agreement terms of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    /// Executions solicited per shard
    pub concurrency: usize,
    /// Absolute number of agreeing executions required for acceptance
    pub confidence: usize,
    /// Bids (accepting or not) to wait for before the bid window may close early
    pub min_bids: usize,
}

impl Default for Deal {
    fn default() -> Self {
        Self {
            concurrency: 1,
            confidence: 1,
            min_bids: 0,
        }
    }
}

impl Deal {
    pub fn new(concurrency: usize, confidence: usize, min_bids: usize) -> Result<Self> {
        let deal = Self {
            concurrency,
            confidence,
            min_bids,
        };
        deal.validate()?;
        Ok(deal)
    }

    /// Confidence from a fraction of concurrency, rounded up.
    pub fn with_confidence_ratio(concurrency: usize, ratio: f64, min_bids: usize) -> Result<Self> {
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(TypesError::InvalidDeal(format!(
                "confidence ratio {} must be in (0, 1]",
                ratio
            )));
        }
        let confidence = ((concurrency as f64) * ratio).ceil() as usize;
        Self::new(concurrency, confidence.max(1), min_bids)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(TypesError::InvalidDeal(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.confidence == 0 || self.confidence > self.concurrency {
            return Err(TypesError::InvalidDeal(format!(
                "confidence {} must be in 1..={}",
                self.confidence, self.concurrency
            )));
        }
        Ok(())
    }
}

/// How proposals for a shard are reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifierKind {
    #[default]
    HashAgreement,
    AcceptFirst,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_millis: u64,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub gpus: u32,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpu_millis: 100,
            memory_mb: 64,
            disk_mb: 0,
            gpus: 0,
        }
    }
}

impl ResourceRequirements {
    pub fn fits_within(&self, capacity: &ResourceRequirements) -> bool {
        self.cpu_millis <= capacity.cpu_millis
            && self.memory_mb <= capacity.memory_mb
            && self.disk_mb <= capacity.disk_mb
            && self.gpus <= capacity.gpus
    }
}

/// Work description. Opaque to the protocol beyond shard count,
/// admission inputs and the verifier choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub shard_count: u32,
    pub payload: Vec<u8>,
    /// Agreement policy; the requester default applies when absent
    #[serde(default)]
    pub verifier: Option<VerifierKind>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    /// Labels a compute participant must carry to bid
    #[serde(default)]
    pub node_selectors: BTreeMap<String, String>,
    /// Overall shard timeout; the requester default applies when absent
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl JobSpec {
    pub fn new(shard_count: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            shard_count,
            payload: payload.into(),
            verifier: None,
            resources: ResourceRequirements::default(),
            node_selectors: BTreeMap::new(),
            timeout_ms: None,
        }
    }

    pub fn with_verifier(mut self, verifier: VerifierKind) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequirements) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_selector(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.node_selectors.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// A submitted job. Immutable after creation; resubmission creates a new job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub client_id: String,
    pub spec: JobSpec,
    pub deal: Deal,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(client_id: impl Into<String>, spec: JobSpec, deal: Deal) -> Result<Self> {
        deal.validate()?;
        if spec.shard_count == 0 {
            return Err(TypesError::InvalidJobSpec(
                "shard count must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            id: JobId::generate(),
            client_id: client_id.into(),
            spec,
            deal,
            created_at: Utc::now(),
        })
    }

    pub fn shard(&self, index: u32) -> ShardId {
        ShardId::new(self.id.clone(), index)
    }

    pub fn shard_indices(&self) -> impl Iterator<Item = u32> {
        0..self.spec.shard_count
    }

    pub fn has_shard(&self, index: u32) -> bool {
        index < self.spec.shard_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deal_validation() {
        assert!(Deal::new(3, 2, 0).is_ok());
        assert!(Deal::new(0, 0, 0).is_err());
        assert!(Deal::new(2, 3, 0).is_err());
        assert!(Deal::new(2, 0, 0).is_err());
    }

    #[test]
    fn test_confidence_ratio_rounds_up() {
        let deal = Deal::with_confidence_ratio(3, 0.5, 0).unwrap();
        assert_eq!(deal.confidence, 2);
        let deal = Deal::with_confidence_ratio(4, 0.67, 0).unwrap();
        assert_eq!(deal.confidence, 3);
        assert!(Deal::with_confidence_ratio(3, 1.5, 0).is_err());
    }

    #[test]
    fn test_job_requires_shards() {
        let spec = JobSpec::new(0, b"noop".to_vec());
        assert!(Job::new("client", spec, Deal::default()).is_err());

        let job = Job::new("client", JobSpec::new(2, b"noop".to_vec()), Deal::default()).unwrap();
        assert_eq!(job.shard_indices().collect::<Vec<_>>(), vec![0, 1]);
        assert!(!job.has_shard(2));
    }

    #[test]
    fn test_resource_fit() {
        let small = ResourceRequirements::default();
        let big = ResourceRequirements {
            cpu_millis: 4000,
            memory_mb: 8192,
            disk_mb: 1024,
            gpus: 1,
        };
        assert!(small.fits_within(&big));
        assert!(!big.fits_within(&small));
    }
}
