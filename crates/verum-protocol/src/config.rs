use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use verum_types::{ResourceRequirements, VerifierKind};

/// What to do when the bid window closes with fewer than `MinBids` bids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialBidPolicy {
    /// Run with whatever accepting bids arrived (possibly none)
    #[default]
    ProceedWithAvailable,
    /// Fail the shard with "not enough bids"
    FailShard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequesterConfig {
    /// How long bids are collected per job
    pub bid_window_ms: u64,
    /// How long proposals are awaited once bids are accepted
    pub verification_timeout_ms: u64,
    /// How long a cancelled execution's acknowledgement is awaited
    pub cancel_grace_ms: u64,
    /// Timeout for one request/response exchange with a compute participant
    pub request_timeout_ms: u64,
    pub partial_bid_policy: PartialBidPolicy,
    /// Shard timeout when the job spec carries none
    pub default_job_timeout_ms: u64,
    /// How long finished jobs are kept before eviction
    pub eviction_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub default_verifier: VerifierKind,
    /// Ask at most this many times `max(MinBids, Concurrency)` ranked nodes
    pub over_ask_factor: usize,
    /// Refuse a job up front when fewer than `max(MinBids, Concurrency)`
    /// nodes qualify
    pub require_enough_nodes: bool,
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            bid_window_ms: 2_000,
            verification_timeout_ms: 30_000,
            cancel_grace_ms: 1_000,
            request_timeout_ms: 5_000,
            partial_bid_policy: PartialBidPolicy::default(),
            default_job_timeout_ms: 300_000, // 5 minutes
            eviction_timeout_ms: 300_000,
            sweep_interval_ms: 10_000,
            default_verifier: VerifierKind::HashAgreement,
            over_ask_factor: 3,
            require_enough_nodes: false,
        }
    }
}

impl RequesterConfig {
    pub fn bid_window(&self) -> Duration {
        Duration::from_millis(self.bid_window_ms)
    }

    pub fn verification_timeout(&self) -> Duration {
        Duration::from_millis(self.verification_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn default_job_timeout(&self) -> Duration {
        Duration::from_millis(self.default_job_timeout_ms)
    }

    pub fn eviction_timeout(&self) -> Duration {
        Duration::from_millis(self.eviction_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Executions held at once (bidding, accepted or running)
    pub max_concurrent_executions: usize,
    /// Labels matched against job node selectors
    pub labels: BTreeMap<String, String>,
    /// Resources this participant offers
    pub capacity: ResourceRequirements,
    /// Execution timeout when the job spec carries none
    pub execution_timeout_ms: u64,
    /// How long a bid may wait for the requester's answer before its slot
    /// is reclaimed
    pub bid_timeout_ms: u64,
    /// How long finished executions are kept before eviction
    pub eviction_timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 4,
            labels: BTreeMap::new(),
            capacity: ResourceRequirements {
                cpu_millis: 4_000,
                memory_mb: 8_192,
                disk_mb: 10_240,
                gpus: 0,
            },
            execution_timeout_ms: 60_000,
            bid_timeout_ms: 60_000,
            eviction_timeout_ms: 300_000,
            sweep_interval_ms: 10_000,
        }
    }
}

impl ComputeConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn bid_timeout(&self) -> Duration {
        Duration::from_millis(self.bid_timeout_ms)
    }

    pub fn eviction_timeout(&self) -> Duration {
        Duration::from_millis(self.eviction_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Inbound envelopes buffered per peer
    pub queue_depth: usize,
    /// Envelopes handled concurrently per peer
    pub workers: usize,
    pub request_timeout_ms: u64,
    /// Deliver every callback twice to exercise at-least-once handling
    pub duplicate_callbacks: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1_024,
            workers: 8,
            request_timeout_ms: 5_000,
            duplicate_callbacks: false,
        }
    }
}

impl RelayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: RequesterConfig =
            serde_json::from_str(r#"{"bid_window_ms": 50, "partial_bid_policy": "fail_shard"}"#)
                .unwrap();
        assert_eq!(config.bid_window(), Duration::from_millis(50));
        assert_eq!(config.partial_bid_policy, PartialBidPolicy::FailShard);
        assert_eq!(config.cancel_grace_ms, RequesterConfig::default().cancel_grace_ms);
    }
}
