use crate::config::ComputeConfig;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use verum_types::{Job, ResourceRequirements};

/// Rejection reason when the participant holds its maximum number of executions
pub const AT_CAPACITY: &str = "at capacity";

/// Semantic strategies judge whether the job may run here at all; resource
/// strategies judge whether it fits right now. Semantic ones run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StrategyKind {
    Semantic,
    Resource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BidDecision {
    pub should_bid: bool,
    pub reason: String,
}

impl BidDecision {
    pub fn accept(reason: impl Into<String>) -> Self {
        Self {
            should_bid: true,
            reason: reason.into(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            should_bid: false,
            reason: reason.into(),
        }
    }
}

/// One admission policy
pub trait BidStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> StrategyKind;

    fn evaluate(&self, job: &Job) -> BidDecision;
}

/// Health input, typically derived from heartbeats
pub trait HealthSignal: Send + Sync {
    fn is_healthy(&self) -> bool;
}

/// Health flag flipped by the owner
#[derive(Debug)]
pub struct StaticHealth {
    healthy: AtomicBool,
}

impl StaticHealth {
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }
}

impl Default for StaticHealth {
    fn default() -> Self {
        Self::new(true)
    }
}

impl HealthSignal for StaticHealth {
    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

/// Every job node selector must equal the node label of the same key
pub struct LabelSelectorStrategy {
    labels: BTreeMap<String, String>,
}

impl LabelSelectorStrategy {
    pub fn new(labels: BTreeMap<String, String>) -> Self {
        Self { labels }
    }
}

impl BidStrategy for LabelSelectorStrategy {
    fn name(&self) -> &'static str {
        "label_selector"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Semantic
    }

    fn evaluate(&self, job: &Job) -> BidDecision {
        for (key, wanted) in &job.spec.node_selectors {
            match self.labels.get(key) {
                Some(actual) if actual == wanted => {}
                Some(actual) => {
                    return BidDecision::reject(format!(
                        "label {}={} does not match selector {}={}",
                        key, actual, key, wanted
                    ))
                }
                None => return BidDecision::reject(format!("missing label {}", key)),
            }
        }
        BidDecision::accept("node labels match job selectors")
    }
}

/// Job resource requirements must fit the node's capacity
pub struct ResourceFitStrategy {
    capacity: ResourceRequirements,
}

impl ResourceFitStrategy {
    pub fn new(capacity: ResourceRequirements) -> Self {
        Self { capacity }
    }
}

impl BidStrategy for ResourceFitStrategy {
    fn name(&self) -> &'static str {
        "resource_fit"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Resource
    }

    fn evaluate(&self, job: &Job) -> BidDecision {
        let wanted = &job.spec.resources;
        if wanted.fits_within(&self.capacity) {
            BidDecision::accept("resources fit")
        } else {
            BidDecision::reject(format!(
                "insufficient resources: job needs cpu={}m mem={}MB disk={}MB gpu={}, \
                 node offers cpu={}m mem={}MB disk={}MB gpu={}",
                wanted.cpu_millis,
                wanted.memory_mb,
                wanted.disk_mb,
                wanted.gpus,
                self.capacity.cpu_millis,
                self.capacity.memory_mb,
                self.capacity.disk_mb,
                self.capacity.gpus
            ))
        }
    }
}

pub struct NodeHealthStrategy {
    signal: Arc<dyn HealthSignal>,
}

impl NodeHealthStrategy {
    pub fn new(signal: Arc<dyn HealthSignal>) -> Self {
        Self { signal }
    }
}

impl BidStrategy for NodeHealthStrategy {
    fn name(&self) -> &'static str {
        "node_health"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Semantic
    }

    fn evaluate(&self, _job: &Job) -> BidDecision {
        if self.signal.is_healthy() {
            BidDecision::accept("node healthy")
        } else {
            BidDecision::reject("node unhealthy")
        }
    }
}

/// Compute-side admission: the strategy chain plus the concurrency cap
pub struct AdmissionController {
    strategies: Vec<Arc<dyn BidStrategy>>,
    max_concurrent_executions: usize,
}

impl AdmissionController {
    pub fn new(max_concurrent_executions: usize) -> Self {
        Self {
            strategies: Vec::new(),
            max_concurrent_executions,
        }
    }

    /// Controller with the stock strategies for a participant
    pub fn from_config(config: &ComputeConfig, health: Arc<dyn HealthSignal>) -> Self {
        Self::new(config.max_concurrent_executions)
            .with_strategy(Arc::new(NodeHealthStrategy::new(health)))
            .with_strategy(Arc::new(LabelSelectorStrategy::new(config.labels.clone())))
            .with_strategy(Arc::new(ResourceFitStrategy::new(config.capacity.clone())))
    }

    /// Add a strategy; ordering is by kind, then by insertion
    pub fn with_strategy(mut self, strategy: Arc<dyn BidStrategy>) -> Self {
        self.strategies.push(strategy);
        self.strategies.sort_by_key(|s| s.kind());
        self
    }

    pub fn max_concurrent_executions(&self) -> usize {
        self.max_concurrent_executions
    }

    /// Run the strategy chain. The first rejection wins.
    pub fn evaluate(&self, job: &Job) -> BidDecision {
        for strategy in &self.strategies {
            let decision = strategy.evaluate(job);
            if !decision.should_bid {
                debug!(
                    job_id = %job.id,
                    strategy = strategy.name(),
                    reason = %decision.reason,
                    "Bid strategy rejected job"
                );
                return decision;
            }
        }
        BidDecision::accept("all bid strategies passed")
    }

    /// Capacity check for one more execution given `held` already in flight
    pub fn check_capacity(&self, held: usize) -> BidDecision {
        if held >= self.max_concurrent_executions {
            BidDecision::reject(AT_CAPACITY)
        } else {
            BidDecision::accept("capacity available")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verum_types::{Deal, JobSpec};

    fn job(spec: JobSpec) -> Job {
        Job::new("client", spec, Deal::default()).unwrap()
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_label_selector() {
        let strategy = LabelSelectorStrategy::new(labels(&[("region", "eu"), ("arch", "x86")]));

        let matching = job(JobSpec::new(1, vec![]).with_selector("region", "eu"));
        assert!(strategy.evaluate(&matching).should_bid);

        let wrong = job(JobSpec::new(1, vec![]).with_selector("region", "us"));
        assert!(!strategy.evaluate(&wrong).should_bid);

        let missing = job(JobSpec::new(1, vec![]).with_selector("gpu", "a100"));
        assert_eq!(strategy.evaluate(&missing).reason, "missing label gpu");
    }

    #[test]
    fn test_resource_fit() {
        let strategy = ResourceFitStrategy::new(ResourceRequirements::default());
        let big = job(JobSpec::new(1, vec![]).with_resources(ResourceRequirements {
            gpus: 1,
            ..Default::default()
        }));
        let decision = strategy.evaluate(&big);
        assert!(!decision.should_bid);
        assert!(decision.reason.starts_with("insufficient resources"));
    }

    #[test]
    fn test_semantic_strategies_run_first() {
        let health = Arc::new(StaticHealth::new(false));
        let controller = AdmissionController::new(4)
            .with_strategy(Arc::new(ResourceFitStrategy::new(ResourceRequirements {
                cpu_millis: 0,
                ..Default::default()
            })))
            .with_strategy(Arc::new(NodeHealthStrategy::new(health.clone())));

        let j = job(JobSpec::new(1, vec![]));
        assert_eq!(controller.evaluate(&j).reason, "node unhealthy");

        health.set_healthy(true);
        assert!(controller.evaluate(&j).reason.starts_with("insufficient resources"));
    }

    #[test]
    fn test_capacity() {
        let controller = AdmissionController::new(2);
        assert!(controller.check_capacity(1).should_bid);
        let full = controller.check_capacity(2);
        assert!(!full.should_bid);
        assert_eq!(full.reason, AT_CAPACITY);
    }

    #[test]
    fn test_from_config_accepts_plain_job() {
        let controller =
            AdmissionController::from_config(&ComputeConfig::default(), Arc::new(StaticHealth::default()));
        assert!(controller.evaluate(&job(JobSpec::new(1, vec![1]))).should_bid);
    }
}
