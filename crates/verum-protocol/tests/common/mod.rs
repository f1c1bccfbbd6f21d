#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use verum_protocol::{
    AdmissionController, Blake3Executor, ComputeConfig, ComputeEndpoint, ComputeNode, Executor,
    FailingExecutor, JobEvent, JobStatus, MemoryPublisher, Network, Publisher, RequesterConfig,
    RequesterEndpoint, RequesterNode, ShardOutcome,
};
use verum_types::{Deal, ExecutionState, Job, JobSpec, NodeId};

pub const WAIT: Duration = Duration::from_secs(10);

/// Route protocol logs to the test harness; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn requester_id() -> NodeId {
    NodeId::new("requester").unwrap()
}

pub fn compute_id(i: usize) -> NodeId {
    NodeId::new(format!("compute-{}", i)).unwrap()
}

/// Short windows so scenarios finish quickly
pub fn fast_requester_config() -> RequesterConfig {
    RequesterConfig {
        bid_window_ms: 300,
        verification_timeout_ms: 3_000,
        cancel_grace_ms: 500,
        request_timeout_ms: 2_000,
        ..RequesterConfig::default()
    }
}

pub fn job(shards: u32, concurrency: usize, confidence: usize, min_bids: usize) -> Job {
    Job::new(
        "client",
        JobSpec::new(shards, b"integration payload".to_vec()),
        Deal::new(concurrency, confidence, min_bids).unwrap(),
    )
    .unwrap()
}

/// How one compute participant behaves
pub struct ParticipantSpec {
    pub config: ComputeConfig,
    pub executor: Arc<dyn Executor>,
    pub publisher: Arc<dyn Publisher>,
    pub admission: Option<AdmissionController>,
}

impl ParticipantSpec {
    pub fn honest() -> Self {
        Self {
            config: ComputeConfig::default(),
            executor: Arc::new(Blake3Executor::new()),
            publisher: Arc::new(MemoryPublisher::new()),
            admission: None,
        }
    }

    /// Produces a digest honest peers will not match
    pub fn dishonest(salt: &str) -> Self {
        Self {
            executor: Arc::new(Blake3Executor::new().with_salt(salt.as_bytes().to_vec())),
            ..Self::honest()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            executor: Arc::new(FailingExecutor::new(message)),
            ..Self::honest()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            executor: Arc::new(Blake3Executor::new().with_delay(delay)),
            ..Self::honest()
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_config(mut self, config: ComputeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_admission(mut self, admission: AdmissionController) -> Self {
        self.admission = Some(admission);
        self
    }
}

/// A requester and its compute participants joined over one network
pub struct Cluster<N: Network> {
    pub network: Arc<N>,
    pub requester: Arc<RequesterNode>,
    pub computes: Vec<Arc<ComputeNode>>,
    pub events: mpsc::UnboundedReceiver<JobEvent>,
}

impl<N: Network + 'static> Cluster<N> {
    pub async fn start(
        network: Arc<N>,
        config: RequesterConfig,
        participants: Vec<ParticipantSpec>,
    ) -> Self {
        init_tracing();
        let (events_tx, events) = mpsc::unbounded_channel();
        let compute_endpoint: Arc<dyn ComputeEndpoint> = network.clone();
        let requester = Arc::new(
            RequesterNode::new(requester_id(), config, compute_endpoint).with_events(events_tx),
        );
        network
            .register_requester(requester_id(), requester.clone())
            .await;

        let mut computes = Vec::with_capacity(participants.len());
        for (i, spec) in participants.into_iter().enumerate() {
            let id = compute_id(i);
            let requester_endpoint: Arc<dyn RequesterEndpoint> = network.clone();
            let node = match spec.admission {
                Some(admission) => ComputeNode::with_admission(
                    id.clone(),
                    spec.config,
                    admission,
                    requester_endpoint,
                    spec.executor,
                    spec.publisher,
                ),
                None => ComputeNode::new(
                    id.clone(),
                    spec.config,
                    requester_endpoint,
                    spec.executor,
                    spec.publisher,
                ),
            };
            let node = Arc::new(node);
            network.register_compute(id.clone(), node.clone()).await;
            requester.add_compute_peer(id).await;
            computes.push(node);
        }

        Self {
            network,
            requester,
            computes,
            events,
        }
    }

    pub fn compute(&self, node_id: &NodeId) -> &Arc<ComputeNode> {
        self.computes
            .iter()
            .find(|c| c.id() == node_id)
            .expect("unknown compute node")
    }

    /// Events emitted so far
    pub fn drain_events(&mut self) -> Vec<JobEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

/// Poll `check` until it holds or about two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// No shard may publish on fewer than `confidence` accepted results
pub fn assert_published_with_confidence(status: &JobStatus, confidence: usize) {
    for shard in &status.shards {
        if shard.outcome != ShardOutcome::Published {
            continue;
        }
        let accepted = shard
            .executions
            .iter()
            .filter(|e| e.reached(ExecutionState::ResultAccepted))
            .count();
        assert!(
            accepted >= confidence,
            "shard {} published with {} accepted executions, confidence {}",
            shard.index,
            accepted,
            confidence
        );
    }
}
