//! One requester and a set of compute participants in a single process.

use crate::config::{DevstackConfig, FaultKind, NodeConfig, TransportKind};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use verum_protocol::{
    Blake3Executor, ComputeEndpoint, ComputeNode, Executor, FailingExecutor, InProcessNetwork,
    JobStatus, MemoryPublisher, Network, Publisher, RelayNetwork, RequesterEndpoint,
    RequesterNode,
};
use verum_types::{Deal, ExecutionState, Job, JobSpec, NodeId};

/// A running devstack. Holds every node; the network only keeps weak
/// references.
pub struct Devstack<N: Network> {
    pub network: Arc<N>,
    pub requester: Arc<RequesterNode>,
    pub computes: Vec<Arc<ComputeNode>>,
}

fn backends(devstack: &DevstackConfig, index: usize) -> (Arc<dyn Executor>, Arc<dyn Publisher>) {
    let delay = Duration::from_millis(devstack.execution_delay_ms);
    let honest = Blake3Executor::new().with_delay(delay);
    let faulty = index >= devstack.compute_nodes.saturating_sub(devstack.faulty_nodes);
    let publisher: Arc<dyn Publisher> = Arc::new(MemoryPublisher::new());

    if !faulty {
        return (Arc::new(honest), publisher);
    }
    match devstack.fault {
        FaultKind::WrongResult => (
            Arc::new(honest.with_salt(format!("faulty-{}", index).into_bytes())),
            publisher,
        ),
        FaultKind::Crash => (
            Arc::new(FailingExecutor::new("simulated crash")),
            publisher,
        ),
        FaultKind::PublishFailure => (
            Arc::new(honest),
            Arc::new(MemoryPublisher::failing("simulated storage outage")),
        ),
    }
}

impl<N: Network + 'static> Devstack<N> {
    pub async fn start(network: Arc<N>, config: &NodeConfig) -> Result<Self> {
        let requester_id = NodeId::new("requester")?;
        let compute_endpoint: Arc<dyn ComputeEndpoint> = network.clone();
        let requester = Arc::new(RequesterNode::new(
            requester_id.clone(),
            config.requester.clone(),
            compute_endpoint,
        ));
        network
            .register_requester(requester_id, requester.clone())
            .await;

        let mut computes = Vec::with_capacity(config.devstack.compute_nodes);
        for index in 0..config.devstack.compute_nodes {
            let id = NodeId::new(format!("compute-{}", index))?;
            let (executor, publisher) = backends(&config.devstack, index);
            let requester_endpoint: Arc<dyn RequesterEndpoint> = network.clone();
            let node = Arc::new(ComputeNode::new(
                id.clone(),
                config.compute.clone(),
                requester_endpoint,
                executor,
                publisher,
            ));
            network.register_compute(id.clone(), node.clone()).await;
            requester.add_compute_peer(id).await;
            computes.push(node);
        }

        info!(
            compute_nodes = computes.len(),
            faulty_nodes = config.devstack.faulty_nodes,
            fault = ?config.devstack.fault,
            "✨ Devstack started"
        );

        Ok(Self {
            network,
            requester,
            computes,
        })
    }

    /// Submit the configured job and wait for its terminal status
    pub async fn run_job(&self, devstack: &DevstackConfig) -> Result<JobStatus> {
        let deal = Deal::new(devstack.concurrency, devstack.confidence, devstack.min_bids)?;
        let spec = JobSpec::new(devstack.shards, devstack.payload.clone().into_bytes());
        let job = Job::new("devstack", spec, deal)?;

        let mut sweepers = vec![self.requester.spawn_sweeper()];
        sweepers.extend(self.computes.iter().map(|node| node.spawn_sweeper()));
        let status = async {
            let job_id = self.requester.submit_job(job).await?;
            self.requester
                .wait_for_completion(&job_id, Duration::from_millis(devstack.wait_timeout_ms))
                .await
                .with_context(|| format!("waiting for job {}", job_id))
        }
        .await;
        for sweeper in sweepers {
            sweeper.abort();
        }
        status
    }
}

/// Start a devstack on the configured transport and run one job
pub async fn run(config: &NodeConfig) -> Result<JobStatus> {
    config.validate()?;
    match config.devstack.transport {
        TransportKind::InProcess => {
            let stack = Devstack::start(InProcessNetwork::new(), config).await?;
            stack.run_job(&config.devstack).await
        }
        TransportKind::Relay => {
            let stack = Devstack::start(RelayNetwork::new(config.relay.clone()), config).await?;
            stack.run_job(&config.devstack).await
        }
    }
}

/// Human-readable outcome, one line per shard and execution
pub fn render(status: &JobStatus) -> String {
    let mut out = format!("job {} finished: {}\n", status.job_id, status.state);
    for shard in &status.shards {
        out.push_str(&format!("  shard {}: {}", shard.index, shard.outcome));
        if let Some(reason) = &shard.reason {
            out.push_str(&format!(" ({})", reason));
        }
        out.push('\n');
        for execution in &shard.executions {
            out.push_str(&format!(
                "    {} on {}: {}",
                execution.id.short(),
                execution.node_id,
                execution.state
            ));
            match execution.state {
                ExecutionState::Published => {
                    if let Some(published) = &execution.published_result {
                        out.push_str(&format!(" -> {}", published.location));
                    }
                }
                _ => {
                    if let Some(reason) = &execution.failure_reason {
                        out.push_str(&format!(" ({})", reason));
                    }
                }
            }
            out.push('\n');
        }
    }
    out
}
