use crate::admission::{AdmissionController, HealthSignal, StaticHealth};
use crate::config::ComputeConfig;
use crate::endpoint::{ComputeEndpoint, RequesterEndpoint};
use crate::executor::{ExecutionOutput, Executor, Publisher};
use crate::messages::*;
use crate::registry::{ExecutionRegistry, TransitionOutcome, UpdateRequest};
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use verum_types::{
    Execution, ExecutionId, ExecutionState, Job, JobId, NodeId, RoutingMetadata,
};

/// The answer given to one bid request, kept so repeated asks get it again
#[derive(Debug, Clone)]
struct HeldBid {
    response: BidResponse,
    at: Instant,
}

/// What a compute-side sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputeSweepReport {
    /// Bids never answered by the requester, now canceled
    pub expired_bids: Vec<ExecutionId>,
    pub evicted: usize,
}

/// A compute participant.
///
/// Keeps a private mirror of each execution it bid on, runs accepted
/// executions under a bounded number of slots, and reports back through the
/// injected [`RequesterEndpoint`]. Cloning shares all state.
#[derive(Clone)]
pub struct ComputeNode {
    id: NodeId,
    config: ComputeConfig,
    registry: Arc<ExecutionRegistry>,
    admission: Arc<AdmissionController>,
    executor: Arc<dyn Executor>,
    publisher: Arc<dyn Publisher>,
    requester: Arc<dyn RequesterEndpoint>,
    jobs: Arc<RwLock<HashMap<ExecutionId, Job>>>,
    bids: Arc<RwLock<HashMap<(JobId, u32), HeldBid>>>,
    artifacts: Arc<RwLock<HashMap<ExecutionId, ExecutionOutput>>>,
    running: Arc<Mutex<HashMap<ExecutionId, (u64, AbortHandle)>>>,
    next_task: Arc<AtomicU64>,
    slots: Arc<Semaphore>,
    admit_lock: Arc<Mutex<()>>,
}

impl ComputeNode {
    pub fn new(
        id: NodeId,
        config: ComputeConfig,
        requester: Arc<dyn RequesterEndpoint>,
        executor: Arc<dyn Executor>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let health: Arc<dyn HealthSignal> = Arc::new(StaticHealth::default());
        let admission = AdmissionController::from_config(&config, health);
        Self::with_admission(id, config, admission, requester, executor, publisher)
    }

    pub fn with_admission(
        id: NodeId,
        config: ComputeConfig,
        admission: AdmissionController,
        requester: Arc<dyn RequesterEndpoint>,
        executor: Arc<dyn Executor>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let slots = config.max_concurrent_executions.max(1);
        Self {
            id,
            config,
            registry: Arc::new(ExecutionRegistry::new()),
            admission: Arc::new(admission),
            executor,
            publisher,
            requester,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            bids: Arc::new(RwLock::new(HashMap::new())),
            artifacts: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(Mutex::new(HashMap::new())),
            next_task: Arc::new(AtomicU64::new(0)),
            slots: Arc::new(Semaphore::new(slots)),
            admit_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    pub async fn execution(&self, id: &ExecutionId) -> Result<Execution> {
        self.registry.get(id).await
    }

    /// Outputs held for executions not yet published, rejected or canceled
    pub async fn held_artifacts(&self) -> usize {
        self.artifacts.read().await.len()
    }

    /// Look up an execution and drop the message if its envelope does not
    /// come from the owning requester to this node.
    async fn checked_execution(
        &self,
        execution_id: &ExecutionId,
        routing: &RoutingMetadata,
    ) -> Result<Execution> {
        let execution = self.registry.get(execution_id).await?;
        if !routing.matches(&execution.requester_id, &self.id) {
            warn!(
                node_id = %self.id,
                execution_id = %execution_id,
                source = %routing.source_peer_id,
                target = %routing.target_peer_id,
                "⚠️ Routing mismatch, message dropped"
            );
            return Err(ProtocolError::RoutingMismatch {
                execution_id: execution_id.to_string(),
                expected_source: execution.requester_id.to_string(),
                expected_target: self.id.to_string(),
                actual_source: routing.source_peer_id.to_string(),
                actual_target: routing.target_peer_id.to_string(),
            });
        }
        Ok(execution)
    }

    fn ack(
        &self,
        routing: &RoutingMetadata,
        execution_id: ExecutionId,
        outcome: &TransitionOutcome,
    ) -> ExecutionAck {
        ExecutionAck {
            routing: routing.reply(),
            execution_id,
            state: outcome.state(),
            applied: outcome.is_applied(),
        }
    }

    async fn release(&self, execution_id: &ExecutionId) {
        self.artifacts.write().await.remove(execution_id);
        self.jobs.write().await.remove(execution_id);
    }

    fn requester_routing(&self, execution: &Execution) -> RoutingMetadata {
        RoutingMetadata::new(self.id.clone(), execution.requester_id.clone())
    }

    async fn start_run(&self, execution: Execution) -> Result<()> {
        let job = self
            .jobs
            .read()
            .await
            .get(&execution.id)
            .cloned()
            .ok_or_else(|| ProtocolError::JobNotFound(execution.job_id.to_string()))?;

        let node = self.clone();
        self.spawn_tracked(execution.id.clone(), async move {
            node.run_execution(execution, job).await
        })
        .await;
        Ok(())
    }

    /// Publishing is abortable work like running: cancellation stops it
    async fn start_publish(&self, execution: Execution) {
        let node = self.clone();
        self.spawn_tracked(execution.id.clone(), async move { node.publish(execution).await })
            .await;
    }

    /// Spawn work for an execution that cancellation can abort. A task only
    /// clears its own entry, never a later one for the same execution.
    async fn spawn_tracked<F>(&self, execution_id: ExecutionId, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.next_task.fetch_add(1, Ordering::Relaxed);
        // Insert before the task can finish and clear its entry.
        let mut running = self.running.lock().await;
        let tasks = self.running.clone();
        let id = execution_id.clone();
        let handle = tokio::spawn(async move {
            work.await;
            let mut tasks = tasks.lock().await;
            if matches!(tasks.get(&id), Some((owner, _)) if *owner == token) {
                tasks.remove(&id);
            }
        });
        running.insert(execution_id, (token, handle.abort_handle()));
    }

    async fn abort_running(&self, execution_id: &ExecutionId) -> Option<AbortHandle> {
        self.running
            .lock()
            .await
            .remove(execution_id)
            .map(|(_, handle)| handle)
    }

    async fn run_execution(&self, execution: Execution, job: Job) {
        let _permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let outcome = self
            .registry
            .update_state(
                UpdateRequest::new(execution.id.clone(), ExecutionState::Running, "execution started")
                    .expecting(&[ExecutionState::BidAccepted]),
            )
            .await;
        if !matches!(outcome, Ok(ref o) if o.is_applied()) {
            return;
        }

        info!(
            node_id = %self.id,
            execution_id = %execution.id,
            job_id = %execution.job_id,
            shard = execution.shard_index,
            "⚙️ Execution started"
        );

        let timeout = job.spec.timeout().unwrap_or_else(|| self.config.execution_timeout());
        let result = match tokio::time::timeout(timeout, self.executor.run(&job, execution.shard_index)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::timeout("execution", timeout)),
        };

        let routing = self.requester_routing(&execution);
        match result {
            Ok(output) => {
                let digest = output.digest;
                self.artifacts
                    .write()
                    .await
                    .insert(execution.id.clone(), output);
                let outcome = self
                    .registry
                    .update_state_with(
                        UpdateRequest::new(
                            execution.id.clone(),
                            ExecutionState::ResultProposed,
                            "result proposed",
                        )
                        .expecting(&[ExecutionState::Running]),
                        |e| e.result_proposal = Some(digest),
                    )
                    .await;
                if !matches!(outcome, Ok(ref o) if o.is_applied()) {
                    self.release(&execution.id).await;
                    return;
                }

                info!(
                    node_id = %self.id,
                    execution_id = %execution.id,
                    digest = %digest,
                    "📤 Result proposed"
                );

                let callback = RunComplete {
                    routing,
                    execution_id: execution.id.clone(),
                    proposal: digest,
                };
                if let Err(e) = self.requester.on_run_complete(callback).await {
                    warn!(execution_id = %execution.id, error = %e, "Run complete callback failed");
                }
            }
            Err(e) => self.fail(&execution, routing, e.to_string()).await,
        }
    }

    async fn fail(&self, execution: &Execution, routing: RoutingMetadata, error: String) {
        let reason = error.clone();
        let outcome = self
            .registry
            .update_state_with(
                UpdateRequest::new(execution.id.clone(), ExecutionState::ComputeError, error.clone()),
                |e| e.failure_reason = Some(reason),
            )
            .await;
        self.release(&execution.id).await;
        if !matches!(outcome, Ok(ref o) if o.is_applied()) {
            return;
        }

        warn!(
            node_id = %self.id,
            execution_id = %execution.id,
            reason = %error,
            "❌ Execution failed"
        );

        let callback = ComputeFailure {
            routing,
            execution_id: execution.id.clone(),
            error,
        };
        if let Err(e) = self.requester.on_compute_failure(callback).await {
            warn!(execution_id = %execution.id, error = %e, "Compute failure callback failed");
        }
    }

    async fn publish(&self, execution: Execution) {
        match self.registry.state(&execution.id).await {
            Ok(ExecutionState::ResultAccepted) => {}
            Ok(state) => {
                debug!(
                    node_id = %self.id,
                    execution_id = %execution.id,
                    state = %state,
                    "Publish skipped"
                );
                return;
            }
            Err(_) => return,
        }

        let routing = self.requester_routing(&execution);
        let output = self.artifacts.read().await.get(&execution.id).cloned();
        let output = match output {
            Some(output) => output,
            None => {
                self.fail(&execution, routing, "publish failed: no result held".to_string())
                    .await;
                return;
            }
        };

        let published = match self.publisher.publish(&execution.id, &output).await {
            Ok(published) => published,
            Err(e) => {
                let reason = match e {
                    ProtocolError::PublishFailed(message) => message,
                    other => other.to_string(),
                };
                self.fail(&execution, routing, format!("publish failed: {}", reason))
                    .await;
                return;
            }
        };

        let descriptor = published.clone();
        let outcome = self
            .registry
            .update_state_with(
                UpdateRequest::new(execution.id.clone(), ExecutionState::Published, "result published")
                    .expecting(&[ExecutionState::ResultAccepted]),
                |e| e.published_result = Some(descriptor),
            )
            .await;
        self.release(&execution.id).await;
        if !matches!(outcome, Ok(ref o) if o.is_applied()) {
            return;
        }

        info!(
            node_id = %self.id,
            execution_id = %execution.id,
            location = %published.location,
            "📦 Result published"
        );

        let callback = PublishComplete {
            routing,
            execution_id: execution.id.clone(),
            published,
        };
        if let Err(e) = self.requester.on_publish_complete(callback).await {
            warn!(execution_id = %execution.id, error = %e, "Publish complete callback failed");
        }
    }

    /// Cancel bids the requester never answered within `bid_timeout` so
    /// their slots count as free again, and forget executions that ended
    /// longer ago than `eviction_timeout`.
    pub async fn sweep(&self) -> ComputeSweepReport {
        let now = Utc::now();
        let age = |at: DateTime<Utc>| (now - at).to_std().unwrap_or_default();
        let mut report = ComputeSweepReport::default();
        let mut evict = Vec::new();

        for execution in self.registry.all().await {
            if execution.state == ExecutionState::Bidding
                && age(execution.updated_at) >= self.config.bid_timeout()
            {
                let reason = "bid not answered".to_string();
                let failure = reason.clone();
                let outcome = self
                    .registry
                    .update_state_with(
                        UpdateRequest::new(execution.id.clone(), ExecutionState::Canceled, reason)
                            .expecting(&[ExecutionState::Bidding]),
                        |e| e.failure_reason = Some(failure),
                    )
                    .await;
                if matches!(outcome, Ok(ref o) if o.is_applied()) {
                    self.release(&execution.id).await;
                    debug!(node_id = %self.id, execution_id = %execution.id, "Unanswered bid expired");
                    report.expired_bids.push(execution.id);
                }
            } else if execution.is_terminal()
                && age(execution.updated_at) >= self.config.eviction_timeout()
            {
                evict.push(execution.id);
            }
        }

        if !evict.is_empty() {
            for id in &evict {
                self.release(id).await;
            }
            report.evicted = self.registry.remove(&evict).await;
        }

        // Bid answers leave with their execution; declined ones age out.
        let evicted: HashSet<&ExecutionId> = evict.iter().collect();
        let eviction = self.config.eviction_timeout();
        self.bids
            .write()
            .await
            .retain(|_, held| match &held.response.execution_id {
                Some(id) => !evicted.contains(id),
                None => held.at.elapsed() < eviction,
            });

        if !report.expired_bids.is_empty() || report.evicted > 0 {
            info!(
                node_id = %self.id,
                expired_bids = report.expired_bids.len(),
                evicted = report.evicted,
                "🧹 Compute sweep finished"
            );
        }
        report
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval`
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let node = self.clone();
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                node.sweep().await;
            }
        })
    }
}

#[async_trait]
impl ComputeEndpoint for ComputeNode {
    async fn ask_for_bid(&self, request: AskForBidRequest) -> Result<AskForBidResponse> {
        let AskForBidRequest {
            routing,
            job,
            shard_indices,
        } = request;

        if routing.target_peer_id != self.id {
            return Err(ProtocolError::RoutingMismatch {
                execution_id: String::new(),
                expected_source: routing.source_peer_id.to_string(),
                expected_target: self.id.to_string(),
                actual_source: routing.source_peer_id.to_string(),
                actual_target: routing.target_peer_id.to_string(),
            });
        }
        job.deal.validate()?;
        if shard_indices.is_empty() {
            return Err(ProtocolError::InvalidBidRequest(
                "no shards requested".to_string(),
            ));
        }
        if let Some(index) = shard_indices.iter().find(|i| !job.has_shard(**i)) {
            return Err(ProtocolError::InvalidBidRequest(format!(
                "job {} has no shard {}",
                job.id, index
            )));
        }

        let decision = self.admission.evaluate(&job);

        let _admit = self.admit_lock.lock().await;
        let mut held = self.registry.count_active().await;
        let mut bids = Vec::with_capacity(shard_indices.len());

        for shard_index in shard_indices {
            let key = (job.id.clone(), shard_index);
            if let Some(existing) = self.bids.read().await.get(&key) {
                debug!(
                    node_id = %self.id,
                    job_id = %job.id,
                    shard = shard_index,
                    "Duplicate bid request, returning earlier response"
                );
                bids.push(existing.response.clone());
                continue;
            }

            let capacity = self.admission.check_capacity(held);
            let response = if !decision.should_bid {
                BidResponse {
                    shard_index,
                    execution_id: None,
                    accepted: false,
                    reason: decision.reason.clone(),
                }
            } else if !capacity.should_bid {
                BidResponse {
                    shard_index,
                    execution_id: None,
                    accepted: false,
                    reason: capacity.reason,
                }
            } else {
                let execution = Execution::new(
                    ExecutionId::generate(),
                    job.id.clone(),
                    shard_index,
                    self.id.clone(),
                    routing.source_peer_id.clone(),
                );
                let execution_id = execution.id.clone();
                self.registry.create(execution).await?;
                self.registry
                    .update_state(UpdateRequest::new(
                        execution_id.clone(),
                        ExecutionState::Bidding,
                        "bid submitted",
                    ))
                    .await?;
                self.jobs
                    .write()
                    .await
                    .insert(execution_id.clone(), job.clone());
                held += 1;

                BidResponse {
                    shard_index,
                    execution_id: Some(execution_id),
                    accepted: true,
                    reason: decision.reason.clone(),
                }
            };

            info!(
                node_id = %self.id,
                job_id = %job.id,
                shard = shard_index,
                accepted = response.accepted,
                reason = %response.reason,
                "🙋 Bid decided"
            );
            self.bids.write().await.insert(
                key,
                HeldBid {
                    response: response.clone(),
                    at: Instant::now(),
                },
            );
            bids.push(response);
        }

        Ok(AskForBidResponse {
            routing: routing.reply(),
            bids,
        })
    }

    async fn bid_accepted(&self, request: BidAcceptedRequest) -> Result<ExecutionAck> {
        let execution = self
            .checked_execution(&request.execution_id, &request.routing)
            .await?;

        let outcome = self
            .registry
            .update_state(
                UpdateRequest::new(
                    request.execution_id.clone(),
                    ExecutionState::BidAccepted,
                    "bid accepted by requester",
                )
                .expecting(&[ExecutionState::Bidding]),
            )
            .await?;

        if outcome.is_applied() {
            self.start_run(execution).await?;
        }
        Ok(self.ack(&request.routing, request.execution_id, &outcome))
    }

    async fn bid_rejected(&self, request: BidRejectedRequest) -> Result<ExecutionAck> {
        self.checked_execution(&request.execution_id, &request.routing)
            .await?;

        let outcome = self
            .registry
            .update_state(
                UpdateRequest::new(
                    request.execution_id.clone(),
                    ExecutionState::BidRejected,
                    request.justification.clone(),
                )
                .expecting(&[ExecutionState::Bidding]),
            )
            .await?;

        if outcome.is_applied() {
            self.release(&request.execution_id).await;
            debug!(
                node_id = %self.id,
                execution_id = %request.execution_id,
                reason = %request.justification,
                "Bid rejected by requester"
            );
        }
        Ok(self.ack(&request.routing, request.execution_id, &outcome))
    }

    async fn result_accepted(&self, request: ResultAcceptedRequest) -> Result<ExecutionAck> {
        self.checked_execution(&request.execution_id, &request.routing)
            .await?;

        let outcome = self
            .registry
            .update_state(
                UpdateRequest::new(
                    request.execution_id.clone(),
                    ExecutionState::ResultAccepted,
                    "result accepted by requester",
                )
                .expecting(&[ExecutionState::ResultProposed]),
            )
            .await?;

        if outcome.is_applied() {
            let execution = self.registry.get(&request.execution_id).await?;
            self.start_publish(execution).await;
        }
        Ok(self.ack(&request.routing, request.execution_id, &outcome))
    }

    async fn result_rejected(&self, request: ResultRejectedRequest) -> Result<ExecutionAck> {
        self.checked_execution(&request.execution_id, &request.routing)
            .await?;

        let outcome = self
            .registry
            .update_state(
                UpdateRequest::new(
                    request.execution_id.clone(),
                    ExecutionState::ResultRejected,
                    request.justification.clone(),
                )
                .expecting(&[ExecutionState::ResultProposed]),
            )
            .await?;

        if outcome.is_applied() {
            self.release(&request.execution_id).await;
            info!(
                node_id = %self.id,
                execution_id = %request.execution_id,
                reason = %request.justification,
                "🗑️ Result rejected, artifacts released"
            );
        }
        Ok(self.ack(&request.routing, request.execution_id, &outcome))
    }

    async fn cancel_execution(
        &self,
        request: CancelExecutionRequest,
    ) -> Result<CancelExecutionResponse> {
        let execution = self
            .checked_execution(&request.execution_id, &request.routing)
            .await?;

        let outcome = self
            .registry
            .update_state(UpdateRequest::new(
                request.execution_id.clone(),
                ExecutionState::Canceled,
                request.justification.clone(),
            ))
            .await?;

        let result = match outcome {
            TransitionOutcome::Applied { from, .. } => CancelResult::Canceled { previous: from },
            other => CancelResult::AlreadyTerminal {
                state: other.state(),
            },
        };

        if let CancelResult::Canceled { previous } = result {
            if let Some(handle) = self.abort_running(&request.execution_id).await {
                handle.abort();
            }
            self.release(&request.execution_id).await;

            info!(
                node_id = %self.id,
                execution_id = %request.execution_id,
                previous = %previous,
                reason = %request.justification,
                "🛑 Execution canceled"
            );

            let callback = CancelComplete {
                routing: self.requester_routing(&execution),
                execution_id: request.execution_id.clone(),
            };
            let requester = self.requester.clone();
            tokio::spawn(async move {
                if let Err(e) = requester.on_cancel_complete(callback).await {
                    debug!(error = %e, "Cancel complete callback failed");
                }
            });
        }

        Ok(CancelExecutionResponse {
            routing: request.routing.reply(),
            execution_id: request.execution_id,
            result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AT_CAPACITY;
    use crate::executor::{Blake3Executor, MemoryPublisher};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use verum_types::{Deal, JobSpec, PublishedResult};

    /// Records callbacks instead of acting on them
    #[derive(Default)]
    struct RecordingRequester {
        proposals: Mutex<Vec<RunComplete>>,
        cancels: Mutex<Vec<CancelComplete>>,
    }

    #[async_trait]
    impl RequesterEndpoint for RecordingRequester {
        async fn on_run_complete(&self, callback: RunComplete) -> Result<CallbackAck> {
            self.proposals.lock().await.push(callback);
            Ok(CallbackAck::Applied {
                state: ExecutionState::ResultProposed,
            })
        }

        async fn on_publish_complete(&self, _callback: PublishComplete) -> Result<CallbackAck> {
            Ok(CallbackAck::Applied {
                state: ExecutionState::Published,
            })
        }

        async fn on_cancel_complete(&self, callback: CancelComplete) -> Result<CallbackAck> {
            self.cancels.lock().await.push(callback);
            Ok(CallbackAck::Applied {
                state: ExecutionState::Canceled,
            })
        }

        async fn on_compute_failure(&self, _callback: ComputeFailure) -> Result<CallbackAck> {
            Ok(CallbackAck::Applied {
                state: ExecutionState::ComputeError,
            })
        }
    }

    fn requester_id() -> NodeId {
        NodeId::new("requester").unwrap()
    }

    /// Counts publishes that ran to completion
    struct SlowPublisher {
        delay: Duration,
        completed: AtomicUsize,
    }

    #[async_trait]
    impl Publisher for SlowPublisher {
        async fn publish(
            &self,
            _execution_id: &ExecutionId,
            output: &ExecutionOutput,
        ) -> Result<PublishedResult> {
            tokio::time::sleep(self.delay).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(PublishedResult {
                location: "slow://done".to_string(),
                digest: output.digest,
                published_at: Utc::now(),
            })
        }
    }

    fn node(executor: Blake3Executor) -> (ComputeNode, Arc<RecordingRequester>) {
        node_with(
            ComputeConfig::default(),
            executor,
            Arc::new(MemoryPublisher::new()),
        )
    }

    fn node_with(
        config: ComputeConfig,
        executor: Blake3Executor,
        publisher: Arc<dyn Publisher>,
    ) -> (ComputeNode, Arc<RecordingRequester>) {
        let requester = Arc::new(RecordingRequester::default());
        let node = ComputeNode::new(
            NodeId::new("compute-1").unwrap(),
            config,
            requester.clone(),
            Arc::new(executor),
            publisher,
        );
        (node, requester)
    }

    fn routing(node: &ComputeNode) -> RoutingMetadata {
        RoutingMetadata::new(requester_id(), node.id().clone())
    }

    fn ask(job: &Job, shards: Vec<u32>) -> AskForBidRequest {
        AskForBidRequest {
            routing: RoutingMetadata::new(requester_id(), NodeId::new("compute-1").unwrap()),
            job: job.clone(),
            shard_indices: shards,
        }
    }

    fn job() -> Job {
        Job::new("client", JobSpec::new(2, b"payload".to_vec()), Deal::default()).unwrap()
    }

    #[tokio::test]
    async fn test_repeated_ask_returns_same_bid() {
        let (node, _) = node(Blake3Executor::new());
        let job = job();

        let first = node.ask_for_bid(ask(&job, vec![0, 1])).await.unwrap();
        let second = node.ask_for_bid(ask(&job, vec![0, 1])).await.unwrap();

        assert_eq!(first.bids, second.bids);
        assert!(first.bids.iter().all(|b| b.accepted));
        assert_eq!(node.registry().len().await, 2);
        assert_eq!(first.routing.target_peer_id, requester_id());
    }

    #[tokio::test]
    async fn test_invalid_bid_requests() {
        let (node, _) = node(Blake3Executor::new());
        let job = job();

        assert!(matches!(
            node.ask_for_bid(ask(&job, vec![])).await,
            Err(ProtocolError::InvalidBidRequest(_))
        ));
        assert!(matches!(
            node.ask_for_bid(ask(&job, vec![7])).await,
            Err(ProtocolError::InvalidBidRequest(_))
        ));

        let mut misrouted = ask(&job, vec![0]);
        misrouted.routing.target_peer_id = NodeId::new("compute-2").unwrap();
        assert!(matches!(
            node.ask_for_bid(misrouted).await,
            Err(ProtocolError::RoutingMismatch { .. })
        ));
        assert!(node.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_accepted_bid_runs_and_proposes() {
        let (node, requester) = node(Blake3Executor::new());
        let job = job();
        let response = node.ask_for_bid(ask(&job, vec![0])).await.unwrap();
        let execution_id = response.bids[0].execution_id.clone().unwrap();

        let ack = node
            .bid_accepted(BidAcceptedRequest {
                routing: RoutingMetadata::new(requester_id(), node.id().clone()),
                execution_id: execution_id.clone(),
            })
            .await
            .unwrap();
        assert!(ack.applied);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let proposals = requester.proposals.lock().await;
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].execution_id, execution_id);
        assert_eq!(
            node.execution(&execution_id).await.unwrap().state,
            ExecutionState::ResultProposed
        );
        assert_eq!(node.held_artifacts().await, 1);
    }

    #[tokio::test]
    async fn test_message_from_other_requester_dropped() {
        let (node, _) = node(Blake3Executor::new());
        let job = job();
        let response = node.ask_for_bid(ask(&job, vec![0])).await.unwrap();
        let execution_id = response.bids[0].execution_id.clone().unwrap();

        let result = node
            .bid_accepted(BidAcceptedRequest {
                routing: RoutingMetadata::new(NodeId::new("intruder").unwrap(), node.id().clone()),
                execution_id: execution_id.clone(),
            })
            .await;
        assert!(matches!(result, Err(ProtocolError::RoutingMismatch { .. })));
        assert_eq!(
            node.execution(&execution_id).await.unwrap().state,
            ExecutionState::Bidding
        );
    }

    #[tokio::test]
    async fn test_cancel_running_execution() {
        let (node, requester) = node(Blake3Executor::new().with_delay(Duration::from_secs(30)));
        let job = job();
        let response = node.ask_for_bid(ask(&job, vec![0])).await.unwrap();
        let execution_id = response.bids[0].execution_id.clone().unwrap();
        node.bid_accepted(BidAcceptedRequest {
            routing: RoutingMetadata::new(requester_id(), node.id().clone()),
            execution_id: execution_id.clone(),
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let request = CancelExecutionRequest {
            routing: RoutingMetadata::new(requester_id(), node.id().clone()),
            execution_id: execution_id.clone(),
            justification: "no longer needed".into(),
        };
        let response = node.cancel_execution(request.clone()).await.unwrap();
        assert_eq!(
            response.result,
            CancelResult::Canceled {
                previous: ExecutionState::Running
            }
        );

        // A second request finds the execution terminal.
        let again = node.cancel_execution(request).await.unwrap();
        assert_eq!(
            again.result,
            CancelResult::AlreadyTerminal {
                state: ExecutionState::Canceled
            }
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(requester.cancels.lock().await.len(), 1);
        assert!(requester.proposals.lock().await.is_empty());
        assert_eq!(node.registry().count_active().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_publish_in_progress() {
        let publisher = Arc::new(SlowPublisher {
            delay: Duration::from_millis(400),
            completed: AtomicUsize::new(0),
        });
        let (node, requester) = node_with(
            ComputeConfig::default(),
            Blake3Executor::new(),
            publisher.clone(),
        );
        let job = job();
        let response = node.ask_for_bid(ask(&job, vec![0])).await.unwrap();
        let execution_id = response.bids[0].execution_id.clone().unwrap();
        node.bid_accepted(BidAcceptedRequest {
            routing: routing(&node),
            execution_id: execution_id.clone(),
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(requester.proposals.lock().await.len(), 1);

        let ack = node
            .result_accepted(ResultAcceptedRequest {
                routing: routing(&node),
                execution_id: execution_id.clone(),
            })
            .await
            .unwrap();
        assert!(ack.applied);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let response = node
            .cancel_execution(CancelExecutionRequest {
                routing: routing(&node),
                execution_id: execution_id.clone(),
                justification: "quorum lost".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            response.result,
            CancelResult::Canceled {
                previous: ExecutionState::ResultAccepted
            }
        );

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(publisher.completed.load(Ordering::SeqCst), 0);
        let execution = node.execution(&execution_id).await.unwrap();
        assert_eq!(execution.state, ExecutionState::Canceled);
        assert!(execution.published_result.is_none());
        assert_eq!(node.held_artifacts().await, 0);
    }

    #[tokio::test]
    async fn test_unanswered_bid_expires_and_frees_slot() {
        let config = ComputeConfig {
            max_concurrent_executions: 1,
            bid_timeout_ms: 50,
            ..Default::default()
        };
        let (node, _) = node_with(config, Blake3Executor::new(), Arc::new(MemoryPublisher::new()));

        let held = node.ask_for_bid(ask(&job(), vec![0])).await.unwrap();
        let execution_id = held.bids[0].execution_id.clone().unwrap();
        let full = node.ask_for_bid(ask(&job(), vec![0])).await.unwrap();
        assert!(!full.bids[0].accepted);
        assert_eq!(full.bids[0].reason, AT_CAPACITY);

        // Not yet overdue.
        assert!(node.sweep().await.expired_bids.is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let report = node.sweep().await;
        assert_eq!(report.expired_bids, vec![execution_id.clone()]);
        let expired = node.execution(&execution_id).await.unwrap();
        assert_eq!(expired.state, ExecutionState::Canceled);
        assert_eq!(expired.failure_reason.as_deref(), Some("bid not answered"));

        let fresh = node.ask_for_bid(ask(&job(), vec![0])).await.unwrap();
        assert!(fresh.bids[0].accepted);

        // A late acceptance finds the bid gone.
        let ack = node
            .bid_accepted(BidAcceptedRequest {
                routing: routing(&node),
                execution_id,
            })
            .await
            .unwrap();
        assert!(!ack.applied);
        assert_eq!(ack.state, ExecutionState::Canceled);
    }

    #[tokio::test]
    async fn test_sweep_evicts_finished_executions() {
        let config = ComputeConfig {
            eviction_timeout_ms: 0,
            ..Default::default()
        };
        let (node, _) = node_with(config, Blake3Executor::new(), Arc::new(MemoryPublisher::new()));
        let job = job();
        let response = node.ask_for_bid(ask(&job, vec![0, 1])).await.unwrap();
        let canceled = response.bids[0].execution_id.clone().unwrap();
        let bidding = response.bids[1].execution_id.clone().unwrap();
        node.cancel_execution(CancelExecutionRequest {
            routing: routing(&node),
            execution_id: canceled.clone(),
            justification: "not selected".into(),
        })
        .await
        .unwrap();

        let report = node.sweep().await;
        assert_eq!(report.evicted, 1);
        assert!(report.expired_bids.is_empty());
        assert!(matches!(
            node.execution(&canceled).await,
            Err(ProtocolError::ExecutionNotFound(_))
        ));
        assert_eq!(node.registry().len().await, 1);

        // Shard 0 is forgotten and bids afresh; shard 1 keeps its answer.
        let again = node.ask_for_bid(ask(&job, vec![0, 1])).await.unwrap();
        assert_ne!(again.bids[0].execution_id, Some(canceled));
        assert_eq!(again.bids[1].execution_id, Some(bidding));
    }
}
