use crate::bidding::{BidCoordinator, BidSelection, PendingBid, ReceivedBid};
use crate::cancel::CancellationHandler;
use crate::config::RequesterConfig;
use crate::endpoint::{ComputeEndpoint, RequesterEndpoint};
use crate::messages::*;
use crate::publish::{with_timeout, PublishCoordinator, PublishTarget};
use crate::registry::{ExecutionRegistry, TransitionOutcome, UpdateRequest};
use crate::selection::{NodeRanker, NodeSelector, UniformRanker};
use crate::status::{JobEvent, JobState, JobStatus, ShardFailure, ShardOutcome, ShardStatus};
use crate::verification::{verifier_for, ShardQuorumState, VerificationOutcome, Verifier};
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use verum_types::{
    Execution, ExecutionId, ExecutionState, Job, JobId, LifecycleState, NodeId, RoutingMetadata,
    ShardId, VerifierKind,
};

/// Per-shard bookkeeping, guarded by its own lock
#[derive(Debug)]
struct ShardRecord {
    outcome: ShardOutcome,
    failure: Option<ShardFailure>,
    quorum: Option<ShardQuorumState>,
    first_compute_error: Option<String>,
}

impl ShardRecord {
    fn new() -> Self {
        Self {
            outcome: ShardOutcome::Bidding,
            failure: None,
            quorum: None,
            first_compute_error: None,
        }
    }
}

#[derive(Debug)]
struct JobMeta {
    state: JobState,
    finished_at: Option<Instant>,
}

struct JobEntry {
    job: Job,
    shards: BTreeMap<u32, Mutex<ShardRecord>>,
    meta: Mutex<JobMeta>,
    status: watch::Sender<JobState>,
    deadline: Instant,
}

impl JobEntry {
    fn shard(&self, index: u32) -> Result<&Mutex<ShardRecord>> {
        self.shards
            .get(&index)
            .ok_or_else(|| ProtocolError::JobNotFound(format!("{}#{}", self.job.id, index)))
    }
}

/// What a sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out_shards: Vec<ShardId>,
    pub evicted_jobs: Vec<JobId>,
}

/// The orchestrating party.
///
/// Owns jobs, the authoritative execution registry and every shard's
/// verification window. Compute participants are reached only through the
/// injected [`ComputeEndpoint`]. Cloning shares all state.
#[derive(Clone)]
pub struct RequesterNode {
    id: NodeId,
    config: RequesterConfig,
    compute: Arc<dyn ComputeEndpoint>,
    registry: Arc<ExecutionRegistry>,
    peers: Arc<RwLock<Vec<NodeId>>>,
    jobs: Arc<RwLock<HashMap<JobId, Arc<JobEntry>>>>,
    verifiers: Arc<HashMap<VerifierKind, Arc<dyn Verifier>>>,
    events: Option<mpsc::UnboundedSender<JobEvent>>,
    bids: Arc<BidCoordinator>,
    selector: NodeSelector,
    publisher: Arc<PublishCoordinator>,
    canceller: CancellationHandler,
}

impl RequesterNode {
    pub fn new(id: NodeId, config: RequesterConfig, compute: Arc<dyn ComputeEndpoint>) -> Self {
        let registry = Arc::new(ExecutionRegistry::new());
        let bids = BidCoordinator::new(
            id.clone(),
            compute.clone(),
            config.bid_window(),
            config.request_timeout(),
        );
        let publisher =
            PublishCoordinator::new(id.clone(), compute.clone(), config.request_timeout());
        let canceller = CancellationHandler::new(
            id.clone(),
            compute.clone(),
            registry.clone(),
            config.cancel_grace(),
        );
        let verifiers = [VerifierKind::HashAgreement, VerifierKind::AcceptFirst]
            .into_iter()
            .map(|kind| (kind, verifier_for(kind)))
            .collect();
        let selector = NodeSelector::new(Arc::new(UniformRanker), &config);

        Self {
            id,
            config,
            compute,
            registry,
            peers: Arc::new(RwLock::new(Vec::new())),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            verifiers: Arc::new(verifiers),
            events: None,
            bids: Arc::new(bids),
            selector,
            publisher: Arc::new(publisher),
            canceller,
        }
    }

    /// Rank compute peers with `ranker` before asking them to bid
    pub fn with_ranker(mut self, ranker: Arc<dyn NodeRanker>) -> Self {
        self.selector = NodeSelector::new(ranker, &self.config);
        self
    }

    /// Emit [`JobEvent`]s on `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<JobEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Replace the policy used for jobs asking for `kind`
    pub fn with_verifier(mut self, kind: VerifierKind, verifier: Arc<dyn Verifier>) -> Self {
        let mut verifiers = (*self.verifiers).clone();
        verifiers.insert(kind, verifier);
        self.verifiers = Arc::new(verifiers);
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn config(&self) -> &RequesterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    pub async fn add_compute_peer(&self, peer: NodeId) {
        let mut peers = self.peers.write().await;
        if !peers.contains(&peer) {
            peers.push(peer);
        }
    }

    pub async fn compute_peers(&self) -> Vec<NodeId> {
        self.peers.read().await.clone()
    }

    fn emit(&self, event: JobEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    async fn entry(&self, job_id: &JobId) -> Result<Arc<JobEntry>> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| ProtocolError::JobNotFound(job_id.to_string()))
    }

    fn verifier(&self, job: &Job) -> Result<Arc<dyn Verifier>> {
        let kind = job.spec.verifier.unwrap_or(self.config.default_verifier);
        self.verifiers
            .get(&kind)
            .cloned()
            .ok_or_else(|| ProtocolError::VerificationFailed(format!("no verifier for {:?}", kind)))
    }

    // ---- submission ----

    /// Register `job` and start bidding in the background
    pub async fn submit_job(&self, job: Job) -> Result<JobId> {
        job.deal.validate()?;
        let peers = self.compute_peers().await;
        let candidates = self.selector.select(&job, &peers).await.map_err(|e| {
            warn!(job_id = %job.id, error = %e, "❌ Job refused");
            e
        })?;
        let job_id = job.id.clone();
        let timeout = job
            .spec
            .timeout()
            .unwrap_or_else(|| self.config.default_job_timeout());

        let entry = Arc::new(JobEntry {
            shards: job
                .shard_indices()
                .map(|i| (i, Mutex::new(ShardRecord::new())))
                .collect(),
            meta: Mutex::new(JobMeta {
                state: JobState::InProgress,
                finished_at: None,
            }),
            status: watch::channel(JobState::InProgress).0,
            deadline: Instant::now() + timeout,
            job,
        });

        {
            let mut jobs = self.jobs.write().await;
            if jobs.contains_key(&job_id) {
                return Err(ProtocolError::JobExists(job_id.to_string()));
            }
            jobs.insert(job_id.clone(), entry.clone());
        }

        info!(
            job_id = %job_id,
            client_id = %entry.job.client_id,
            shards = entry.job.spec.shard_count,
            concurrency = entry.job.deal.concurrency,
            confidence = entry.job.deal.confidence,
            min_bids = entry.job.deal.min_bids,
            "📋 Job submitted"
        );

        let node = self.clone();
        tokio::spawn(async move { node.run_bidding(entry, candidates).await });
        Ok(job_id)
    }

    async fn run_bidding(&self, entry: Arc<JobEntry>, candidates: Vec<NodeId>) {
        let (round, pending) = self.bids.solicit(&entry.job, &candidates).await;

        let node = self.clone();
        let job = entry.job.clone();
        tokio::spawn(async move { node.drain_late_bids(job, pending).await });

        for (&shard_index, shard_bids) in &round.shards {
            let shard = entry.job.shard(shard_index);
            for bid in &shard_bids.bids {
                self.emit(JobEvent::BidReceived {
                    shard: shard.clone(),
                    node_id: bid.node_id.clone(),
                    accepted: bid.accepted,
                });
            }
            let selection =
                round.select(shard_index, &entry.job.deal, self.config.partial_bid_policy);
            self.start_shard(&entry, shard_index, selection).await;
        }
    }

    async fn start_shard(&self, entry: &Arc<JobEntry>, shard_index: u32, selection: BidSelection) {
        let (winners, losers) = match selection {
            BidSelection::Fail { failure, losers } => {
                self.reject_bids(&entry.job, &losers, &failure.to_string()).await;
                self.fail_shard(entry, shard_index, failure).await;
                return;
            }
            BidSelection::Proceed { winners, losers } => (winners, losers),
        };

        // Winners move to Running before BidAccepted is sent so that a fast
        // RunComplete finds them ready.
        let mut accepted = Vec::with_capacity(winners.len());
        for bid in &winners {
            match self.register_bid(&entry.job, bid).await {
                Ok(execution_id) => {
                    let outcome = self
                        .advance(&execution_id, &[
                            (ExecutionState::BidAccepted, "bid accepted"),
                            (ExecutionState::Running, "bid acceptance sent"),
                        ])
                        .await;
                    if outcome {
                        self.emit(JobEvent::BidAccepted {
                            shard: entry.job.shard(shard_index),
                            execution_id: execution_id.clone(),
                        });
                        accepted.push((execution_id, bid.node_id.clone()));
                    }
                }
                Err(e) => warn!(job_id = %entry.job.id, shard = shard_index, error = %e, "Bid not registered"),
            }
        }

        if accepted.is_empty() {
            self.reject_bids(&entry.job, &losers, "bid not selected").await;
            self.fail_shard(entry, shard_index, ShardFailure::NoBids).await;
            return;
        }

        let deadline = Instant::now() + self.config.verification_timeout();
        if let Ok(shard) = entry.shard(shard_index) {
            let mut shard = shard.lock().await;
            shard.quorum = Some(ShardQuorumState::new(
                entry.job.shard(shard_index),
                accepted.len(),
                deadline,
            ));
            shard.outcome = ShardOutcome::WaitingForResults;
        }

        info!(
            job_id = %entry.job.id,
            shard = shard_index,
            accepted = accepted.len(),
            rejected = losers.len(),
            "🤝 Bids accepted"
        );

        self.reject_bids(&entry.job, &losers, "bid not selected").await;

        let mut sends = JoinSet::new();
        for (execution_id, node_id) in accepted {
            let request = BidAcceptedRequest {
                routing: RoutingMetadata::new(self.id.clone(), node_id),
                execution_id: execution_id.clone(),
            };
            let compute = self.compute.clone();
            let timeout = self.config.request_timeout();
            sends.spawn(async move {
                let result = with_timeout(timeout, "bid accepted", compute.bid_accepted(request)).await;
                (execution_id, result)
            });
        }
        while let Some(joined) = sends.join_next().await {
            let (execution_id, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Bid acceptance task failed");
                    continue;
                }
            };
            let refusal = match result {
                Ok(ack) if ack.applied || !ack.state.is_terminal() => None,
                Ok(ack) => Some(format!("bid acceptance refused in state {}", ack.state)),
                Err(e) => Some(format!("bid acceptance not delivered: {}", e)),
            };
            if let Some(reason) = refusal {
                self.record_failure(&execution_id, reason).await;
            }
        }

        let node = self.clone();
        let job_id = entry.job.id.clone();
        let timeout = self.config.verification_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            node.verification_deadline(&job_id, shard_index).await;
        });
    }

    /// Apply a chain of transitions. Returns true when all applied.
    async fn advance(&self, execution_id: &ExecutionId, steps: &[(ExecutionState, &str)]) -> bool {
        for (state, comment) in steps {
            match self
                .registry
                .update_state(UpdateRequest::new(execution_id.clone(), *state, *comment))
                .await
            {
                Ok(outcome) if outcome.is_applied() => {}
                _ => return false,
            }
        }
        true
    }

    /// Record a bid as an execution in `Bidding`
    async fn register_bid(&self, job: &Job, bid: &ReceivedBid) -> Result<ExecutionId> {
        let execution_id = bid.execution_id.clone().unwrap_or_else(ExecutionId::generate);
        let execution = Execution::new(
            execution_id.clone(),
            job.id.clone(),
            bid.shard_index,
            bid.node_id.clone(),
            self.id.clone(),
        );
        self.registry.create(execution).await?;
        self.registry
            .update_state(UpdateRequest::new(
                execution_id.clone(),
                ExecutionState::Bidding,
                "bid received",
            ))
            .await?;
        Ok(execution_id)
    }

    /// Mark bids `BidRejected` and tell the participants that allocated an
    /// execution for them.
    async fn reject_bids(&self, job: &Job, bids: &[ReceivedBid], justification: &str) {
        let mut sends = JoinSet::new();
        for bid in bids {
            let execution_id = match self.register_bid(job, bid).await {
                Ok(id) => id,
                Err(e) => {
                    warn!(job_id = %job.id, node_id = %bid.node_id, error = %e, "Bid not registered");
                    continue;
                }
            };
            let reason = if bid.accepted {
                justification.to_string()
            } else {
                bid.reason.clone()
            };
            let _ = self
                .registry
                .update_state(UpdateRequest::new(
                    execution_id.clone(),
                    ExecutionState::BidRejected,
                    reason.clone(),
                ))
                .await;
            self.emit(JobEvent::BidRejected {
                shard: job.shard(bid.shard_index),
                execution_id: execution_id.clone(),
                reason: reason.clone(),
            });

            if bid.execution_id.is_none() {
                continue;
            }
            let request = BidRejectedRequest {
                routing: RoutingMetadata::new(self.id.clone(), bid.node_id.clone()),
                execution_id,
                justification: reason,
            };
            let compute = self.compute.clone();
            let timeout = self.config.request_timeout();
            sends.spawn(async move {
                with_timeout(timeout, "bid rejected", compute.bid_rejected(request)).await
            });
        }
        while let Some(joined) = sends.join_next().await {
            if let Ok(Err(e)) = joined {
                debug!(job_id = %job.id, error = %e, "Bid rejection not delivered");
            }
        }
    }

    async fn drain_late_bids(&self, job: Job, mut pending: JoinSet<PendingBid>) {
        let mut late = Vec::new();
        while let Some(joined) = pending.join_next().await {
            if let Ok((node_id, Ok(response))) = joined {
                for bid in response.bids {
                    late.push(ReceivedBid {
                        node_id: node_id.clone(),
                        shard_index: bid.shard_index,
                        execution_id: bid.execution_id,
                        accepted: bid.accepted,
                        reason: bid.reason,
                        arrival: u64::MAX,
                    });
                }
            }
        }
        if !late.is_empty() {
            info!(job_id = %job.id, bids = late.len(), "⏰ Late bids rejected");
            self.reject_bids(&job, &late, "bid window closed").await;
        }
    }

    // ---- verification ----

    async fn verification_deadline(&self, job_id: &JobId, shard_index: u32) {
        let Ok(entry) = self.entry(job_id).await else {
            return;
        };
        let Ok(shard) = entry.shard(shard_index) else {
            return;
        };

        let decided = {
            let mut record = shard.lock().await;
            let Some(quorum) = record.quorum.as_mut() else {
                return;
            };
            if quorum.is_decided() {
                return;
            }

            // Executions that never proposed are cancelled and stop counting.
            let stragglers: Vec<ExecutionId> = self
                .registry
                .shard_executions(job_id, shard_index)
                .await
                .into_iter()
                .filter(|e| e.state.is_executing())
                .map(|e| e.id)
                .collect();
            if !stragglers.is_empty() {
                warn!(
                    job_id = %job_id,
                    shard = shard_index,
                    stragglers = stragglers.len(),
                    "⏰ Verification deadline passed, cancelling executions without results"
                );
                self.canceller
                    .cancel_all(stragglers, "verification deadline passed")
                    .await;
            }
            quorum.expected = quorum.received();
            self.decide(&entry, &mut record)
        };

        if let Some(outcome) = decided {
            self.apply_verification(&entry, shard_index, outcome).await;
        }
    }

    /// Partition the shard's proposals. Caller holds the shard lock.
    fn decide(&self, entry: &JobEntry, record: &mut ShardRecord) -> Option<VerificationOutcome> {
        let verifier = match self.verifier(&entry.job) {
            Ok(v) => v,
            Err(e) => {
                warn!(job_id = %entry.job.id, error = %e, "No verifier");
                return None;
            }
        };
        let quorum = record.quorum.as_mut()?;
        if quorum.is_decided() {
            return None;
        }
        let outcome = quorum.decide(verifier.as_ref(), &entry.job.deal);
        record.outcome = ShardOutcome::Verifying;
        Some(outcome)
    }

    async fn apply_verification(
        &self,
        entry: &Arc<JobEntry>,
        shard_index: u32,
        outcome: VerificationOutcome,
    ) {
        let shard = entry.job.shard(shard_index);

        if outcome.accepted.is_empty() && outcome.rejected.is_empty() {
            let first_error = match entry.shard(shard_index) {
                Ok(record) => record.lock().await.first_compute_error.clone(),
                Err(_) => None,
            };
            let failure =
                ShardFailure::ComputeError(first_error.unwrap_or_else(|| "no results proposed".to_string()));
            self.fail_shard(entry, shard_index, failure).await;
            return;
        }

        let mut winners = Vec::new();
        for id in &outcome.accepted {
            let applied = self
                .registry
                .update_state(
                    UpdateRequest::new(id.clone(), ExecutionState::ResultAccepted, "result verified")
                        .expecting(&[ExecutionState::ResultProposed]),
                )
                .await
                .map(|o| o.is_applied())
                .unwrap_or(false);
            if applied {
                if let Ok(execution) = self.registry.get(id).await {
                    winners.push(PublishTarget {
                        execution_id: id.clone(),
                        node_id: execution.node_id,
                    });
                }
            }
        }

        // Winners canceled while the outcome was being applied no longer
        // count toward the agreement.
        let required = entry.job.deal.confidence.min(outcome.accepted.len());
        let has_quorum = outcome.has_quorum() && winners.len() >= required;
        if outcome.has_quorum() && !has_quorum {
            warn!(
                job_id = %entry.job.id,
                shard = shard_index,
                accepted = winners.len(),
                required,
                "⚠️ Accepted executions ended during verification, quorum lost"
            );
            let stranded = winners.drain(..).map(|w| w.execution_id).collect();
            self.canceller.cancel_all(stranded, "quorum lost").await;
        }
        let justification = if has_quorum {
            "result did not match the agreed digest"
        } else {
            "verification failed: no quorum"
        };

        let mut losers = Vec::new();
        for id in &outcome.rejected {
            let applied = self
                .registry
                .update_state(
                    UpdateRequest::new(id.clone(), ExecutionState::ResultRejected, justification)
                        .expecting(&[ExecutionState::ResultProposed]),
                )
                .await
                .map(|o| o.is_applied())
                .unwrap_or(false);
            if applied {
                if let Ok(execution) = self.registry.get(id).await {
                    losers.push(PublishTarget {
                        execution_id: id.clone(),
                        node_id: execution.node_id,
                    });
                }
            }
        }

        self.emit(JobEvent::ResultsVerified {
            shard: shard.clone(),
            accepted: winners.len(),
            rejected: losers.len(),
        });

        if !has_quorum {
            self.publisher.dispatch(&[], &losers, justification).await;
            self.fail_shard(entry, shard_index, ShardFailure::NoQuorum).await;
            return;
        }

        if winners.is_empty() {
            self.publisher.dispatch(&[], &losers, justification).await;
            self.fail_shard(
                entry,
                shard_index,
                ShardFailure::ComputeError("accepted executions ended before publishing".to_string()),
            )
            .await;
            return;
        }

        if let Ok(record) = entry.shard(shard_index) {
            let mut record = record.lock().await;
            if record.outcome == ShardOutcome::Verifying {
                record.outcome = ShardOutcome::Publishing;
            }
            record.quorum = None;
        }

        info!(
            job_id = %entry.job.id,
            shard = shard_index,
            accepted = winners.len(),
            rejected = losers.len(),
            digest = ?outcome.winning_digest,
            "🔍 Results verified, publishing"
        );

        let failures = self
            .publisher
            .dispatch(&winners, &losers, justification)
            .await;
        for (execution_id, error) in failures {
            self.record_failure(&execution_id, format!("publish failed: {}", error))
                .await;
        }
    }

    // ---- execution endings ----

    /// Move an execution to `ComputeError` locally and account for it
    async fn record_failure(&self, execution_id: &ExecutionId, reason: String) {
        let failure = reason.clone();
        let outcome = self
            .registry
            .update_state_with(
                UpdateRequest::new(execution_id.clone(), ExecutionState::ComputeError, reason.clone()),
                |e| e.failure_reason = Some(failure),
            )
            .await;
        if let Ok(TransitionOutcome::Applied { from, .. }) = outcome {
            if let Ok(execution) = self.registry.get(execution_id).await {
                self.execution_ended(&execution, from, Some(reason)).await;
            }
        }
    }

    /// Account for an accepted execution that reached a terminal state from
    /// `previous`. Boxed because verification can end executions in turn.
    fn execution_ended<'a>(
        &'a self,
        execution: &'a Execution,
        previous: ExecutionState,
        error: Option<String>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let Ok(entry) = self.entry(&execution.job_id).await else {
                return;
            };

            match previous {
                ExecutionState::BidAccepted
                | ExecutionState::Running
                | ExecutionState::ResultProposed => {
                    let Ok(shard) = entry.shard(execution.shard_index) else {
                        return;
                    };
                    let decided = {
                        let mut record = shard.lock().await;
                        if let Some(error) = error {
                            record.first_compute_error.get_or_insert(error);
                        }
                        let ready = match record.quorum.as_mut() {
                            Some(quorum) if previous == ExecutionState::ResultProposed => {
                                if quorum.retract(&execution.id) {
                                    debug!(
                                        execution_id = %execution.id,
                                        shard = execution.shard_index,
                                        "Proposal withdrawn before verification"
                                    );
                                }
                                quorum.is_ready()
                            }
                            Some(quorum) => {
                                quorum.withdraw();
                                quorum.is_ready()
                            }
                            None => false,
                        };
                        if ready {
                            self.decide(&entry, &mut record)
                        } else {
                            None
                        }
                    };
                    if let Some(outcome) = decided {
                        self.apply_verification(&entry, execution.shard_index, outcome)
                            .await;
                    }
                }
                ExecutionState::ResultAccepted => {
                    self.check_publishing(&entry, execution.shard_index).await;
                }
                _ => {}
            }
        })
    }

    async fn check_publishing(&self, entry: &Arc<JobEntry>, shard_index: u32) {
        let executions = self
            .registry
            .shard_executions(&entry.job.id, shard_index)
            .await;
        let accepted: Vec<&Execution> = executions
            .iter()
            .filter(|e| e.reached(ExecutionState::ResultAccepted))
            .collect();
        if accepted.is_empty() || accepted.iter().any(|e| !e.is_terminal()) {
            return;
        }

        if accepted.iter().any(|e| e.state == ExecutionState::Published) {
            let completed = match entry.shard(shard_index) {
                Ok(record) => {
                    let mut record = record.lock().await;
                    if record.outcome.can_transition_to(&ShardOutcome::Published) {
                        record.outcome = ShardOutcome::Published;
                        true
                    } else {
                        false
                    }
                }
                Err(_) => false,
            };
            if completed {
                info!(
                    job_id = %entry.job.id,
                    shard = shard_index,
                    published = accepted.iter().filter(|e| e.state == ExecutionState::Published).count(),
                    "✅ Shard published"
                );
                self.check_job_complete(entry).await;
            }
        } else {
            // Every accepted execution ended in ComputeError or Canceled
            let failure = match accepted
                .iter()
                .find(|e| e.state == ExecutionState::ComputeError)
            {
                Some(failed) => {
                    let reason = failed
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| "no accepted execution published".to_string());
                    let reason = reason
                        .strip_prefix("publish failed: ")
                        .map(str::to_string)
                        .unwrap_or(reason);
                    ShardFailure::PublishFailed(reason)
                }
                None => ShardFailure::Canceled(
                    accepted
                        .iter()
                        .find_map(|e| e.failure_reason.clone())
                        .unwrap_or_else(|| "execution canceled".to_string()),
                ),
            };
            self.fail_shard(entry, shard_index, failure).await;
        }
    }

    async fn fail_shard(&self, entry: &Arc<JobEntry>, shard_index: u32, failure: ShardFailure) {
        let Ok(record) = entry.shard(shard_index) else {
            return;
        };
        {
            let mut record = record.lock().await;
            if record.outcome.is_terminal() {
                return;
            }
            record.outcome = match failure {
                ShardFailure::Canceled(_) => ShardOutcome::Canceled,
                _ => ShardOutcome::Failed,
            };
            record.failure = Some(failure.clone());
            record.quorum = None;
        }

        warn!(
            job_id = %entry.job.id,
            shard = shard_index,
            reason = %failure,
            "❌ Shard failed"
        );
        self.emit(JobEvent::ShardFailed {
            shard: entry.job.shard(shard_index),
            reason: failure.to_string(),
        });
        self.check_job_complete(entry).await;
    }

    async fn check_job_complete(&self, entry: &Arc<JobEntry>) {
        let mut outcomes = Vec::with_capacity(entry.shards.len());
        for record in entry.shards.values() {
            outcomes.push(record.lock().await.outcome);
        }
        let state = JobState::derive(&outcomes);
        if state == JobState::InProgress {
            return;
        }
        self.finish_job(entry, state).await;
    }

    async fn finish_job(&self, entry: &Arc<JobEntry>, state: JobState) {
        {
            let mut meta = entry.meta.lock().await;
            if !meta.state.can_transition_to(&state) {
                return;
            }
            meta.state = state;
            meta.finished_at = Some(Instant::now());
        }
        entry.status.send_replace(state);

        let emoji = match state {
            JobState::Completed => "🏁",
            JobState::CompletedWithErrors => "⚠️",
            _ => "❌",
        };
        info!(
            job_id = %entry.job.id,
            state = %state,
            "{} Job finished",
            emoji
        );
        self.emit(JobEvent::JobCompleted {
            job_id: entry.job.id.clone(),
            state,
        });
    }

    /// Callback sanity: known execution, from its participant, to us
    async fn checked_callback(
        &self,
        execution_id: &ExecutionId,
        routing: &RoutingMetadata,
    ) -> Result<Execution> {
        let execution = self.registry.get(execution_id).await?;
        if !routing.matches(&execution.node_id, &self.id) {
            warn!(
                execution_id = %execution_id,
                source = %routing.source_peer_id,
                target = %routing.target_peer_id,
                "⚠️ Routing mismatch, callback dropped"
            );
            return Err(ProtocolError::RoutingMismatch {
                execution_id: execution_id.to_string(),
                expected_source: execution.node_id.to_string(),
                expected_target: self.id.to_string(),
                actual_source: routing.source_peer_id.to_string(),
                actual_target: routing.target_peer_id.to_string(),
            });
        }
        Ok(execution)
    }

    // ---- queries and control ----

    pub async fn job_status(&self, job_id: &JobId) -> Result<JobStatus> {
        let entry = self.entry(job_id).await?;
        let state = entry.meta.lock().await.state;
        let mut shards = Vec::with_capacity(entry.shards.len());
        for (&index, record) in &entry.shards {
            let (outcome, reason) = {
                let record = record.lock().await;
                (record.outcome, record.failure.as_ref().map(ToString::to_string))
            };
            shards.push(ShardStatus {
                index,
                outcome,
                reason,
                executions: self.registry.shard_executions(job_id, index).await,
            });
        }
        Ok(JobStatus {
            job_id: job_id.clone(),
            state,
            shards,
        })
    }

    pub async fn executions_for_job(&self, job_id: &JobId) -> Vec<Execution> {
        self.registry.job_executions(job_id).await
    }

    /// Wait until the job reaches a terminal state, then return its status
    pub async fn wait_for_completion(&self, job_id: &JobId, timeout: Duration) -> Result<JobStatus> {
        let entry = self.entry(job_id).await?;
        let mut status = entry.status.subscribe();
        let finished = async move { status.wait_for(|s| s.is_terminal()).await.map(|_| ()) };
        match tokio::time::timeout(timeout, finished).await {
            Ok(Ok(_)) => self.job_status(job_id).await,
            Ok(Err(_)) => Err(ProtocolError::JobNotFound(job_id.to_string())),
            Err(_) => Err(ProtocolError::timeout(format!("waiting for job {}", job_id), timeout)),
        }
    }

    /// Cancel one execution. Local state changes immediately; the
    /// participant is told within the grace period.
    pub async fn cancel_execution(
        &self,
        execution_id: &ExecutionId,
        reason: &str,
    ) -> Result<CancelResult> {
        let result = self.canceller.cancel(execution_id, reason).await?;
        if let CancelResult::Canceled { previous } = result {
            let execution = self.registry.get(execution_id).await?;
            self.emit(JobEvent::ExecutionCanceled {
                execution_id: execution_id.clone(),
                reason: reason.to_string(),
            });
            self.execution_ended(&execution, previous, None).await;
        }
        Ok(result)
    }

    /// Cancel every live execution of a job and mark the job `Canceled`
    pub async fn cancel_job(&self, job_id: &JobId, reason: &str) -> Result<JobStatus> {
        let entry = self.entry(job_id).await?;
        {
            let mut meta = entry.meta.lock().await;
            if meta.state.is_terminal() {
                drop(meta);
                return self.job_status(job_id).await;
            }
            meta.state = JobState::Canceled;
            meta.finished_at = Some(Instant::now());
        }

        for record in entry.shards.values() {
            let mut record = record.lock().await;
            if !record.outcome.is_terminal() {
                record.outcome = ShardOutcome::Canceled;
                record.failure = Some(ShardFailure::Canceled(reason.to_string()));
                record.quorum = None;
            }
        }

        let live: Vec<ExecutionId> = self
            .registry
            .job_executions(job_id)
            .await
            .into_iter()
            .filter(|e| !e.is_terminal())
            .map(|e| e.id)
            .collect();
        for id in &live {
            self.emit(JobEvent::ExecutionCanceled {
                execution_id: id.clone(),
                reason: reason.to_string(),
            });
        }
        self.canceller.cancel_all(live, reason).await;

        entry.status.send_replace(JobState::Canceled);
        info!(job_id = %job_id, reason, "🛑 Job canceled");
        self.emit(JobEvent::JobCompleted {
            job_id: job_id.clone(),
            state: JobState::Canceled,
        });
        self.job_status(job_id).await
    }

    /// Time out overdue shards and evict jobs finished longer ago than the
    /// eviction timeout.
    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let entries: Vec<Arc<JobEntry>> = self.jobs.read().await.values().cloned().collect();
        let mut report = SweepReport::default();

        for entry in entries {
            let finished_at = entry.meta.lock().await.finished_at;
            match finished_at {
                Some(at) if now.duration_since(at) >= self.config.eviction_timeout() => {
                    self.jobs.write().await.remove(&entry.job.id);
                    let removed = self.registry.remove_job(&entry.job.id).await;
                    debug!(job_id = %entry.job.id, executions = removed, "Job evicted");
                    report.evicted_jobs.push(entry.job.id.clone());
                }
                Some(_) => {}
                None if now >= entry.deadline => {
                    for (&index, record) in &entry.shards {
                        let outcome = record.lock().await.outcome;
                        if outcome.is_terminal() {
                            continue;
                        }
                        let live: Vec<ExecutionId> = self
                            .registry
                            .shard_executions(&entry.job.id, index)
                            .await
                            .into_iter()
                            .filter(|e| !e.is_terminal())
                            .map(|e| e.id)
                            .collect();
                        self.fail_shard(&entry, index, ShardFailure::TimedOut(outcome))
                            .await;
                        self.canceller.cancel_all(live, "shard timed out").await;
                        report.timed_out_shards.push(entry.job.shard(index));
                    }
                }
                None => {}
            }
        }

        if !report.timed_out_shards.is_empty() || !report.evicted_jobs.is_empty() {
            info!(
                timed_out = report.timed_out_shards.len(),
                evicted = report.evicted_jobs.len(),
                "🧹 Sweep finished"
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

    fn unexpected(&self, execution: &Execution, message: &str, outcome: &TransitionOutcome) -> CallbackAck {
        let reason = format!(
            "{} not accepted for {} in state {}",
            message,
            execution.id,
            outcome.state()
        );
        warn!(
            execution_id = %execution.id,
            job_id = %execution.job_id,
            shard = execution.shard_index,
            state = %outcome.state(),
            "⚠️ Out-of-order {} ignored",
            message
        );
        CallbackAck::Ignored { reason }
    }
}

#[async_trait]
impl RequesterEndpoint for RequesterNode {
    async fn on_run_complete(&self, callback: RunComplete) -> Result<CallbackAck> {
        let execution = self
            .checked_callback(&callback.execution_id, &callback.routing)
            .await?;

        let digest = callback.proposal;
        let outcome = self
            .registry
            .update_state_with(
                UpdateRequest::new(
                    callback.execution_id.clone(),
                    ExecutionState::ResultProposed,
                    "result proposed",
                )
                .expecting(&[ExecutionState::Running]),
                |e| e.result_proposal = Some(digest),
            )
            .await?;

        match &outcome {
            TransitionOutcome::Applied { .. } => {}
            TransitionOutcome::AlreadyTerminal { state } => {
                return Ok(CallbackAck::Duplicate { state: *state })
            }
            _ if execution.result_proposal == Some(digest) => {
                return Ok(CallbackAck::Duplicate {
                    state: outcome.state(),
                })
            }
            _ => return Ok(self.unexpected(&execution, "result proposal", &outcome)),
        }

        self.emit(JobEvent::ResultProposed {
            shard: execution.shard(),
            execution_id: callback.execution_id.clone(),
        });
        debug!(
            execution_id = %callback.execution_id,
            job_id = %execution.job_id,
            shard = execution.shard_index,
            digest = %digest,
            "Proposal received"
        );

        let entry = self.entry(&execution.job_id).await?;
        let (recorded, decided) = {
            let mut record = entry.shard(execution.shard_index)?.lock().await;
            let recorded = match record.quorum.as_mut() {
                Some(quorum) => quorum.record(callback.execution_id.clone(), digest),
                None => false,
            };
            let ready = record.quorum.as_ref().map(|q| q.is_ready()).unwrap_or(false);
            let decided = if ready {
                self.decide(&entry, &mut record)
            } else {
                None
            };
            (recorded, decided)
        };

        if !recorded {
            // The verification window already closed for this shard.
            warn!(
                execution_id = %callback.execution_id,
                shard = execution.shard_index,
                "⚠️ Proposal arrived after verification"
            );
            let node = self.clone();
            let id = callback.execution_id.clone();
            tokio::spawn(async move {
                let _ = node
                    .cancel_execution(&id, "result arrived after verification")
                    .await;
            });
        }

        if let Some(outcome) = decided {
            let node = self.clone();
            let shard_index = execution.shard_index;
            tokio::spawn(async move {
                node.apply_verification(&entry, shard_index, outcome).await;
            });
        }

        Ok(CallbackAck::Applied {
            state: ExecutionState::ResultProposed,
        })
    }

    async fn on_publish_complete(&self, callback: PublishComplete) -> Result<CallbackAck> {
        let execution = self
            .checked_callback(&callback.execution_id, &callback.routing)
            .await?;

        let published = callback.published.clone();
        let outcome = self
            .registry
            .update_state_with(
                UpdateRequest::new(
                    callback.execution_id.clone(),
                    ExecutionState::Published,
                    "result published",
                )
                .expecting(&[ExecutionState::ResultAccepted]),
                |e| e.published_result = Some(published),
            )
            .await?;

        match outcome {
            TransitionOutcome::Applied { .. } => {}
            TransitionOutcome::AlreadyTerminal { state } => {
                return Ok(CallbackAck::Duplicate { state })
            }
            other => return Ok(self.unexpected(&execution, "publish completion", &other)),
        }

        info!(
            execution_id = %callback.execution_id,
            job_id = %execution.job_id,
            shard = execution.shard_index,
            location = %callback.published.location,
            "📦 Execution published"
        );
        self.emit(JobEvent::Published {
            shard: execution.shard(),
            execution_id: callback.execution_id.clone(),
            location: callback.published.location.clone(),
        });

        let node = self.clone();
        tokio::spawn(async move {
            node.execution_ended(&execution, ExecutionState::ResultAccepted, None)
                .await;
        });

        Ok(CallbackAck::Applied {
            state: ExecutionState::Published,
        })
    }

    async fn on_cancel_complete(&self, callback: CancelComplete) -> Result<CallbackAck> {
        let execution = self
            .checked_callback(&callback.execution_id, &callback.routing)
            .await?;

        let outcome = self
            .registry
            .update_state(UpdateRequest::new(
                callback.execution_id.clone(),
                ExecutionState::Canceled,
                "canceled by compute participant",
            ))
            .await?;

        match outcome {
            TransitionOutcome::Applied { from, .. } => {
                info!(
                    execution_id = %callback.execution_id,
                    previous = %from,
                    "🛑 Execution canceled by participant"
                );
                let node = self.clone();
                tokio::spawn(async move { node.execution_ended(&execution, from, None).await });
                Ok(CallbackAck::Applied {
                    state: ExecutionState::Canceled,
                })
            }
            other => {
                debug!(
                    execution_id = %callback.execution_id,
                    state = %other.state(),
                    "Cancellation acknowledged"
                );
                Ok(CallbackAck::Duplicate {
                    state: other.state(),
                })
            }
        }
    }

    async fn on_compute_failure(&self, callback: ComputeFailure) -> Result<CallbackAck> {
        let execution = self
            .checked_callback(&callback.execution_id, &callback.routing)
            .await?;

        let reason = callback.error.clone();
        let outcome = self
            .registry
            .update_state_with(
                UpdateRequest::new(
                    callback.execution_id.clone(),
                    ExecutionState::ComputeError,
                    callback.error.clone(),
                )
                .expecting(&[
                    ExecutionState::BidAccepted,
                    ExecutionState::Running,
                    ExecutionState::ResultAccepted,
                ]),
                |e| e.failure_reason = Some(reason),
            )
            .await?;

        let from = match outcome {
            TransitionOutcome::Applied { from, .. } => from,
            TransitionOutcome::AlreadyTerminal { state } => {
                return Ok(CallbackAck::Duplicate { state })
            }
            other => return Ok(self.unexpected(&execution, "compute failure", &other)),
        };

        warn!(
            execution_id = %callback.execution_id,
            job_id = %execution.job_id,
            shard = execution.shard_index,
            node_id = %execution.node_id,
            reason = %callback.error,
            "❌ Compute failure reported"
        );

        let node = self.clone();
        let error = callback.error;
        tokio::spawn(async move { node.execution_ended(&execution, from, Some(error)).await });

        Ok(CallbackAck::Applied {
            state: ExecutionState::ComputeError,
        })
    }
}
