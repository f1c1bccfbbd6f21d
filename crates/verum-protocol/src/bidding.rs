use crate::config::PartialBidPolicy;
use crate::endpoint::ComputeEndpoint;
use crate::messages::{AskForBidRequest, AskForBidResponse};
use crate::status::ShardFailure;
use crate::{ProtocolError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use verum_types::{Deal, ExecutionId, Job, NodeId, RoutingMetadata};

/// One bid as received by the requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedBid {
    pub node_id: NodeId,
    pub shard_index: u32,
    pub execution_id: Option<ExecutionId>,
    pub accepted: bool,
    pub reason: String,
    /// Arrival order across the whole round
    pub arrival: u64,
}

impl ReceivedBid {
    /// Accepting bid with an execution to accept into
    pub fn is_usable(&self) -> bool {
        self.accepted && self.execution_id.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShardBids {
    pub bids: Vec<ReceivedBid>,
}

impl ShardBids {
    pub fn received(&self) -> usize {
        self.bids.len()
    }

    pub fn accepting(&self) -> usize {
        self.bids.iter().filter(|b| b.is_usable()).count()
    }
}

/// Winners and losers for one shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BidSelection {
    Proceed {
        winners: Vec<ReceivedBid>,
        losers: Vec<ReceivedBid>,
    },
    Fail {
        failure: ShardFailure,
        losers: Vec<ReceivedBid>,
    },
}

/// Result of a peer's solicitation still outstanding when the window closed
pub type PendingBid = (NodeId, Result<AskForBidResponse>);

/// Bids gathered for one job within the bid window
#[derive(Debug, Default)]
pub struct BidRound {
    pub shards: BTreeMap<u32, ShardBids>,
    next_arrival: u64,
}

impl BidRound {
    pub fn new(shard_indices: impl IntoIterator<Item = u32>) -> Self {
        Self {
            shards: shard_indices
                .into_iter()
                .map(|i| (i, ShardBids::default()))
                .collect(),
            next_arrival: 0,
        }
    }

    /// Record a peer's response. Bids for shards outside the round are dropped.
    pub fn record(&mut self, node_id: &NodeId, response: AskForBidResponse) {
        for bid in response.bids {
            let Some(shard) = self.shards.get_mut(&bid.shard_index) else {
                warn!(
                    node_id = %node_id,
                    shard = bid.shard_index,
                    "⚠️ Bid for unknown shard dropped"
                );
                continue;
            };
            shard.bids.push(ReceivedBid {
                node_id: node_id.clone(),
                shard_index: bid.shard_index,
                execution_id: bid.execution_id,
                accepted: bid.accepted,
                reason: bid.reason,
                arrival: self.next_arrival,
            });
            self.next_arrival += 1;
        }
    }

    /// Every shard has `concurrency` accepting bids and at least `min_bids` bids
    pub fn is_satisfied(&self, deal: &Deal) -> bool {
        self.shards
            .values()
            .all(|s| s.accepting() >= deal.concurrency && s.received() >= deal.min_bids)
    }

    /// Pick up to `concurrency` winners for a shard, first arrived first.
    pub fn select(&self, shard_index: u32, deal: &Deal, policy: PartialBidPolicy) -> BidSelection {
        let mut bids = self
            .shards
            .get(&shard_index)
            .map(|s| s.bids.clone())
            .unwrap_or_default();
        bids.sort_by_key(|b| b.arrival);

        let received = bids.len();
        let (accepting, mut losers): (Vec<_>, Vec<_>) =
            bids.into_iter().partition(ReceivedBid::is_usable);

        if accepting.is_empty() {
            return BidSelection::Fail {
                failure: ShardFailure::NoBids,
                losers,
            };
        }

        if policy == PartialBidPolicy::FailShard && received < deal.min_bids {
            losers.extend(accepting);
            losers.sort_by_key(|b| b.arrival);
            return BidSelection::Fail {
                failure: ShardFailure::NotEnoughBids {
                    received,
                    required: deal.min_bids,
                },
                losers,
            };
        }

        let mut winners = accepting;
        let surplus = winners.split_off(deal.concurrency.min(winners.len()));
        losers.extend(surplus);
        losers.sort_by_key(|b| b.arrival);

        BidSelection::Proceed { winners, losers }
    }
}

/// Solicits bids from compute peers for one job
pub struct BidCoordinator {
    requester_id: NodeId,
    compute: Arc<dyn ComputeEndpoint>,
    bid_window: Duration,
    request_timeout: Duration,
}

impl BidCoordinator {
    pub fn new(
        requester_id: NodeId,
        compute: Arc<dyn ComputeEndpoint>,
        bid_window: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            requester_id,
            compute,
            bid_window,
            request_timeout,
        }
    }

    /// Ask every peer to bid on every shard of `job`.
    ///
    /// Returns when every shard is satisfied, every peer has answered, or the
    /// bid window closes. Solicitations still in flight are handed back so
    /// the caller can stand down bids that arrive late.
    pub async fn solicit(&self, job: &Job, peers: &[NodeId]) -> (BidRound, JoinSet<PendingBid>) {
        let start = std::time::Instant::now();
        let shard_indices: Vec<u32> = job.shard_indices().collect();
        let mut round = BidRound::new(shard_indices.iter().copied());
        let mut pending = JoinSet::new();

        for peer in peers {
            let request = AskForBidRequest {
                routing: RoutingMetadata::new(self.requester_id.clone(), peer.clone()),
                job: job.clone(),
                shard_indices: shard_indices.clone(),
            };
            let compute = self.compute.clone();
            let peer = peer.clone();
            let timeout = self.request_timeout;
            pending.spawn(async move {
                let response = match tokio::time::timeout(timeout, compute.ask_for_bid(request)).await
                {
                    Ok(response) => response,
                    Err(_) => Err(ProtocolError::timeout("ask for bid", timeout)),
                };
                (peer, response)
            });
        }

        let window = tokio::time::sleep(self.bid_window);
        tokio::pin!(window);

        while !round.is_satisfied(&job.deal) {
            tokio::select! {
                _ = &mut window => {
                    debug!(job_id = %job.id, "Bid window closed");
                    break;
                }
                next = pending.join_next() => match next {
                    None => break,
                    Some(Ok((peer, Ok(response)))) => {
                        if response.routing.matches(&peer, &self.requester_id) {
                            round.record(&peer, response);
                        } else {
                            warn!(
                                job_id = %job.id,
                                node_id = %peer,
                                "⚠️ Bid response routing mismatch, dropped"
                            );
                        }
                    }
                    Some(Ok((peer, Err(e)))) => {
                        warn!(job_id = %job.id, node_id = %peer, error = %e, "Bid solicitation failed");
                    }
                    Some(Err(e)) => {
                        warn!(job_id = %job.id, error = %e, "Bid solicitation task failed");
                    }
                },
            }
        }

        info!(
            job_id = %job.id,
            peers = peers.len(),
            bids = round.shards.values().map(ShardBids::received).sum::<usize>(),
            outstanding = pending.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "🗳️ Bids collected"
        );

        (round, pending)
    }
}
