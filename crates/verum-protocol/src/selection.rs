use crate::config::RequesterConfig;
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use verum_types::{Job, NodeId};

/// Rank of a node that should not be asked
pub const RANK_UNSUITABLE: i32 = -1;
/// Rank of a node that can take the job
pub const RANK_POSSIBLE: i32 = 0;
/// Rank of a node that should be asked first
pub const RANK_PREFERRED: i32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRank {
    pub node_id: NodeId,
    pub rank: i32,
    pub reason: String,
}

impl NodeRank {
    pub fn new(node_id: NodeId, rank: i32, reason: impl Into<String>) -> Self {
        Self {
            node_id,
            rank,
            reason: reason.into(),
        }
    }

    /// Negative ranks rule the node out
    pub fn meets_requirement(&self) -> bool {
        self.rank >= 0
    }
}

/// Scores candidate nodes for a job before any bid is asked for
#[async_trait]
pub trait NodeRanker: Send + Sync {
    async fn rank_nodes(&self, job: &Job, nodes: &[NodeId]) -> Result<Vec<NodeRank>>;
}

/// Every node ranks the same
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformRanker;

#[async_trait]
impl NodeRanker for UniformRanker {
    async fn rank_nodes(&self, _job: &Job, nodes: &[NodeId]) -> Result<Vec<NodeRank>> {
        Ok(nodes
            .iter()
            .map(|n| NodeRank::new(n.clone(), RANK_POSSIBLE, "no preference"))
            .collect())
    }
}

/// Fixed per-node ranks, for operators pinning or excluding participants
#[derive(Debug, Clone, Default)]
pub struct StaticRanker {
    ranks: HashMap<NodeId, i32>,
    default_rank: i32,
}

impl StaticRanker {
    pub fn new(default_rank: i32) -> Self {
        Self {
            ranks: HashMap::new(),
            default_rank,
        }
    }

    pub fn with_rank(mut self, node_id: NodeId, rank: i32) -> Self {
        self.ranks.insert(node_id, rank);
        self
    }
}

#[async_trait]
impl NodeRanker for StaticRanker {
    async fn rank_nodes(&self, _job: &Job, nodes: &[NodeId]) -> Result<Vec<NodeRank>> {
        Ok(nodes
            .iter()
            .map(|n| match self.ranks.get(n) {
                Some(&rank) => NodeRank::new(n.clone(), rank, "configured rank"),
                None => NodeRank::new(n.clone(), self.default_rank, "default rank"),
            })
            .collect())
    }
}

/// Picks which compute peers are asked to bid on a job.
///
/// Nodes ranked below zero are dropped and the rest are ordered best
/// first, keeping peer order among equal ranks. At most
/// `max(MinBids, Concurrency) * over_ask_factor` nodes are asked.
#[derive(Clone)]
pub struct NodeSelector {
    ranker: Arc<dyn NodeRanker>,
    over_ask_factor: usize,
    require_enough_nodes: bool,
}

impl NodeSelector {
    pub fn new(ranker: Arc<dyn NodeRanker>, config: &RequesterConfig) -> Self {
        Self {
            ranker,
            over_ask_factor: config.over_ask_factor.max(1),
            require_enough_nodes: config.require_enough_nodes,
        }
    }

    /// Nodes one shard's worth of bids needs
    pub fn required(job: &Job) -> usize {
        job.deal.min_bids.max(job.deal.concurrency)
    }

    pub async fn select(&self, job: &Job, peers: &[NodeId]) -> Result<Vec<NodeId>> {
        let required = Self::required(job);
        let ranked = self.ranker.rank_nodes(job, peers).await?;

        let mut eligible: Vec<NodeRank> = Vec::with_capacity(ranked.len());
        for rank in ranked {
            if rank.meets_requirement() {
                eligible.push(rank);
            } else {
                debug!(
                    job_id = %job.id,
                    node_id = %rank.node_id,
                    rank = rank.rank,
                    reason = %rank.reason,
                    "Node ruled out"
                );
            }
        }

        if self.require_enough_nodes && eligible.len() < required {
            return Err(ProtocolError::NotEnoughNodes {
                required,
                available: eligible.len(),
            });
        }

        eligible.sort_by(|a, b| b.rank.cmp(&a.rank));
        let limit = required.saturating_mul(self.over_ask_factor);
        let selected: Vec<NodeId> = eligible
            .into_iter()
            .take(limit)
            .map(|r| r.node_id)
            .collect();

        info!(
            job_id = %job.id,
            candidates = peers.len(),
            selected = selected.len(),
            limit,
            "🎯 Nodes selected for bidding"
        );
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verum_types::{Deal, JobSpec};

    fn job(concurrency: usize, min_bids: usize) -> Job {
        let deal = Deal::new(concurrency, 1, min_bids).unwrap();
        Job::new("client", JobSpec::new(1, b"payload".to_vec()), deal).unwrap()
    }

    fn nodes(n: usize) -> Vec<NodeId> {
        (0..n)
            .map(|i| NodeId::new(format!("compute-{}", i)).unwrap())
            .collect()
    }

    fn config(over_ask_factor: usize, require_enough_nodes: bool) -> RequesterConfig {
        RequesterConfig {
            over_ask_factor,
            require_enough_nodes,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_over_ask_bound_limits_candidates() {
        let selector = NodeSelector::new(Arc::new(UniformRanker), &config(3, false));
        let peers = nodes(10);

        // max(min_bids 2, concurrency 1) * 3
        let selected = selector.select(&job(1, 2), &peers).await.unwrap();
        assert_eq!(selected, peers[..6].to_vec());

        let selected = selector.select(&job(4, 0), &peers).await.unwrap();
        assert_eq!(selected.len(), 10);
    }

    #[tokio::test]
    async fn test_ranking_orders_and_filters() {
        let peers = nodes(4);
        let ranker = StaticRanker::new(RANK_POSSIBLE)
            .with_rank(peers[0].clone(), RANK_UNSUITABLE)
            .with_rank(peers[3].clone(), RANK_PREFERRED);
        let selector = NodeSelector::new(Arc::new(ranker), &config(3, false));

        let selected = selector.select(&job(1, 1), &peers).await.unwrap();
        assert_eq!(
            selected,
            vec![peers[3].clone(), peers[1].clone(), peers[2].clone()]
        );
    }

    #[tokio::test]
    async fn test_not_enough_nodes() {
        let peers = nodes(3);
        let ranker = StaticRanker::new(RANK_POSSIBLE).with_rank(peers[1].clone(), RANK_UNSUITABLE);

        let strict = NodeSelector::new(Arc::new(ranker.clone()), &config(3, true));
        let err = strict.select(&job(3, 0), &peers).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::NotEnoughNodes {
                required: 3,
                available: 2
            }
        ));
        assert_eq!(err.to_string(), "Not enough nodes: need 3, found 2");

        // Without the check the remaining nodes are still asked.
        let lenient = NodeSelector::new(Arc::new(ranker), &config(3, false));
        assert_eq!(lenient.select(&job(3, 0), &peers).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_zero_factor_still_asks_required_nodes() {
        let selector = NodeSelector::new(Arc::new(UniformRanker), &config(0, false));
        let selected = selector.select(&job(2, 0), &nodes(5)).await.unwrap();
        assert_eq!(selected.len(), 2);
    }
}
