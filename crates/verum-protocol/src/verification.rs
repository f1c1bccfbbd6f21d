use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::info;
use verum_types::{Deal, ExecutionId, ResultDigest, ShardId, VerifierKind};

/// A proposed result as seen by the requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub execution_id: ExecutionId,
    pub digest: ResultDigest,
    /// Arrival order within the shard, starting at 0
    pub arrival: u64,
}

/// Partition of a shard's proposals into accepted and rejected executions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub accepted: Vec<ExecutionId>,
    pub rejected: Vec<ExecutionId>,
    pub winning_digest: Option<ResultDigest>,
}

impl VerificationOutcome {
    /// False when no proposal group reached confidence
    pub fn has_quorum(&self) -> bool {
        !self.accepted.is_empty()
    }
}

/// Agreement policy over a shard's proposals
pub trait Verifier: Send + Sync {
    fn name(&self) -> &'static str;

    fn verify(&self, shard: &ShardId, proposals: &[Proposal], deal: &Deal) -> VerificationOutcome;
}

pub fn verifier_for(kind: VerifierKind) -> Arc<dyn Verifier> {
    match kind {
        VerifierKind::HashAgreement => Arc::new(HashAgreementVerifier),
        VerifierKind::AcceptFirst => Arc::new(AcceptFirstVerifier),
    }
}

/// Hash-agreement voting.
///
/// Proposals are grouped by digest. The largest group is accepted when its
/// size reaches `deal.confidence`; equal sizes go to the group whose first
/// proposal arrived earliest. Everything else is rejected.
pub struct HashAgreementVerifier;

struct Partition {
    digest: ResultDigest,
    first_arrival: u64,
    members: Vec<ExecutionId>,
}

impl Verifier for HashAgreementVerifier {
    fn name(&self) -> &'static str {
        "hash_agreement"
    }

    fn verify(&self, shard: &ShardId, proposals: &[Proposal], deal: &Deal) -> VerificationOutcome {
        let start = std::time::Instant::now();

        let mut ordered: Vec<&Proposal> = proposals.iter().collect();
        ordered.sort_by_key(|p| p.arrival);

        let mut index: HashMap<ResultDigest, usize> = HashMap::new();
        let mut partitions: Vec<Partition> = Vec::new();
        for proposal in ordered {
            match index.get(&proposal.digest) {
                Some(&i) => partitions[i].members.push(proposal.execution_id.clone()),
                None => {
                    index.insert(proposal.digest, partitions.len());
                    partitions.push(Partition {
                        digest: proposal.digest,
                        first_arrival: proposal.arrival,
                        members: vec![proposal.execution_id.clone()],
                    });
                }
            }
        }

        // Partitions are already in first-arrival order, so the first maximum wins ties.
        let mut winner: Option<usize> = None;
        for (i, partition) in partitions.iter().enumerate() {
            let better = match winner {
                None => true,
                Some(w) => {
                    let current = &partitions[w];
                    partition.members.len() > current.members.len()
                        || (partition.members.len() == current.members.len()
                            && partition.first_arrival < current.first_arrival)
                }
            };
            if better {
                winner = Some(i);
            }
        }
        let winner = winner.filter(|&w| partitions[w].members.len() >= deal.confidence);

        let mut outcome = VerificationOutcome::default();
        for (i, partition) in partitions.into_iter().enumerate() {
            if Some(i) == winner {
                outcome.winning_digest = Some(partition.digest);
                outcome.accepted.extend(partition.members);
            } else {
                outcome.rejected.extend(partition.members);
            }
        }

        let emoji = if outcome.has_quorum() { "✅" } else { "❌" };
        info!(
            shard = %shard,
            proposals = proposals.len(),
            confidence = deal.confidence,
            accepted = outcome.accepted.len(),
            rejected = outcome.rejected.len(),
            passed = outcome.has_quorum(),
            duration_ms = start.elapsed().as_millis() as u64,
            "{} Proposals tallied",
            emoji
        );

        outcome
    }
}

/// Accepts the first proposal unconditionally and rejects the rest
pub struct AcceptFirstVerifier;

impl Verifier for AcceptFirstVerifier {
    fn name(&self) -> &'static str {
        "accept_first"
    }

    fn verify(&self, shard: &ShardId, proposals: &[Proposal], _deal: &Deal) -> VerificationOutcome {
        let mut ordered: Vec<&Proposal> = proposals.iter().collect();
        ordered.sort_by_key(|p| p.arrival);

        let mut outcome = VerificationOutcome::default();
        let mut iter = ordered.into_iter();
        if let Some(first) = iter.next() {
            outcome.accepted.push(first.execution_id.clone());
            outcome.winning_digest = Some(first.digest);
        }
        outcome
            .rejected
            .extend(iter.map(|p| p.execution_id.clone()));

        info!(
            shard = %shard,
            proposals = proposals.len(),
            accepted = outcome.accepted.len(),
            "✅ First proposal accepted"
        );
        outcome
    }
}

/// Verification window of one shard.
///
/// Lives from the moment bids are accepted until the shard's proposals have
/// been partitioned.
#[derive(Debug)]
pub struct ShardQuorumState {
    pub shard: ShardId,
    /// Accepted executions that can still propose
    pub expected: usize,
    pub deadline: Instant,
    pub outcome: Option<VerificationOutcome>,
    proposals: Vec<Proposal>,
    next_arrival: u64,
}

impl ShardQuorumState {
    pub fn new(shard: ShardId, expected: usize, deadline: Instant) -> Self {
        Self {
            shard,
            expected,
            deadline,
            outcome: None,
            proposals: Vec::new(),
            next_arrival: 0,
        }
    }

    /// Record a proposal. Returns false for duplicates or once decided.
    pub fn record(&mut self, execution_id: ExecutionId, digest: ResultDigest) -> bool {
        if self.outcome.is_some() || self.proposals.iter().any(|p| p.execution_id == execution_id)
        {
            return false;
        }
        self.proposals.push(Proposal {
            execution_id,
            digest,
            arrival: self.next_arrival,
        });
        self.next_arrival += 1;
        true
    }

    /// An accepted execution ended without proposing
    pub fn withdraw(&mut self) {
        self.expected = self.expected.saturating_sub(1);
    }

    /// A proposing execution ended before the decision. Its vote no longer
    /// counts. Returns false once decided or when it never proposed here.
    pub fn retract(&mut self, execution_id: &ExecutionId) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        let before = self.proposals.len();
        self.proposals.retain(|p| &p.execution_id != execution_id);
        if self.proposals.len() == before {
            return false;
        }
        self.expected = self.expected.saturating_sub(1);
        true
    }

    pub fn proposals(&self) -> &[Proposal] {
        &self.proposals
    }

    pub fn received(&self) -> usize {
        self.proposals.len()
    }

    /// Every execution still able to propose has proposed
    pub fn is_ready(&self) -> bool {
        self.outcome.is_none() && self.proposals.len() >= self.expected
    }

    pub fn is_decided(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn decide(&mut self, verifier: &dyn Verifier, deal: &Deal) -> VerificationOutcome {
        let outcome = verifier.verify(&self.shard, &self.proposals, deal);
        self.outcome = Some(outcome.clone());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verum_types::JobId;

    fn shard() -> ShardId {
        ShardId::new(JobId::generate(), 0)
    }

    fn proposals(digests: &[&[u8]]) -> Vec<Proposal> {
        digests
            .iter()
            .enumerate()
            .map(|(i, d)| Proposal {
                execution_id: ExecutionId::parse(format!("e-{}", i)).unwrap(),
                digest: ResultDigest::of(d),
                arrival: i as u64,
            })
            .collect()
    }

    fn ids(list: &[usize]) -> Vec<ExecutionId> {
        list.iter()
            .map(|i| ExecutionId::parse(format!("e-{}", i)).unwrap())
            .collect()
    }

    #[test]
    fn test_unanimous_proposals_all_accepted() {
        let deal = Deal::new(3, 2, 0).unwrap();
        let outcome = HashAgreementVerifier.verify(&shard(), &proposals(&[b"a", b"a", b"a"]), &deal);
        assert_eq!(outcome.accepted, ids(&[0, 1, 2]));
        assert!(outcome.rejected.is_empty());
        assert_eq!(outcome.winning_digest, Some(ResultDigest::of(b"a")));
    }

    #[test]
    fn test_majority_wins_minority_rejected() {
        let deal = Deal::new(3, 2, 0).unwrap();
        let outcome = HashAgreementVerifier.verify(&shard(), &proposals(&[b"a", b"b", b"a"]), &deal);
        assert_eq!(outcome.accepted, ids(&[0, 2]));
        assert_eq!(outcome.rejected, ids(&[1]));
    }

    #[test]
    fn test_no_quorum_accepts_nothing() {
        let deal = Deal::new(2, 2, 0).unwrap();
        let outcome = HashAgreementVerifier.verify(&shard(), &proposals(&[b"a", b"b"]), &deal);
        assert!(!outcome.has_quorum());
        assert!(outcome.winning_digest.is_none());
        assert_eq!(outcome.rejected.len(), 2);
    }

    #[test]
    fn test_tie_goes_to_first_arrived_partition() {
        let deal = Deal::new(4, 1, 0).unwrap();
        let outcome =
            HashAgreementVerifier.verify(&shard(), &proposals(&[b"b", b"a", b"a", b"b"]), &deal);
        assert_eq!(outcome.accepted, ids(&[0, 3]));
        assert_eq!(outcome.rejected, ids(&[1, 2]));
    }

    #[test]
    fn test_accept_first() {
        let deal = Deal::new(3, 3, 0).unwrap();
        let outcome = AcceptFirstVerifier.verify(&shard(), &proposals(&[b"x", b"y", b"x"]), &deal);
        assert_eq!(outcome.accepted, ids(&[0]));
        assert_eq!(outcome.rejected, ids(&[1, 2]));
    }

    #[test]
    fn test_quorum_state_readiness() {
        let mut state = ShardQuorumState::new(shard(), 3, Instant::now());
        let a = ExecutionId::generate();
        assert!(state.record(a.clone(), ResultDigest::of(b"a")));
        assert!(!state.record(a, ResultDigest::of(b"a")));
        assert!(!state.is_ready());

        state.withdraw();
        assert!(state.record(ExecutionId::generate(), ResultDigest::of(b"a")));
        assert!(state.is_ready());

        let outcome = state.decide(&HashAgreementVerifier, &Deal::new(3, 2, 0).unwrap());
        assert_eq!(outcome.accepted.len(), 2);
        assert!(!state.is_ready());
        assert!(!state.record(ExecutionId::generate(), ResultDigest::of(b"a")));
    }

    #[test]
    fn test_retracted_proposal_stops_counting() {
        let deal = Deal::new(2, 2, 0).unwrap();
        let mut state = ShardQuorumState::new(shard(), 2, Instant::now());
        let first = ExecutionId::generate();
        assert!(state.record(first.clone(), ResultDigest::of(b"a")));

        assert!(state.retract(&first));
        assert!(!state.retract(&first));
        assert_eq!(state.received(), 0);
        assert_eq!(state.expected, 1);

        assert!(state.record(ExecutionId::generate(), ResultDigest::of(b"a")));
        assert!(state.is_ready());
        let outcome = state.decide(&HashAgreementVerifier, &deal);
        assert!(!outcome.has_quorum());
        assert!(!state.retract(&ExecutionId::generate()));
    }
}
