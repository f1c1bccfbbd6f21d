use crate::{ExecutionId, JobId, NodeId, PublishedResult, ResultDigest, ShardId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle contract shared by state enums
pub trait LifecycleState: Copy + fmt::Debug + PartialEq {
    fn is_terminal(&self) -> bool;
    fn can_transition_to(&self, next: &Self) -> bool;
}

/// State of one execution. Transitions form a DAG; see `can_transition_to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionState {
    Created,
    Bidding,
    BidAccepted,
    BidRejected,
    Running,
    ResultProposed,
    ComputeError,
    ResultAccepted,
    ResultRejected,
    Published,
    Canceled,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Bidding => "Bidding",
            Self::BidAccepted => "BidAccepted",
            Self::BidRejected => "BidRejected",
            Self::Running => "Running",
            Self::ResultProposed => "ResultProposed",
            Self::ComputeError => "ComputeError",
            Self::ResultAccepted => "ResultAccepted",
            Self::ResultRejected => "ResultRejected",
            Self::Published => "Published",
            Self::Canceled => "Canceled",
        }
    }

    /// States in which the participant holds or runs work for the shard
    pub fn is_executing(&self) -> bool {
        matches!(self, Self::BidAccepted | Self::Running)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LifecycleState for ExecutionState {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::BidRejected
                | Self::ComputeError
                | Self::ResultRejected
                | Self::Published
                | Self::Canceled
        )
    }

    fn can_transition_to(&self, next: &Self) -> bool {
        use ExecutionState::*;
        match (self, next) {
            (s, Canceled) => !s.is_terminal(),

            (Created, Bidding) => true,

            (Bidding, BidAccepted) => true,
            (Bidding, BidRejected) => true,

            (BidAccepted, Running) => true,
            (BidAccepted, ComputeError) => true,

            (Running, ResultProposed) => true,
            (Running, ComputeError) => true,

            (ResultProposed, ResultAccepted) => true,
            (ResultProposed, ResultRejected) => true,

            // Publishing can still fail after acceptance
            (ResultAccepted, Published) => true,
            (ResultAccepted, ComputeError) => true,

            _ => false,
        }
    }
}

/// One entry of an execution's transition history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransitionRecord {
    pub from: Option<ExecutionState>,
    pub to: ExecutionState,
    pub comment: String,
    pub at: DateTime<Utc>,
}

/// One compute participant's attempt at one shard of one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub job_id: JobId,
    pub shard_index: u32,
    /// Compute participant running the shard
    pub node_id: NodeId,
    /// Requester that owns the job
    pub requester_id: NodeId,
    pub state: ExecutionState,
    pub result_proposal: Option<ResultDigest>,
    pub published_result: Option<PublishedResult>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<StateTransitionRecord>,
}

impl Execution {
    pub fn new(
        id: ExecutionId,
        job_id: JobId,
        shard_index: u32,
        node_id: NodeId,
        requester_id: NodeId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            job_id,
            shard_index,
            node_id,
            requester_id,
            state: ExecutionState::Created,
            result_proposal: None,
            published_result: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            history: vec![StateTransitionRecord {
                from: None,
                to: ExecutionState::Created,
                comment: "execution created".to_string(),
                at: now,
            }],
        }
    }

    pub fn shard(&self) -> ShardId {
        ShardId::new(self.job_id.clone(), self.shard_index)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether this execution ever passed through `state`
    pub fn reached(&self, state: ExecutionState) -> bool {
        self.history.iter().any(|record| record.to == state)
    }

    /// Whether this execution ever won its bid, regardless of where it ended
    pub fn bid_was_accepted(&self) -> bool {
        self.reached(ExecutionState::BidAccepted)
    }

    /// Whether this execution ever proposed a result
    pub fn has_proposed(&self) -> bool {
        self.result_proposal.is_some()
    }

    /// Move to `next` if the DAG allows it. Returns false without mutating
    /// otherwise.
    pub fn transition(&mut self, next: ExecutionState, comment: impl Into<String>) -> bool {
        if !self.state.can_transition_to(&next) {
            return false;
        }
        let now = Utc::now();
        self.history.push(StateTransitionRecord {
            from: Some(self.state),
            to: next,
            comment: comment.into(),
            at: now,
        });
        self.state = next;
        self.updated_at = now;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution() -> Execution {
        Execution::new(
            ExecutionId::generate(),
            JobId::generate(),
            0,
            NodeId::new("compute-1").unwrap(),
            NodeId::new("requester").unwrap(),
        )
    }

    #[test]
    fn test_terminal_states() {
        assert!(ExecutionState::Published.is_terminal());
        assert!(ExecutionState::BidRejected.is_terminal());
        assert!(ExecutionState::ComputeError.is_terminal());
        assert!(ExecutionState::ResultRejected.is_terminal());
        assert!(ExecutionState::Canceled.is_terminal());

        assert!(!ExecutionState::Created.is_terminal());
        assert!(!ExecutionState::Running.is_terminal());
        assert!(!ExecutionState::ResultAccepted.is_terminal());
    }

    #[test]
    fn test_happy_path() {
        use ExecutionState::*;
        let path = [
            Created,
            Bidding,
            BidAccepted,
            Running,
            ResultProposed,
            ResultAccepted,
            Published,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(&pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn test_no_cycles_or_skips() {
        use ExecutionState::*;
        assert!(!Bidding.can_transition_to(&ResultProposed));
        assert!(!Running.can_transition_to(&Bidding));
        assert!(!ResultProposed.can_transition_to(&Running));
        assert!(!Published.can_transition_to(&Canceled));
        assert!(!Canceled.can_transition_to(&Canceled));
    }

    #[test]
    fn test_any_non_terminal_can_cancel() {
        use ExecutionState::*;
        for state in [Created, Bidding, BidAccepted, Running, ResultProposed, ResultAccepted] {
            assert!(state.can_transition_to(&Canceled), "{:?}", state);
        }
    }

    #[test]
    fn test_transition_records_history() {
        let mut exec = execution();
        assert!(exec.transition(ExecutionState::Bidding, "asked to bid"));
        assert!(!exec.transition(ExecutionState::ResultProposed, "too early"));
        assert_eq!(exec.state, ExecutionState::Bidding);
        assert_eq!(exec.history.len(), 2);
        assert_eq!(exec.history[1].from, Some(ExecutionState::Created));
        assert!(!exec.bid_was_accepted());

        assert!(exec.transition(ExecutionState::BidAccepted, "won"));
        assert!(exec.transition(ExecutionState::Canceled, "user"));
        assert!(exec.bid_was_accepted());
    }
}
