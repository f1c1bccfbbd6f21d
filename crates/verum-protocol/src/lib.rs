/*!
# Verum Redundant Execution Protocol

Distributes a job's shards to several untrusted compute participants, runs
each shard redundantly, verifies the proposed results by hash agreement and
publishes exactly the agreed outputs.

## Module Structure

- **registry**: Execution records, conditional transitions, history
- **admission**: Compute-side bid strategies and the concurrency cap
- **selection**: Ranking of compute peers before bids are asked for
- **bidding**: Requester-side bid solicitation and selection
- **verification**: Per-shard quorum windows and agreement policies
- **publish**: Fan-out of accept/reject decisions
- **cancel**: Requester-authoritative cancellation
- **requester**: The orchestrating node
- **compute**: The participant node
- **executor**: Execution and publish backends
- **messages** / **endpoint**: Wire messages and the two endpoint traits
- **transport**: In-process and relayed carriers
- **status**: Shard and job outcomes, progress events
- **config** / **error**

## Execution Lifecycle

```text
Created ─▶ Bidding ─▶ BidAccepted ─▶ Running ─▶ ResultProposed ─▶ ResultAccepted ─▶ Published
              │            │            │              │                │
              ▼            ▼            ▼              ▼                ▼
         BidRejected  ComputeError ComputeError  ResultRejected   ComputeError

any non-terminal state ─▶ Canceled
```

The requester's registry is authoritative. The compute participant keeps a
mirror that may lag and reconciles on every inbound message.
*/

pub mod admission;
pub mod bidding;
pub mod cancel;
pub mod compute;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod messages;
pub mod publish;
pub mod registry;
pub mod requester;
pub mod selection;
pub mod status;
pub mod transport;
pub mod verification;

pub use admission::{
    AdmissionController, BidDecision, BidStrategy, HealthSignal, LabelSelectorStrategy,
    NodeHealthStrategy, ResourceFitStrategy, StaticHealth, StrategyKind, AT_CAPACITY,
};
pub use bidding::{BidCoordinator, BidRound, BidSelection, ReceivedBid};
pub use cancel::CancellationHandler;
pub use compute::{ComputeNode, ComputeSweepReport};
pub use config::{ComputeConfig, PartialBidPolicy, RelayConfig, RequesterConfig};
pub use endpoint::{ComputeEndpoint, RequesterEndpoint};
pub use error::{ProtocolError, Result};
pub use executor::{
    Blake3Executor, ExecutionOutput, Executor, FailingExecutor, MemoryPublisher, Publisher,
};
pub use messages::{CallbackAck, CancelResult};
pub use publish::{PublishCoordinator, PublishTarget};
pub use registry::{ExecutionRegistry, TransitionOutcome, UpdateRequest};
pub use requester::{RequesterNode, SweepReport};
pub use selection::{
    NodeRank, NodeRanker, NodeSelector, StaticRanker, UniformRanker, RANK_POSSIBLE,
    RANK_PREFERRED, RANK_UNSUITABLE,
};
pub use status::{JobEvent, JobState, JobStatus, ShardFailure, ShardOutcome, ShardStatus};
pub use transport::{InProcessNetwork, Network, RelayNetwork};
pub use verification::{
    verifier_for, AcceptFirstVerifier, HashAgreementVerifier, Proposal, ShardQuorumState,
    VerificationOutcome, Verifier,
};
