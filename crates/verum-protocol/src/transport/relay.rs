use super::Network;
use crate::config::RelayConfig;
use crate::endpoint::{ComputeEndpoint, RequesterEndpoint};
use crate::messages::*;
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, RwLock, Semaphore};
use tracing::{debug, warn};
use verum_types::{NodeId, RoutingMetadata};

/// Every message the relay carries, as encoded on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum ProtocolMessage {
    AskForBid(AskForBidRequest),
    BidAccepted(BidAcceptedRequest),
    BidRejected(BidRejectedRequest),
    ResultAccepted(ResultAcceptedRequest),
    ResultRejected(ResultRejectedRequest),
    CancelExecution(CancelExecutionRequest),
    RunComplete(RunComplete),
    PublishComplete(PublishComplete),
    CancelComplete(CancelComplete),
    ComputeFailure(ComputeFailure),
}

impl ProtocolMessage {
    pub fn routing(&self) -> &RoutingMetadata {
        match self {
            Self::AskForBid(m) => &m.routing,
            Self::BidAccepted(m) => &m.routing,
            Self::BidRejected(m) => &m.routing,
            Self::ResultAccepted(m) => &m.routing,
            Self::ResultRejected(m) => &m.routing,
            Self::CancelExecution(m) => &m.routing,
            Self::RunComplete(m) => &m.routing,
            Self::PublishComplete(m) => &m.routing,
            Self::CancelComplete(m) => &m.routing,
            Self::ComputeFailure(m) => &m.routing,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::AskForBid(_) => "ask_for_bid",
            Self::BidAccepted(_) => "bid_accepted",
            Self::BidRejected(_) => "bid_rejected",
            Self::ResultAccepted(_) => "result_accepted",
            Self::ResultRejected(_) => "result_rejected",
            Self::CancelExecution(_) => "cancel_execution",
            Self::RunComplete(_) => "run_complete",
            Self::PublishComplete(_) => "publish_complete",
            Self::CancelComplete(_) => "cancel_complete",
            Self::ComputeFailure(_) => "compute_failure",
        }
    }

    fn is_callback(&self) -> bool {
        matches!(
            self,
            Self::RunComplete(_)
                | Self::PublishComplete(_)
                | Self::CancelComplete(_)
                | Self::ComputeFailure(_)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum ProtocolReply {
    Bids(AskForBidResponse),
    Ack(ExecutionAck),
    Cancel(CancelExecutionResponse),
    Callback(CallbackAck),
    Error(String),
}

struct Envelope {
    payload: Vec<u8>,
    reply: oneshot::Sender<Vec<u8>>,
}

#[derive(Clone)]
enum Handler {
    Compute(Weak<dyn ComputeEndpoint>),
    Requester(Weak<dyn RequesterEndpoint>),
}

impl Handler {
    async fn handle(&self, message: ProtocolMessage) -> Result<ProtocolReply> {
        match self {
            Self::Compute(weak) => {
                let endpoint = weak
                    .upgrade()
                    .ok_or_else(|| ProtocolError::PeerUnreachable("compute endpoint dropped".into()))?;
                match message {
                    ProtocolMessage::AskForBid(m) => endpoint.ask_for_bid(m).await.map(ProtocolReply::Bids),
                    ProtocolMessage::BidAccepted(m) => endpoint.bid_accepted(m).await.map(ProtocolReply::Ack),
                    ProtocolMessage::BidRejected(m) => endpoint.bid_rejected(m).await.map(ProtocolReply::Ack),
                    ProtocolMessage::ResultAccepted(m) => {
                        endpoint.result_accepted(m).await.map(ProtocolReply::Ack)
                    }
                    ProtocolMessage::ResultRejected(m) => {
                        endpoint.result_rejected(m).await.map(ProtocolReply::Ack)
                    }
                    ProtocolMessage::CancelExecution(m) => {
                        endpoint.cancel_execution(m).await.map(ProtocolReply::Cancel)
                    }
                    other => Err(ProtocolError::Codec(format!(
                        "compute endpoint cannot handle {}",
                        other.kind()
                    ))),
                }
            }
            Self::Requester(weak) => {
                let endpoint = weak
                    .upgrade()
                    .ok_or_else(|| ProtocolError::PeerUnreachable("requester endpoint dropped".into()))?;
                let ack = match message {
                    ProtocolMessage::RunComplete(m) => endpoint.on_run_complete(m).await,
                    ProtocolMessage::PublishComplete(m) => endpoint.on_publish_complete(m).await,
                    ProtocolMessage::CancelComplete(m) => endpoint.on_cancel_complete(m).await,
                    ProtocolMessage::ComputeFailure(m) => endpoint.on_compute_failure(m).await,
                    other => {
                        return Err(ProtocolError::Codec(format!(
                            "requester endpoint cannot handle {}",
                            other.kind()
                        )))
                    }
                };
                ack.map(ProtocolReply::Callback)
            }
        }
    }
}

/// Network-relayed transport.
///
/// Messages are JSON encoded into per-peer bounded inboxes; each peer
/// handles at most `workers` envelopes at once. Replies travel back on a
/// oneshot channel. Remote errors arrive as [`ProtocolError::Remote`].
pub struct RelayNetwork {
    config: RelayConfig,
    inboxes: RwLock<HashMap<NodeId, mpsc::Sender<Envelope>>>,
}

impl RelayNetwork {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inboxes: RwLock::new(HashMap::new()),
        })
    }

    async fn attach(&self, id: NodeId, handler: Handler) {
        let (tx, rx) = mpsc::channel(self.config.queue_depth.max(1));
        let workers = Arc::new(Semaphore::new(self.config.workers.max(1)));
        tokio::spawn(serve(id.clone(), rx, handler, workers));
        // Replacing the sender closes the previous inbox.
        self.inboxes.write().await.insert(id, tx);
    }

    async fn send(&self, message: &ProtocolMessage) -> Result<ProtocolReply> {
        let target = &message.routing().target_peer_id;
        let inbox = self
            .inboxes
            .read()
            .await
            .get(target)
            .cloned()
            .ok_or_else(|| ProtocolError::PeerUnreachable(target.to_string()))?;

        let payload = serde_json::to_vec(message)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        inbox
            .send(Envelope {
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ProtocolError::TransportClosed(target.to_string()))?;

        let timeout = self.config.request_timeout();
        let bytes = match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(_)) => return Err(ProtocolError::TransportClosed(target.to_string())),
            Err(_) => return Err(ProtocolError::timeout(message.kind(), timeout)),
        };

        match serde_json::from_slice(&bytes)? {
            ProtocolReply::Error(e) => Err(ProtocolError::Remote(e)),
            reply => Ok(reply),
        }
    }

    /// Send a message; callbacks are sent twice when configured to
    /// exercise at-least-once delivery.
    async fn deliver(&self, message: ProtocolMessage) -> Result<ProtocolReply> {
        let reply = self.send(&message).await;
        if self.config.duplicate_callbacks && message.is_callback() {
            match self.send(&message).await {
                Ok(second) => debug!(kind = message.kind(), reply = ?second, "Duplicate delivery"),
                Err(e) => debug!(kind = message.kind(), error = %e, "Duplicate delivery failed"),
            }
        }
        reply
    }
}

async fn serve(
    id: NodeId,
    mut inbox: mpsc::Receiver<Envelope>,
    handler: Handler,
    workers: Arc<Semaphore>,
) {
    while let Some(envelope) = inbox.recv().await {
        let permit = match workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let handler = handler.clone();
        let peer = id.clone();
        tokio::spawn(async move {
            let reply = match serde_json::from_slice::<ProtocolMessage>(&envelope.payload) {
                Ok(message) => handler
                    .handle(message)
                    .await
                    .unwrap_or_else(|e| ProtocolReply::Error(e.to_string())),
                Err(e) => {
                    warn!(node_id = %peer, error = %e, "⚠️ Undecodable envelope");
                    ProtocolReply::Error(format!("codec: {}", e))
                }
            };
            match serde_json::to_vec(&reply) {
                Ok(bytes) => {
                    let _ = envelope.reply.send(bytes);
                }
                Err(e) => warn!(node_id = %peer, error = %e, "Reply not encodable"),
            }
            drop(permit);
        });
    }
    debug!(node_id = %id, "Relay inbox closed");
}

fn unexpected(reply: ProtocolReply) -> ProtocolError {
    ProtocolError::Codec(format!("unexpected reply: {:?}", reply))
}

#[async_trait]
impl Network for RelayNetwork {
    async fn register_compute(&self, id: NodeId, endpoint: Arc<dyn ComputeEndpoint>) {
        self.attach(id, Handler::Compute(Arc::downgrade(&endpoint)))
            .await;
    }

    async fn register_requester(&self, id: NodeId, endpoint: Arc<dyn RequesterEndpoint>) {
        self.attach(id, Handler::Requester(Arc::downgrade(&endpoint)))
            .await;
    }

    async fn unregister(&self, id: &NodeId) {
        self.inboxes.write().await.remove(id);
    }
}

#[async_trait]
impl ComputeEndpoint for RelayNetwork {
    async fn ask_for_bid(&self, request: AskForBidRequest) -> Result<AskForBidResponse> {
        match self.deliver(ProtocolMessage::AskForBid(request)).await? {
            ProtocolReply::Bids(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn bid_accepted(&self, request: BidAcceptedRequest) -> Result<ExecutionAck> {
        match self.deliver(ProtocolMessage::BidAccepted(request)).await? {
            ProtocolReply::Ack(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    async fn bid_rejected(&self, request: BidRejectedRequest) -> Result<ExecutionAck> {
        match self.deliver(ProtocolMessage::BidRejected(request)).await? {
            ProtocolReply::Ack(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    async fn result_accepted(&self, request: ResultAcceptedRequest) -> Result<ExecutionAck> {
        match self.deliver(ProtocolMessage::ResultAccepted(request)).await? {
            ProtocolReply::Ack(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    async fn result_rejected(&self, request: ResultRejectedRequest) -> Result<ExecutionAck> {
        match self.deliver(ProtocolMessage::ResultRejected(request)).await? {
            ProtocolReply::Ack(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    async fn cancel_execution(
        &self,
        request: CancelExecutionRequest,
    ) -> Result<CancelExecutionResponse> {
        match self.deliver(ProtocolMessage::CancelExecution(request)).await? {
            ProtocolReply::Cancel(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl RequesterEndpoint for RelayNetwork {
    async fn on_run_complete(&self, callback: RunComplete) -> Result<CallbackAck> {
        match self.deliver(ProtocolMessage::RunComplete(callback)).await? {
            ProtocolReply::Callback(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    async fn on_publish_complete(&self, callback: PublishComplete) -> Result<CallbackAck> {
        match self.deliver(ProtocolMessage::PublishComplete(callback)).await? {
            ProtocolReply::Callback(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    async fn on_cancel_complete(&self, callback: CancelComplete) -> Result<CallbackAck> {
        match self.deliver(ProtocolMessage::CancelComplete(callback)).await? {
            ProtocolReply::Callback(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    async fn on_compute_failure(&self, callback: ComputeFailure) -> Result<CallbackAck> {
        match self.deliver(ProtocolMessage::ComputeFailure(callback)).await? {
            ProtocolReply::Callback(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verum_types::ExecutionId;

    #[test]
    fn test_message_wire_tag() {
        let message = ProtocolMessage::CancelComplete(CancelComplete {
            routing: RoutingMetadata::new(
                NodeId::new("compute-1").unwrap(),
                NodeId::new("requester").unwrap(),
            ),
            execution_id: ExecutionId::parse("e-1").unwrap(),
        });
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "cancel_complete");
        assert_eq!(value["body"]["execution_id"], "e-1");
        assert_eq!(message.routing().target_peer_id.as_str(), "requester");
    }

    #[tokio::test]
    async fn test_unregistered_peer() {
        let relay = RelayNetwork::new(RelayConfig::default());
        let result = relay
            .on_cancel_complete(CancelComplete {
                routing: RoutingMetadata::new(
                    NodeId::new("compute-1").unwrap(),
                    NodeId::new("requester").unwrap(),
                ),
                execution_id: ExecutionId::generate(),
            })
            .await;
        assert!(matches!(result, Err(ProtocolError::PeerUnreachable(_))));
    }
}
