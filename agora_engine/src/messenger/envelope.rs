use serde::{Deserialize, Serialize};

use crate::{
    db_types::{MessageId, PeerId},
    order_messages::SignedOrderMessage,
    traits::TransportError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "camelCase")]
pub enum EnvelopePayload {
    Order(SignedOrderMessage),
    /// Acknowledges the envelope with the given id.
    Ack(MessageId),
}

/// What actually travels between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEnvelope {
    pub message_id: MessageId,
    pub sender: PeerId,
    pub recipient: PeerId,
    /// Per-recipient counter of the sender. Informational; the processor does not depend on arrival order.
    pub sequence: i64,
    pub payload: EnvelopePayload,
}

impl PeerEnvelope {
    pub fn order(sender: PeerId, recipient: PeerId, sequence: i64, message: SignedOrderMessage) -> Self {
        Self { message_id: MessageId::random(), sender, recipient, sequence, payload: EnvelopePayload::Order(message) }
    }

    pub fn ack(sender: PeerId, recipient: PeerId, acked: MessageId) -> Self {
        Self { message_id: MessageId::random(), sender, recipient, sequence: 0, payload: EnvelopePayload::Ack(acked) }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self.payload, EnvelopePayload::Ack(_))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::Encoding(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(bytes).map_err(|e| TransportError::Encoding(e.to_string()))
    }
}
