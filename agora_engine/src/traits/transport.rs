use async_trait::async_trait;
use thiserror::Error;

use crate::{db_types::PeerId, messenger::PeerEnvelope};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Peer {0} is unreachable")]
    PeerUnreachable(PeerId),
    #[error("Timed out talking to {0}")]
    Timeout(PeerId),
    #[error("Could not encode envelope: {0}")]
    Encoding(String),
    #[error("Transport error: {0}")]
    Other(String),
}

/// How the messenger gets envelopes to other nodes. Delivery to the recipient's inbound queue is all a transport
/// promises; acknowledgement is the messenger's business.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Hands the envelope straight to its recipient.
    async fn send_direct(&self, envelope: &PeerEnvelope) -> Result<(), TransportError>;

    /// Leaves the envelope with a store-and-forward `inbox` peer for the recipient to collect later.
    async fn store_in_inbox(&self, inbox: &PeerId, envelope: &PeerEnvelope) -> Result<(), TransportError>;

    /// The inbox peers `peer` advertises.
    async fn inboxes_for(&self, peer: &PeerId) -> Result<Vec<PeerId>, TransportError>;
}
