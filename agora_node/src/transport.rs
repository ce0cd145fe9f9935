use std::{sync::Arc, time::Duration};

use agora_engine::{
    db_types::PeerId,
    messenger::PeerEnvelope,
    traits::{PeerTransport, TransportError},
};
use async_trait::async_trait;
use log::*;

/// Puts a deadline on direct sends, so that a slow peer is treated as unreachable and the messenger falls back to
/// its inboxes.
pub struct TimeoutTransport {
    inner: Arc<dyn PeerTransport>,
    timeout: Duration,
}

impl TimeoutTransport {
    pub fn new(inner: Arc<dyn PeerTransport>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl PeerTransport for TimeoutTransport {
    async fn send_direct(&self, envelope: &PeerEnvelope) -> Result<(), TransportError> {
        match tokio::time::timeout(self.timeout, self.inner.send_direct(envelope)).await {
            Ok(result) => result,
            Err(_) => {
                debug!("📨️ Direct send of {} to {} timed out", envelope.message_id, envelope.recipient.short());
                Err(TransportError::Timeout(envelope.recipient.clone()))
            },
        }
    }

    async fn store_in_inbox(&self, inbox: &PeerId, envelope: &PeerEnvelope) -> Result<(), TransportError> {
        match tokio::time::timeout(self.timeout, self.inner.store_in_inbox(inbox, envelope)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(inbox.clone())),
        }
    }

    async fn inboxes_for(&self, peer: &PeerId) -> Result<Vec<PeerId>, TransportError> {
        self.inner.inboxes_for(peer).await
    }
}

#[cfg(test)]
mod test {
    use agora_engine::db_types::MessageId;

    use super::*;

    struct Stalled;

    #[async_trait]
    impl PeerTransport for Stalled {
        async fn send_direct(&self, _envelope: &PeerEnvelope) -> Result<(), TransportError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        async fn store_in_inbox(&self, _inbox: &PeerId, _envelope: &PeerEnvelope) -> Result<(), TransportError> {
            Ok(())
        }

        async fn inboxes_for(&self, _peer: &PeerId) -> Result<Vec<PeerId>, TransportError> {
            Ok(vec![PeerId::new("inbox")])
        }
    }

    #[tokio::test]
    async fn slow_sends_time_out() {
        let transport = TimeoutTransport::new(Arc::new(Stalled), Duration::from_millis(20));
        let envelope = PeerEnvelope::ack(PeerId::new("me"), PeerId::new("them"), MessageId::random());
        let err = transport.send_direct(&envelope).await.unwrap_err();
        assert_eq!(err, TransportError::Timeout(PeerId::new("them")));
        assert!(transport.store_in_inbox(&PeerId::new("inbox"), &envelope).await.is_ok());
        assert_eq!(transport.inboxes_for(&PeerId::new("them")).await.unwrap().len(), 1);
    }
}
