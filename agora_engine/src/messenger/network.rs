use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use log::*;
use tokio::sync::mpsc;

use crate::{
    db_types::PeerId,
    messenger::PeerEnvelope,
    traits::{PeerTransport, TransportError},
};

struct PeerSlot {
    inbound: mpsc::UnboundedSender<PeerEnvelope>,
    online: bool,
    inboxes: Vec<PeerId>,
}

#[derive(Default)]
struct NetworkState {
    peers: HashMap<PeerId, PeerSlot>,
    /// Envelopes held by inbox peers, keyed by the recipient they are waiting for.
    stored: HashMap<PeerId, Vec<PeerEnvelope>>,
}

/// A process-local network. Peers can be taken offline to exercise store-and-forward delivery and retries.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, NetworkState>, TransportError> {
        self.state.lock().map_err(|_| TransportError::Other("network state is poisoned".into()))
    }

    /// Brings `peer` online and returns its inbound queue. Reconnecting replaces any earlier queue.
    pub fn connect(
        &self,
        peer: &PeerId,
        inboxes: Vec<PeerId>,
    ) -> Result<mpsc::UnboundedReceiver<PeerEnvelope>, TransportError> {
        let (inbound, rx) = mpsc::unbounded_channel();
        let mut state = self.lock()?;
        state.peers.insert(peer.clone(), PeerSlot { inbound, online: true, inboxes });
        Self::collect_stored(&mut state, peer);
        debug!("📨️ {} joined the network", peer.short());
        Ok(rx)
    }

    pub fn set_online(&self, peer: &PeerId, online: bool) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        match state.peers.get_mut(peer) {
            Some(slot) => slot.online = online,
            None => return Err(TransportError::PeerUnreachable(peer.clone())),
        }
        if online {
            Self::collect_stored(&mut state, peer);
        }
        debug!("📨️ {} is now {}", peer.short(), if online { "online" } else { "offline" });
        Ok(())
    }

    pub fn is_online(&self, peer: &PeerId) -> bool {
        self.lock().map(|s| s.peers.get(peer).map(|p| p.online).unwrap_or(false)).unwrap_or(false)
    }

    /// Envelopes currently held in inboxes for `peer`.
    pub fn stored_for(&self, peer: &PeerId) -> usize {
        self.lock().map(|s| s.stored.get(peer).map(Vec::len).unwrap_or(0)).unwrap_or(0)
    }

    fn collect_stored(state: &mut NetworkState, peer: &PeerId) {
        let waiting = state.stored.remove(peer).unwrap_or_default();
        if let Some(slot) = state.peers.get(peer) {
            let count = waiting.len();
            for envelope in waiting {
                let _ = slot.inbound.send(envelope);
            }
            if count > 0 {
                debug!("📨️ {} collected {count} envelopes from its inboxes", peer.short());
            }
        }
    }
}

#[async_trait]
impl PeerTransport for InMemoryNetwork {
    async fn send_direct(&self, envelope: &PeerEnvelope) -> Result<(), TransportError> {
        let state = self.lock()?;
        match state.peers.get(&envelope.recipient) {
            Some(slot) if slot.online => slot
                .inbound
                .send(envelope.clone())
                .map_err(|_| TransportError::PeerUnreachable(envelope.recipient.clone())),
            _ => Err(TransportError::PeerUnreachable(envelope.recipient.clone())),
        }
    }

    async fn store_in_inbox(&self, inbox: &PeerId, envelope: &PeerEnvelope) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        let inbox_online = state.peers.get(inbox).map(|p| p.online).unwrap_or(false);
        if !inbox_online {
            return Err(TransportError::PeerUnreachable(inbox.clone()));
        }
        let held = state.stored.entry(envelope.recipient.clone()).or_default();
        if !held.iter().any(|e| e.message_id == envelope.message_id) {
            held.push(envelope.clone());
        }
        Ok(())
    }

    async fn inboxes_for(&self, peer: &PeerId) -> Result<Vec<PeerId>, TransportError> {
        Ok(self.lock()?.peers.get(peer).map(|p| p.inboxes.clone()).unwrap_or_default())
    }
}
