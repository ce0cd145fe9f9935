//! # Reliable messenger
//!
//! Order messages must reach their recipients even if one side is offline for days. The messenger gives
//! at-least-once delivery on top of a lossy [`PeerTransport`]:
//!
//! 1. [`ReliableMessenger::send_reliably`] writes an outgoing row inside the caller's store transaction. If the
//!    transaction rolls back, nothing is sent.
//! 2. After commit, the retry worker ([`ReliableMessenger::run`]) tries a direct send, then each inbox the recipient
//!    advertises, backing off exponentially (with jitter, up to a cap) until an ACK for the envelope id comes back.
//! 3. The recipient runs receive → process → [`ReliableMessenger::acknowledge`]. Envelope ids it has seen before are
//!    reported as duplicates and acknowledged again.
//! 4. An ACK deletes the outgoing row. Once every recipient of a stored order message has acknowledged it, the
//!    message's ACK bit is set.
//!
//! Rows live in the order store, so a restarted node resumes retrying where it left off.
mod envelope;
mod network;

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use chrono::{DateTime, Utc};
pub use envelope::{EnvelopePayload, PeerEnvelope};
use log::*;
pub use network::InMemoryNetwork;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::{
    db::{
        sqlite::{messages, outgoing},
        SqliteDatabase,
        StoreError,
        StoreTx,
    },
    db_types::{MessageId, OutgoingMessage, PeerId},
    order_messages::SignedOrderMessage,
    traits::{PeerTransport, TransportError},
};

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Envelope addressed to {0} reached the wrong node")]
    WrongRecipient(PeerId),
    #[error("The message was never sent or the messenger shut down before it was acknowledged")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct MessengerConfig {
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub batch_size: i64,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self { retry_base: Duration::from_secs(2), retry_cap: Duration::from_secs(600), batch_size: 50 }
    }
}

impl MessengerConfig {
    /// Delay before attempt number `attempt + 1`.
    pub fn backoff(&self, attempt: i64) -> Duration {
        let exp = attempt.clamp(0, 20) as u32;
        let base = self.retry_base.saturating_mul(2u32.saturating_pow(exp));
        let capped = base.min(self.retry_cap);
        let jitter_ms = (capped.as_millis() as u64 / 4).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms));
        (capped + jitter).min(self.retry_cap)
    }
}

/// Resolves when the recipient acknowledges the message. Dropping it does not cancel delivery.
pub struct AckToken {
    message_id: MessageId,
    rx: oneshot::Receiver<()>,
}

impl AckToken {
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }
}

impl Future for AckToken {
    type Output = Result<(), MessengerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.map_err(|_| MessengerError::Cancelled))
    }
}

/// The outcome of [`ReliableMessenger::receive`].
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A new order message to hand to the order processor.
    Deliver(SignedOrderMessage),
    /// Seen before. Acknowledge it again and drop it.
    Duplicate,
    /// An ACK for one of our outgoing envelopes.
    Acked(MessageId),
}

#[derive(Clone)]
pub struct ReliableMessenger {
    me: PeerId,
    db: SqliteDatabase,
    transport: Arc<dyn PeerTransport>,
    config: MessengerConfig,
    waiters: Arc<Mutex<HashMap<MessageId, oneshot::Sender<()>>>>,
    wake: Arc<Notify>,
}

impl ReliableMessenger {
    pub fn new(me: PeerId, db: SqliteDatabase, transport: Arc<dyn PeerTransport>, config: MessengerConfig) -> Self {
        Self {
            me,
            db,
            transport,
            config,
            waiters: Arc::new(Mutex::new(HashMap::new())),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.me
    }

    /// Queues `message` for `recipient` as part of `tx`. `message_seq` is the stored message's position among
    /// messages of its kind, which is what the ACK bit is tracked against.
    pub async fn send_reliably(
        &self,
        tx: &mut StoreTx,
        recipient: &PeerId,
        message: &SignedOrderMessage,
        message_seq: i64,
    ) -> Result<AckToken, MessengerError> {
        tx.ensure_writable()?;
        let sequence = outgoing::next_sequence(recipient, tx.conn()).await?;
        let envelope = PeerEnvelope::order(self.me.clone(), recipient.clone(), sequence, message.clone());
        let now = Utc::now();
        let row = OutgoingMessage {
            message_id: envelope.message_id.clone(),
            recipient: recipient.clone(),
            sequence,
            order_id: message.order_id.clone(),
            kind: message.kind(),
            message_seq,
            envelope: envelope.to_bytes()?,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
        };
        outgoing::insert_outgoing(&row, tx.conn()).await?;
        let (sender, rx) = oneshot::channel();
        let waiters = Arc::clone(&self.waiters);
        let wake = Arc::clone(&self.wake);
        let id = envelope.message_id.clone();
        tx.on_commit(move || {
            if let Ok(mut w) = waiters.lock() {
                w.insert(id, sender);
            }
            wake.notify_one();
        });
        Ok(AckToken { message_id: envelope.message_id, rx })
    }

    /// Classifies an inbound envelope. ACKs are applied here; order messages are only checked against the seen set,
    /// which [`ReliableMessenger::acknowledge`] updates once processing is done.
    pub async fn receive(&self, envelope: &PeerEnvelope) -> Result<Inbound, MessengerError> {
        if envelope.recipient != self.me {
            return Err(MessengerError::WrongRecipient(envelope.recipient.clone()));
        }
        match &envelope.payload {
            EnvelopePayload::Ack(acked) => {
                self.apply_ack(acked).await?;
                Ok(Inbound::Acked(acked.clone()))
            },
            EnvelopePayload::Order(message) => {
                let mut tx = self.db.begin_view().await?;
                let seen = outgoing::has_received(&envelope.message_id, tx.conn()).await?;
                tx.rollback().await?;
                if seen {
                    debug!("📨️ Dropping duplicate envelope {} from {}", envelope.message_id, envelope.sender.short());
                    Ok(Inbound::Duplicate)
                } else {
                    Ok(Inbound::Deliver(message.clone()))
                }
            },
        }
    }

    /// Records the envelope as seen and sends its ACK. The ACK itself is best effort: if it is lost, the sender
    /// retries and gets a fresh one.
    pub async fn acknowledge(&self, envelope: &PeerEnvelope) -> Result<(), MessengerError> {
        if envelope.is_ack() {
            return Ok(());
        }
        let mut tx = self.db.begin_update().await?;
        outgoing::record_received(&envelope.message_id, &envelope.sender, tx.conn()).await?;
        tx.commit().await?;
        let ack = PeerEnvelope::ack(self.me.clone(), envelope.sender.clone(), envelope.message_id.clone());
        if let Err(e) = self.transmit(&ack).await {
            debug!("📨️ ACK for {} could not be delivered yet. {e}", envelope.message_id);
        }
        Ok(())
    }

    async fn apply_ack(&self, acked: &MessageId) -> Result<(), MessengerError> {
        let mut tx = self.db.begin_update().await?;
        if let Some(row) = outgoing::delete_outgoing(acked, tx.conn()).await? {
            let pending =
                outgoing::count_pending_for_message(&row.order_id, row.kind, row.message_seq, tx.conn()).await?;
            if pending == 0 {
                messages::set_acked(&row.order_id, row.kind, row.message_seq, tx.conn()).await?;
            }
            let who = row.recipient.short();
            debug!("📨️ {} #{} for order {} acknowledged by {who}", row.kind, row.sequence, row.order_id);
        } else {
            trace!("📨️ ACK for unknown envelope {acked}");
        }
        tx.commit().await?;
        let waiter = self.waiters.lock().ok().and_then(|mut w| w.remove(acked));
        if let Some(waiter) = waiter {
            let _ = waiter.send(());
        }
        Ok(())
    }

    /// Drops the ACK waiters of tokens nobody holds any more. Their rows keep being retried.
    fn forget_dropped_waiters(&self) {
        if let Ok(mut waiters) = self.waiters.lock() {
            let before = waiters.len();
            waiters.retain(|_, sender| !sender.is_closed());
            let forgotten = before - waiters.len();
            if forgotten > 0 {
                trace!("📨️ Forgot {forgotten} ACK waiters with no listener");
            }
        }
    }

    /// Direct first, then every inbox the recipient advertises. Succeeds if any route took the envelope.
    async fn transmit(&self, envelope: &PeerEnvelope) -> Result<(), TransportError> {
        let direct = match self.transport.send_direct(envelope).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        let inboxes = self.transport.inboxes_for(&envelope.recipient).await?;
        let mut stored = false;
        for inbox in &inboxes {
            match self.transport.store_in_inbox(inbox, envelope).await {
                Ok(()) => stored = true,
                Err(e) => trace!("📨️ Inbox {} refused envelope {}. {e}", inbox.short(), envelope.message_id),
            }
        }
        if stored {
            Ok(())
        } else {
            Err(direct)
        }
    }

    /// Makes one pass over the due outgoing rows. Returns when the next row falls due, if any remain.
    pub async fn process_due(&self) -> Result<Option<DateTime<Utc>>, MessengerError> {
        self.forget_dropped_waiters();
        let mut tx = self.db.begin_view().await?;
        let due = outgoing::fetch_due(Utc::now(), self.config.batch_size, tx.conn()).await?;
        tx.rollback().await?;
        for row in due {
            let result = match PeerEnvelope::from_bytes(&row.envelope) {
                Ok(envelope) => self.transmit(&envelope).await,
                Err(e) => Err(e),
            };
            let error = match &result {
                Ok(()) => {
                    trace!("📨️ Sent {} #{} to {}", row.kind, row.sequence, row.recipient.short());
                    None
                },
                Err(e) => {
                    let attempt = row.attempts + 1;
                    debug!("📨️ Could not send {} to {} (attempt {attempt}). {e}", row.kind, row.recipient.short());
                    Some(e.to_string())
                },
            };
            let delay = self.config.backoff(row.attempts);
            let next = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
            let mut tx = self.db.begin_update().await?;
            outgoing::record_attempt(&row.message_id, next, error.as_deref(), tx.conn()).await?;
            tx.commit().await?;
        }
        let mut tx = self.db.begin_view().await?;
        let next = outgoing::next_due_at(tx.conn()).await?;
        tx.rollback().await?;
        Ok(next)
    }

    /// The retry worker. Committed rows survive cancellation and are picked up again by the next run.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("📨️ Messenger retry worker started for {}", self.me.short());
        loop {
            let wait = match self.process_due().await {
                Ok(Some(next)) => (next - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(self.config.retry_cap),
                Ok(None) => self.config.retry_cap,
                Err(e) => {
                    warn!("📨️ Messenger pass failed. {e}");
                    self.config.retry_base
                },
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {},
                _ = tokio::time::sleep(wait) => {},
            }
        }
        info!("📨️ Messenger retry worker stopped");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        db_types::PaymentMethod,
        test_utils::{
            fixtures::{order_open_fixture, Marketplace},
            prepare_env::test_db,
        },
    };

    #[tokio::test]
    async fn dropped_ack_tokens_are_forgotten() {
        let db = test_db().await;
        let market = Marketplace::new();
        let transport = Arc::new(InMemoryNetwork::new());
        let messenger =
            ReliableMessenger::new(market.buyer.peer_id().clone(), db.clone(), transport, MessengerConfig::default());
        let open = order_open_fixture(&market, PaymentMethod::Moderated, 1);
        let signed = SignedOrderMessage::open(&market.buyer, open).unwrap();

        let mut tx = db.begin_update().await.unwrap();
        let kept = messenger.send_reliably(&mut tx, market.vendor.peer_id(), &signed, 0).await.unwrap();
        let dropped = messenger.send_reliably(&mut tx, market.moderator.peer_id(), &signed, 0).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(messenger.waiters.lock().unwrap().len(), 2);

        drop(dropped);
        // Neither recipient is online, so both rows stay due for a retry
        let next = messenger.process_due().await.unwrap();
        assert!(next.is_some());
        let waiters = messenger.waiters.lock().unwrap();
        assert_eq!(waiters.len(), 1);
        assert!(waiters.contains_key(kept.message_id()));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = MessengerConfig {
            retry_base: Duration::from_millis(100),
            retry_cap: Duration::from_secs(5),
            batch_size: 10,
        };
        let first = config.backoff(0);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(126));
        let fourth = config.backoff(3);
        assert!(fourth >= Duration::from_millis(800));
        for attempt in [10, 50, i64::MAX] {
            assert_eq!(config.backoff(attempt), Duration::from_secs(5));
        }
    }
}
