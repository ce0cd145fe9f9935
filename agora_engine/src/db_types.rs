use std::{fmt::Display, str::FromStr};

use agora_common::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Type;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("Could not parse {kind}: {value}")]
pub struct ConversionError {
    kind: &'static str,
    value: String,
}

impl ConversionError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self { kind, value: value.to_string() }
    }
}

//--------------------------------------      OrderId       ---------------------------------------------------------
/// Hex-encoded hash of the serialized `ORDER_OPEN` payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Type, Serialize, Deserialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OrderId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

//--------------------------------------       PeerId       ---------------------------------------------------------
/// A node's network identity: the hex encoding of its Ristretto identity public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Type, Serialize, Deserialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(self.0.as_str())
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

//--------------------------------------     MessageId      ---------------------------------------------------------
/// Random identifier attached to every network envelope. Recipients drop ids they have already seen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

//--------------------------------------        Role        ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Buyer,
    Vendor,
    Moderator,
    Unknown,
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Buyer => write!(f, "Buyer"),
            Role::Vendor => write!(f, "Vendor"),
            Role::Moderator => write!(f, "Moderator"),
            Role::Unknown => write!(f, "Unknown"),
        }
    }
}

impl FromStr for Role {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Buyer" => Ok(Role::Buyer),
            "Vendor" => Ok(Role::Vendor),
            "Moderator" => Ok(Role::Moderator),
            "Unknown" => Ok(Role::Unknown),
            _ => Err(ConversionError::new("role", s)),
        }
    }
}

//--------------------------------------    MessageKind     ---------------------------------------------------------
/// The thirteen kinds of signed order message. Declaration order is the order in which parked messages are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    OrderOpen,
    OrderReject,
    OrderCancel,
    OrderConfirmation,
    RatingSignatures,
    OrderFulfillment,
    OrderComplete,
    DisputeOpen,
    DisputeUpdate,
    DisputeClose,
    Refund,
    PaymentSent,
    PaymentFinalized,
}

impl MessageKind {
    pub const ALL: [MessageKind; 13] = [
        MessageKind::OrderOpen,
        MessageKind::OrderReject,
        MessageKind::OrderCancel,
        MessageKind::OrderConfirmation,
        MessageKind::RatingSignatures,
        MessageKind::OrderFulfillment,
        MessageKind::OrderComplete,
        MessageKind::DisputeOpen,
        MessageKind::DisputeUpdate,
        MessageKind::DisputeClose,
        MessageKind::Refund,
        MessageKind::PaymentSent,
        MessageKind::PaymentFinalized,
    ];

    /// Kinds that may legitimately appear more than once on an order.
    pub fn allows_multiple(&self) -> bool {
        matches!(self, MessageKind::PaymentSent | MessageKind::Refund | MessageKind::OrderFulfillment)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::OrderOpen => "ORDER_OPEN",
            MessageKind::OrderReject => "ORDER_REJECT",
            MessageKind::OrderCancel => "ORDER_CANCEL",
            MessageKind::OrderConfirmation => "ORDER_CONFIRMATION",
            MessageKind::RatingSignatures => "RATING_SIGNATURES",
            MessageKind::OrderFulfillment => "ORDER_FULFILLMENT",
            MessageKind::OrderComplete => "ORDER_COMPLETE",
            MessageKind::DisputeOpen => "DISPUTE_OPEN",
            MessageKind::DisputeUpdate => "DISPUTE_UPDATE",
            MessageKind::DisputeClose => "DISPUTE_CLOSE",
            MessageKind::Refund => "REFUND",
            MessageKind::PaymentSent => "PAYMENT_SENT",
            MessageKind::PaymentFinalized => "PAYMENT_FINALIZED",
        }
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| ConversionError::new("message kind", s))
    }
}

//--------------------------------------   PaymentMethod    ---------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    /// Buyer pays into a 1-of-1 script on the vendor's order key.
    Direct,
    /// 1-of-2 multisig between buyer and vendor.
    Cancelable,
    /// 2-of-3 multisig between buyer, vendor and moderator.
    Moderated,
}

impl PaymentMethod {
    pub fn uses_escrow(&self) -> bool {
        !matches!(self, PaymentMethod::Direct)
    }
}

impl Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentMethod::Direct => write!(f, "DIRECT"),
            PaymentMethod::Cancelable => write!(f, "CANCELABLE"),
            PaymentMethod::Moderated => write!(f, "MODERATED"),
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DIRECT" => Ok(PaymentMethod::Direct),
            "CANCELABLE" => Ok(PaymentMethod::Cancelable),
            "MODERATED" => Ok(PaymentMethod::Moderated),
            _ => Err(ConversionError::new("payment method", s)),
        }
    }
}

//--------------------------------------     OrderState     ---------------------------------------------------------
/// Summary of where an order sits in its lifecycle. Derived from the stored messages; never an input to a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderState {
    AwaitingPayment,
    /// Funded, but the vendor has not confirmed yet.
    Funded,
    AwaitingFulfillment,
    PartiallyFulfilled,
    Fulfilled,
    Completed,
    Cancelled,
    Declined,
    Refunded,
    Disputed,
    /// The moderator has ruled but the payout has not been seen yet.
    Decided,
    Resolved,
    PaymentFinalized,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Completed | OrderState::Cancelled | OrderState::Declined | OrderState::Resolved)
    }
}

impl Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderState::AwaitingPayment => "AwaitingPayment",
            OrderState::Funded => "Funded",
            OrderState::AwaitingFulfillment => "AwaitingFulfillment",
            OrderState::PartiallyFulfilled => "PartiallyFulfilled",
            OrderState::Fulfilled => "Fulfilled",
            OrderState::Completed => "Completed",
            OrderState::Cancelled => "Cancelled",
            OrderState::Declined => "Declined",
            OrderState::Refunded => "Refunded",
            OrderState::Disputed => "Disputed",
            OrderState::Decided => "Decided",
            OrderState::Resolved => "Resolved",
            OrderState::PaymentFinalized => "PaymentFinalized",
        };
        f.write_str(s)
    }
}

impl FromStr for OrderState {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AwaitingPayment" => Ok(OrderState::AwaitingPayment),
            "Funded" => Ok(OrderState::Funded),
            "AwaitingFulfillment" => Ok(OrderState::AwaitingFulfillment),
            "PartiallyFulfilled" => Ok(OrderState::PartiallyFulfilled),
            "Fulfilled" => Ok(OrderState::Fulfilled),
            "Completed" => Ok(OrderState::Completed),
            "Cancelled" => Ok(OrderState::Cancelled),
            "Declined" => Ok(OrderState::Declined),
            "Refunded" => Ok(OrderState::Refunded),
            "Disputed" => Ok(OrderState::Disputed),
            "Decided" => Ok(OrderState::Decided),
            "Resolved" => Ok(OrderState::Resolved),
            "PaymentFinalized" => Ok(OrderState::PaymentFinalized),
            _ => Err(ConversionError::new("order state", s)),
        }
    }
}

//--------------------------------------  Wallet transactions  -------------------------------------------------------
/// One side of a transaction as reported by a wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendInfo {
    /// `txid:index` of the output created (for `to`) or consumed (for `from`).
    pub outpoint_id: String,
    pub address: String,
    pub amount: Amount,
    pub is_relevant: bool,
    pub is_watched: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: String,
    pub from: Vec<SpendInfo>,
    pub to: Vec<SpendInfo>,
    /// Zero while unconfirmed.
    pub height: u64,
}

impl WalletTransaction {
    pub fn touches(&self, address: &str) -> bool {
        self.from.iter().chain(self.to.iter()).any(|s| s.address == address)
    }

    pub fn received_by(&self, address: &str) -> Amount {
        self.to.iter().filter(|s| s.address == address).map(|s| &s.amount).sum()
    }

    pub fn spent_from(&self, address: &str) -> Amount {
        self.from.iter().filter(|s| s.address == address).map(|s| &s.amount).sum()
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut result = self.from.iter().chain(self.to.iter()).map(|s| s.address.clone()).collect::<Vec<_>>();
        result.sort();
        result.dedup();
        result
    }
}

//--------------------------------------   Order aggregate   ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub kind: MessageKind,
    /// Position among messages of the same kind. Always zero for single-occurrence kinds.
    pub seq: i64,
    pub blob: Vec<u8>,
    pub acked: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTransaction {
    pub txid: String,
    pub height: u64,
    pub transaction: WalletTransaction,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub order_id: OrderId,
    pub role: Role,
    pub state: OrderState,
    pub payment_method: PaymentMethod,
    pub payment_coin: String,
    pub payment_address: String,
    pub payment_amount: Amount,
    pub funded: bool,
    pub funding_notified: bool,
    pub messages: Vec<StoredMessage>,
    pub transactions: Vec<OrderTransaction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRecord {
    pub fn has(&self, kind: MessageKind) -> bool {
        self.messages.iter().any(|m| m.kind == kind)
    }

    pub fn has_any(&self, kinds: &[MessageKind]) -> Option<MessageKind> {
        kinds.iter().find(|k| self.has(**k)).copied()
    }

    pub fn messages_of(&self, kind: MessageKind) -> impl Iterator<Item = &StoredMessage> {
        self.messages.iter().filter(move |m| m.kind == kind)
    }

    pub fn next_seq(&self, kind: MessageKind) -> i64 {
        self.messages_of(kind).map(|m| m.seq + 1).max().unwrap_or(0)
    }

    pub fn has_transaction(&self, txid: &str) -> bool {
        self.transactions.iter().any(|t| t.txid == txid)
    }

    /// Everything ever paid into the payment address.
    pub fn funding_total(&self) -> Amount {
        self.transactions.iter().map(|t| t.transaction.received_by(&self.payment_address)).sum()
    }

    /// Everything ever spent out of the payment address.
    pub fn outgoing_total(&self) -> Amount {
        self.transactions.iter().map(|t| t.transaction.spent_from(&self.payment_address)).sum()
    }

    /// Outputs paid to the payment address that no recorded transaction has spent.
    pub fn unspent_outputs(&self) -> Vec<SpendInfo> {
        let spent = self
            .transactions
            .iter()
            .flat_map(|t| t.transaction.from.iter())
            .map(|s| s.outpoint_id.as_str())
            .collect::<Vec<_>>();
        let mut outputs = self
            .transactions
            .iter()
            .flat_map(|t| t.transaction.to.iter())
            .filter(|s| s.address == self.payment_address && !spent.contains(&s.outpoint_id.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        outputs.sort_by(|a, b| a.outpoint_id.cmp(&b.outpoint_id));
        outputs.dedup_by(|a, b| a.outpoint_id == b.outpoint_id);
        outputs
    }

    pub fn escrow_balance(&self) -> Amount {
        self.unspent_outputs().iter().map(|s| &s.amount).sum()
    }
}

//--------------------------------------  Parked / errored  ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkedMessage {
    pub order_id: OrderId,
    pub kind: MessageKind,
    pub blob: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErroredMessage {
    pub id: i64,
    pub order_id: OrderId,
    pub kind: MessageKind,
    pub blob: Vec<u8>,
    pub error: String,
    pub created_at: DateTime<Utc>,
}

//--------------------------------------  Outgoing messages  --------------------------------------------------------
/// A message the messenger keeps retrying until the recipient acknowledges its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub message_id: MessageId,
    pub recipient: PeerId,
    pub sequence: i64,
    pub order_id: OrderId,
    pub kind: MessageKind,
    pub message_seq: i64,
    pub envelope: Vec<u8>,
    pub attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}
