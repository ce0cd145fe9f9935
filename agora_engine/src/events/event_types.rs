use agora_common::Amount;
use serde::{Deserialize, Serialize};

use crate::db_types::{MessageKind, OrderId, PeerId, Role, WalletTransaction};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceived {
    pub coin: String,
    pub transaction: WalletTransaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReceived {
    pub coin: String,
    pub height: u64,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    pub order_id: OrderId,
    pub role: Role,
    pub buyer: PeerId,
    pub vendor: PeerId,
    pub coin: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFunded {
    pub order_id: OrderId,
    pub role: Role,
    pub funding_total: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSent {
    pub order_id: OrderId,
    pub txid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceived {
    pub order_id: OrderId,
    pub txid: String,
    pub amount: Amount,
    pub funding_total: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancel {
    pub order_id: OrderId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmation {
    pub order_id: OrderId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFulfillment {
    pub order_id: OrderId,
    pub items: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCompletion {
    pub order_id: OrderId,
    pub ratings: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDeclined {
    pub order_id: OrderId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeOpen {
    pub order_id: OrderId,
    pub opened_by: Role,
    pub claim: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeUpdate {
    pub order_id: OrderId,
    pub submitted_by: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeClose {
    pub order_id: OrderId,
    pub resolution: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingSignaturesReceived {
    pub order_id: OrderId,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub order_id: OrderId,
    pub txid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFinalized {
    pub order_id: OrderId,
    pub txid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageErrored {
    pub order_id: OrderId,
    pub kind: MessageKind,
    pub error: String,
}

/// Declares the event enum, the per-type channels of [`crate::events::EventBus`] and the glue between them.
macro_rules! domain_events {
    ($($variant:ident => $field:ident),+ $(,)?) => {
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub enum DomainEvent {
            $($variant($variant)),+
        }

        impl DomainEvent {
            pub fn name(&self) -> &'static str {
                match self {
                    $(DomainEvent::$variant(_) => stringify!($variant)),+
                }
            }

            /// The order this event concerns, if any.
            pub fn order_id(&self) -> Option<&OrderId> {
                match self {
                    $(DomainEvent::$variant(e) => domain_events!(@order_id $variant e)),+
                }
            }
        }

        $(
            impl From<$variant> for DomainEvent {
                fn from(e: $variant) -> Self {
                    DomainEvent::$variant(e)
                }
            }
        )+

        #[doc(hidden)]
        pub struct TypedChannels {
            $(pub(crate) $field: tokio::sync::broadcast::Sender<$variant>),+
        }

        impl TypedChannels {
            pub(crate) fn new(capacity: usize) -> Self {
                Self { $($field: tokio::sync::broadcast::channel(capacity).0),+ }
            }

            pub(crate) fn route(&self, event: &DomainEvent) {
                // A send only fails when nobody is listening
                match event {
                    $(DomainEvent::$variant(e) => { let _ = self.$field.send(e.clone()); }),+
                }
            }
        }

        $(
            impl crate::events::BusEvent for $variant {
                fn channel(channels: &TypedChannels) -> &tokio::sync::broadcast::Sender<Self> {
                    &channels.$field
                }
            }
        )+
    };
    (@order_id TransactionReceived $e:ident) => { { let _ = $e; None } };
    (@order_id BlockReceived $e:ident) => { { let _ = $e; None } };
    (@order_id $variant:ident $e:ident) => { Some(&$e.order_id) };
}

domain_events! {
    TransactionReceived => transaction_received,
    BlockReceived => block_received,
    NewOrder => new_order,
    OrderFunded => order_funded,
    PaymentSent => payment_sent,
    PaymentReceived => payment_received,
    OrderCancel => order_cancel,
    OrderConfirmation => order_confirmation,
    OrderFulfillment => order_fulfillment,
    OrderCompletion => order_completion,
    OrderDeclined => order_declined,
    DisputeOpen => dispute_open,
    DisputeUpdate => dispute_update,
    DisputeClose => dispute_close,
    RatingSignaturesReceived => rating_signatures_received,
    Refund => refund,
    PaymentFinalized => payment_finalized,
    MessageErrored => message_errored,
}
