//! Which message may follow which.
//!
//! A message is checked against three things: who wrote it, the order's payment method, and the messages the order
//! already holds. Failing the first two, or finding a message that rules this one out, is an
//! [`OrderFlowError::UnexpectedMessage`]. A missing prerequisite is an [`OrderFlowError::MessageDoesNotExist`]: the
//! message may simply have arrived early, so the processor parks it instead of rejecting it.
use std::collections::BTreeSet;

use crate::{
    db_types::{MessageKind, OrderRecord, OrderState, PaymentMethod, Role},
    order_flow::OrderFlowError,
    order_messages::{OrderFulfillment, OrderMessage, OrderOpen, SignedOrderMessage},
};

struct Rule {
    authors: &'static [Role],
    methods: &'static [PaymentMethod],
    required: &'static [MessageKind],
    disallowed: &'static [MessageKind],
    needs_funding: bool,
    needs_all_fulfilled: bool,
}

const ANY_METHOD: &[PaymentMethod] = &[PaymentMethod::Direct, PaymentMethod::Cancelable, PaymentMethod::Moderated];
const BUYER: &[Role] = &[Role::Buyer];
const VENDOR: &[Role] = &[Role::Vendor];
const PARTIES: &[Role] = &[Role::Buyer, Role::Vendor];

// Rejection, cancellation and confirmation are mutually exclusive, and all three must come before the order moves on.
const CLOSED_BY_REJECT: &[MessageKind] = &[
    MessageKind::OrderConfirmation,
    MessageKind::OrderCancel,
    MessageKind::OrderReject,
    MessageKind::OrderFulfillment,
    MessageKind::OrderComplete,
    MessageKind::DisputeOpen,
    MessageKind::DisputeUpdate,
    MessageKind::DisputeClose,
    MessageKind::Refund,
    MessageKind::PaymentFinalized,
];
const CLOSED_BY_CANCEL: &[MessageKind] = &[
    MessageKind::OrderReject,
    MessageKind::OrderConfirmation,
    MessageKind::OrderCancel,
    MessageKind::OrderFulfillment,
    MessageKind::OrderComplete,
    MessageKind::DisputeOpen,
    MessageKind::DisputeUpdate,
    MessageKind::DisputeClose,
    MessageKind::Refund,
    MessageKind::PaymentFinalized,
];
const CLOSED_BY_CONFIRMATION: &[MessageKind] = &[
    MessageKind::OrderReject,
    MessageKind::OrderCancel,
    MessageKind::OrderConfirmation,
    MessageKind::OrderFulfillment,
    MessageKind::OrderComplete,
    MessageKind::DisputeOpen,
    MessageKind::DisputeUpdate,
    MessageKind::DisputeClose,
    MessageKind::Refund,
    MessageKind::PaymentFinalized,
];

fn rule(kind: MessageKind) -> Rule {
    let base = Rule {
        authors: PARTIES,
        methods: ANY_METHOD,
        required: &[MessageKind::OrderOpen],
        disallowed: &[],
        needs_funding: false,
        needs_all_fulfilled: false,
    };
    match kind {
        MessageKind::OrderOpen => Rule { authors: BUYER, required: &[], ..base },
        MessageKind::OrderReject => Rule { authors: VENDOR, disallowed: CLOSED_BY_REJECT, ..base },
        MessageKind::OrderCancel => Rule {
            authors: BUYER,
            methods: &[PaymentMethod::Cancelable],
            disallowed: CLOSED_BY_CANCEL,
            ..base
        },
        MessageKind::OrderConfirmation => Rule { authors: VENDOR, disallowed: CLOSED_BY_CONFIRMATION, ..base },
        MessageKind::RatingSignatures => Rule {
            authors: VENDOR,
            disallowed: &[MessageKind::OrderReject, MessageKind::OrderCancel],
            needs_funding: true,
            ..base
        },
        MessageKind::OrderFulfillment => Rule {
            authors: VENDOR,
            required: &[MessageKind::OrderOpen, MessageKind::OrderConfirmation],
            disallowed: &[MessageKind::OrderReject, MessageKind::OrderComplete, MessageKind::PaymentFinalized],
            needs_funding: true,
            ..base
        },
        MessageKind::OrderComplete => Rule {
            authors: BUYER,
            required: &[MessageKind::OrderOpen, MessageKind::OrderFulfillment],
            disallowed: &[MessageKind::OrderCancel, MessageKind::DisputeOpen, MessageKind::PaymentFinalized],
            needs_all_fulfilled: true,
            ..base
        },
        MessageKind::DisputeOpen => Rule {
            methods: &[PaymentMethod::Moderated],
            disallowed: &[
                MessageKind::OrderComplete,
                MessageKind::PaymentFinalized,
                MessageKind::OrderReject,
                MessageKind::OrderCancel,
                MessageKind::DisputeOpen,
            ],
            ..base
        },
        MessageKind::DisputeUpdate => Rule {
            methods: &[PaymentMethod::Moderated],
            required: &[MessageKind::OrderOpen, MessageKind::DisputeOpen],
            disallowed: &[MessageKind::DisputeClose],
            ..base
        },
        MessageKind::DisputeClose => Rule {
            authors: &[Role::Moderator],
            methods: &[PaymentMethod::Moderated],
            required: &[MessageKind::OrderOpen, MessageKind::DisputeOpen],
            disallowed: &[MessageKind::DisputeClose],
            ..base
        },
        MessageKind::Refund => Rule {
            authors: VENDOR,
            methods: &[PaymentMethod::Direct, PaymentMethod::Moderated],
            disallowed: &[MessageKind::OrderCancel, MessageKind::OrderComplete, MessageKind::PaymentFinalized],
            ..base
        },
        MessageKind::PaymentSent => Rule { authors: BUYER, ..base },
        MessageKind::PaymentFinalized => Rule {
            authors: &[Role::Buyer, Role::Vendor, Role::Moderator],
            disallowed: &[MessageKind::PaymentFinalized],
            ..base
        },
    }
}

/// Whether the order's funding has reached the payment amount, now or at some earlier point.
pub(crate) fn is_funded(order: &OrderRecord) -> bool {
    order.funded || order.funding_total() >= order.payment_amount
}

/// Checks that `author` may add a `kind` message to `order`.
pub fn check(kind: MessageKind, author: Role, order: &OrderRecord, open: &OrderOpen) -> Result<(), OrderFlowError> {
    let rule = rule(kind);
    if !rule.authors.contains(&author) {
        return Err(OrderFlowError::unexpected(kind, format!("cannot be sent by the {author}")));
    }
    if !rule.methods.contains(&order.payment_method) {
        return Err(OrderFlowError::unexpected(kind, format!("not used by {} orders", order.payment_method)));
    }
    if let Some(prior) = order.has_any(rule.disallowed) {
        return Err(OrderFlowError::unexpected(kind, format!("the order already holds {prior}")));
    }
    if let Some(missing) = rule.required.iter().find(|k| !order.has(**k)) {
        return Err(OrderFlowError::missing(kind, missing.to_string()));
    }
    if rule.needs_funding && !is_funded(order) {
        return Err(OrderFlowError::missing(kind, "funding"));
    }
    if rule.needs_all_fulfilled && !all_items_fulfilled(order, open)? {
        return Err(OrderFlowError::missing(kind, "fulfillment of every item"));
    }
    Ok(())
}

/// Decodes every stored message of `kind`, oldest first.
pub(crate) fn stored_messages(
    order: &OrderRecord,
    kind: MessageKind,
) -> Result<Vec<SignedOrderMessage>, OrderFlowError> {
    order.messages_of(kind).map(|m| SignedOrderMessage::from_blob(&m.blob).map_err(OrderFlowError::from)).collect()
}

/// The order's `ORDER_OPEN` payload.
pub(crate) fn stored_open(order: &OrderRecord) -> Result<OrderOpen, OrderFlowError> {
    let open = stored_messages(order, MessageKind::OrderOpen)?.into_iter().next().map(|m| m.message);
    match open {
        Some(OrderMessage::OrderOpen(open)) => Ok(open),
        _ => Err(OrderFlowError::missing(MessageKind::OrderOpen, "ORDER_OPEN")),
    }
}

pub(crate) fn fulfillments(order: &OrderRecord) -> Result<Vec<OrderFulfillment>, OrderFlowError> {
    Ok(stored_messages(order, MessageKind::OrderFulfillment)?
        .into_iter()
        .filter_map(|m| match m.message {
            OrderMessage::OrderFulfillment(f) => Some(f),
            _ => None,
        })
        .collect())
}

pub(crate) fn fulfilled_items(order: &OrderRecord) -> Result<BTreeSet<u32>, OrderFlowError> {
    Ok(fulfillments(order)?.into_iter().flat_map(|f| f.items.into_iter().map(|i| i.item_index)).collect())
}

pub(crate) fn all_items_fulfilled(order: &OrderRecord, open: &OrderOpen) -> Result<bool, OrderFlowError> {
    let fulfilled = fulfilled_items(order)?;
    Ok((0..open.items.len() as u32).all(|i| fulfilled.contains(&i)))
}

/// The summary state implied by the messages an order holds.
pub fn derive_state(order: &OrderRecord, open: &OrderOpen, funded: bool) -> Result<OrderState, OrderFlowError> {
    let state = if order.has(MessageKind::DisputeClose) && order.has(MessageKind::PaymentFinalized) {
        OrderState::Resolved
    } else if order.has(MessageKind::DisputeClose) {
        OrderState::Decided
    } else if order.has(MessageKind::DisputeOpen) {
        OrderState::Disputed
    } else if order.has(MessageKind::OrderComplete) {
        OrderState::Completed
    } else if order.has(MessageKind::OrderCancel) {
        OrderState::Cancelled
    } else if order.has(MessageKind::OrderReject) {
        OrderState::Declined
    } else if order.has(MessageKind::Refund) {
        OrderState::Refunded
    } else if order.has(MessageKind::PaymentFinalized) {
        OrderState::PaymentFinalized
    } else if order.has(MessageKind::OrderFulfillment) {
        if all_items_fulfilled(order, open)? {
            OrderState::Fulfilled
        } else {
            OrderState::PartiallyFulfilled
        }
    } else if order.has(MessageKind::OrderConfirmation) {
        OrderState::AwaitingFulfillment
    } else if funded {
        OrderState::Funded
    } else {
        OrderState::AwaitingPayment
    };
    Ok(state)
}

#[cfg(test)]
mod test {
    use agora_common::Amount;
    use chrono::Utc;

    use super::*;
    use crate::{
        db_types::{MessageKind as K, OrderId, StoredMessage},
        helpers::NodeIdentity,
        order_messages::{FulfilledItem, OrderReject},
        test_utils::fixtures::{order_open_fixture, Marketplace},
    };

    fn order_with(method: PaymentMethod, kinds: &[K]) -> (OrderRecord, OrderOpen) {
        let market = Marketplace::new();
        let open = order_open_fixture(&market, method, 2);
        let now = Utc::now();
        let messages = kinds
            .iter()
            .map(|k| StoredMessage { kind: *k, seq: 0, blob: vec![], acked: false, created_at: now })
            .collect();
        let order = OrderRecord {
            order_id: OrderId::new("o1"),
            role: Role::Vendor,
            state: OrderState::AwaitingPayment,
            payment_method: method,
            payment_coin: "TBTC".into(),
            payment_address: open.payment.address.clone(),
            payment_amount: Amount::from(1000u64),
            funded: false,
            funding_notified: false,
            messages,
            transactions: vec![],
            created_at: now,
            updated_at: now,
        };
        (order, open)
    }

    fn fulfillment_blob(identity: &NodeIdentity, items: &[u32]) -> Vec<u8> {
        let message = OrderMessage::OrderFulfillment(OrderFulfillment {
            timestamp: Utc::now(),
            items: items
                .iter()
                .map(|i| FulfilledItem { item_index: *i, tracking: None, digital: None, note: String::new() })
                .collect(),
            note: String::new(),
            payout_address: None,
        });
        SignedOrderMessage::sign(identity, OrderId::new("o1"), message).unwrap().to_blob().unwrap()
    }

    #[test]
    fn authors_and_methods_are_static() {
        let (order, open) = order_with(PaymentMethod::Direct, &[K::OrderOpen]);
        let err = check(K::OrderCancel, Role::Buyer, &order, &open).unwrap_err();
        assert!(matches!(err, OrderFlowError::UnexpectedMessage { kind: K::OrderCancel, .. }));
        let err = check(K::OrderConfirmation, Role::Buyer, &order, &open).unwrap_err();
        assert!(matches!(err, OrderFlowError::UnexpectedMessage { .. }));
        let err = check(K::DisputeOpen, Role::Buyer, &order, &open).unwrap_err();
        assert!(matches!(err, OrderFlowError::UnexpectedMessage { .. }));
        assert!(check(K::OrderConfirmation, Role::Vendor, &order, &open).is_ok());
        assert!(check(K::PaymentSent, Role::Buyer, &order, &open).is_ok());
    }

    #[test]
    fn missing_prerequisites_park() {
        let (order, open) = order_with(PaymentMethod::Direct, &[]);
        let err = check(K::PaymentSent, Role::Buyer, &order, &open).unwrap_err();
        assert!(err.is_parkable());

        let (order, open) = order_with(PaymentMethod::Direct, &[K::OrderOpen]);
        let err = check(K::OrderFulfillment, Role::Vendor, &order, &open).unwrap_err();
        assert!(matches!(err, OrderFlowError::MessageDoesNotExist { kind: K::OrderFulfillment, .. }));

        let (order, open) = order_with(PaymentMethod::Direct, &[K::OrderOpen, K::OrderConfirmation]);
        let err = check(K::OrderFulfillment, Role::Vendor, &order, &open).unwrap_err();
        assert!(matches!(err, OrderFlowError::MessageDoesNotExist { ref missing, .. } if missing == "funding"));

        let (mut order, open) = order_with(PaymentMethod::Direct, &[K::OrderOpen, K::OrderConfirmation]);
        order.funded = true;
        assert!(check(K::OrderFulfillment, Role::Vendor, &order, &open).is_ok());
    }

    #[test]
    fn terminal_messages_rule_out_later_ones() {
        let (order, open) = order_with(PaymentMethod::Cancelable, &[K::OrderOpen, K::OrderCancel]);
        let err = check(K::OrderConfirmation, Role::Vendor, &order, &open).unwrap_err();
        assert!(matches!(err, OrderFlowError::UnexpectedMessage { .. }));
        let err = check(K::OrderReject, Role::Vendor, &order, &open).unwrap_err();
        assert!(matches!(err, OrderFlowError::UnexpectedMessage { .. }));

        let (mut order, open) = order_with(PaymentMethod::Moderated, &[K::OrderOpen, K::OrderComplete]);
        order.funded = true;
        let err = check(K::DisputeOpen, Role::Buyer, &order, &open).unwrap_err();
        assert!(matches!(err, OrderFlowError::UnexpectedMessage { kind: K::DisputeOpen, .. }));
    }

    #[test]
    fn completion_needs_every_item_fulfilled() {
        let vendor = NodeIdentity::random();
        let (mut order, open) = order_with(PaymentMethod::Direct, &[K::OrderOpen, K::OrderConfirmation]);
        order.funded = true;
        order.messages.push(StoredMessage {
            kind: K::OrderFulfillment,
            seq: 0,
            blob: fulfillment_blob(&vendor, &[0]),
            acked: true,
            created_at: Utc::now(),
        });
        let err = check(K::OrderComplete, Role::Buyer, &order, &open).unwrap_err();
        assert!(err.is_parkable());
        assert_eq!(derive_state(&order, &open, true).unwrap(), OrderState::PartiallyFulfilled);

        order.messages.push(StoredMessage {
            kind: K::OrderFulfillment,
            seq: 1,
            blob: fulfillment_blob(&vendor, &[1]),
            acked: true,
            created_at: Utc::now(),
        });
        assert!(check(K::OrderComplete, Role::Buyer, &order, &open).is_ok());
        assert_eq!(derive_state(&order, &open, true).unwrap(), OrderState::Fulfilled);
    }

    #[test]
    fn derived_states() {
        let (order, open) = order_with(PaymentMethod::Moderated, &[K::OrderOpen]);
        assert_eq!(derive_state(&order, &open, false).unwrap(), OrderState::AwaitingPayment);
        assert_eq!(derive_state(&order, &open, true).unwrap(), OrderState::Funded);
        let (order, open) = order_with(PaymentMethod::Moderated, &[K::OrderOpen, K::OrderConfirmation]);
        assert_eq!(derive_state(&order, &open, true).unwrap(), OrderState::AwaitingFulfillment);
        let (order, open) = order_with(PaymentMethod::Moderated, &[K::OrderOpen, K::OrderReject]);
        assert_eq!(derive_state(&order, &open, true).unwrap(), OrderState::Declined);
        let (order, open) = order_with(PaymentMethod::Moderated, &[K::OrderOpen, K::DisputeOpen]);
        assert_eq!(derive_state(&order, &open, true).unwrap(), OrderState::Disputed);
        let (order, open) = order_with(PaymentMethod::Moderated, &[K::OrderOpen, K::DisputeOpen, K::DisputeClose]);
        assert_eq!(derive_state(&order, &open, true).unwrap(), OrderState::Decided);
        let all = [K::OrderOpen, K::DisputeOpen, K::DisputeClose, K::PaymentFinalized];
        let (order, open) = order_with(PaymentMethod::Moderated, &all);
        assert_eq!(derive_state(&order, &open, true).unwrap(), OrderState::Resolved);
        let (order, open) = order_with(PaymentMethod::Direct, &[K::OrderOpen, K::OrderConfirmation, K::Refund]);
        assert_eq!(derive_state(&order, &open, true).unwrap(), OrderState::Refunded);
    }

    #[test]
    fn stored_open_decodes_the_blob() {
        let (mut order, open) = order_with(PaymentMethod::Direct, &[]);
        assert!(stored_open(&order).unwrap_err().is_parkable());
        let buyer = NodeIdentity::random();
        let signed = SignedOrderMessage::open(&buyer, open.clone()).unwrap();
        order.messages.push(StoredMessage {
            kind: K::OrderOpen,
            seq: 0,
            blob: signed.to_blob().unwrap(),
            acked: false,
            created_at: Utc::now(),
        });
        assert_eq!(stored_open(&order).unwrap(), open);
        let reject = OrderMessage::OrderReject(OrderReject { timestamp: Utc::now(), reason: "no".into() });
        assert_eq!(reject.kind(), K::OrderReject);
    }
}
