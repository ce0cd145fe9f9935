//! # Signed order messages
//!
//! Everything two nodes say to each other about an order is one of thirteen message kinds, wrapped in a
//! [`SignedOrderMessage`] envelope:
//!
//! ```json
//! { "orderId": "...", "sender": "...", "message": { "messageType": "ORDER_OPEN", "payload": {} }, "signature": "" }
//! ```
//!
//! The signature is the sender's identity signature over `orderId || messageType || payload`, where `payload` is the
//! canonical JSON encoding of the payload (object keys sorted). The envelope's own JSON encoding is the blob the order
//! store keeps, and byte equality of blobs is how duplicates are told apart from changed messages.
//!
//! The order id is the hex blake2b-256 hash of the serialized `ORDER_OPEN` payload.
mod listing;
mod payloads;

pub use listing::{
    ContractType,
    Coupon,
    CouponDiscount,
    Listing,
    ListingItem,
    ListingMetadata,
    ListingOption,
    OptionVariant,
    ShippingOption,
    ShippingService,
    SignedListing,
    VendorId,
};
pub use payloads::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    db_types::{MessageKind, OrderId, PeerId},
    helpers::{hashing::blake2b_hex, IdentityError, IdentitySignature, NodeIdentity},
};

#[derive(Debug, Clone, Error)]
pub enum OrderMessageError {
    #[error("Could not (de)serialize order message: {0}")]
    Serialization(String),
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("Order id {given} does not match the ORDER_OPEN payload ({expected})")]
    OrderIdMismatch { given: OrderId, expected: OrderId },
}

impl From<serde_json::Error> for OrderMessageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "messageType", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderMessage {
    OrderOpen(OrderOpen),
    OrderReject(OrderReject),
    OrderCancel(OrderCancel),
    OrderConfirmation(OrderConfirmation),
    RatingSignatures(RatingSignatures),
    OrderFulfillment(OrderFulfillment),
    OrderComplete(OrderComplete),
    DisputeOpen(DisputeOpen),
    DisputeUpdate(DisputeUpdate),
    DisputeClose(DisputeClose),
    Refund(Refund),
    PaymentSent(PaymentSent),
    PaymentFinalized(PaymentFinalized),
}

impl OrderMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            OrderMessage::OrderOpen(_) => MessageKind::OrderOpen,
            OrderMessage::OrderReject(_) => MessageKind::OrderReject,
            OrderMessage::OrderCancel(_) => MessageKind::OrderCancel,
            OrderMessage::OrderConfirmation(_) => MessageKind::OrderConfirmation,
            OrderMessage::RatingSignatures(_) => MessageKind::RatingSignatures,
            OrderMessage::OrderFulfillment(_) => MessageKind::OrderFulfillment,
            OrderMessage::OrderComplete(_) => MessageKind::OrderComplete,
            OrderMessage::DisputeOpen(_) => MessageKind::DisputeOpen,
            OrderMessage::DisputeUpdate(_) => MessageKind::DisputeUpdate,
            OrderMessage::DisputeClose(_) => MessageKind::DisputeClose,
            OrderMessage::Refund(_) => MessageKind::Refund,
            OrderMessage::PaymentSent(_) => MessageKind::PaymentSent,
            OrderMessage::PaymentFinalized(_) => MessageKind::PaymentFinalized,
        }
    }

    /// Canonical payload bytes, as covered by the envelope signature.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, OrderMessageError> {
        let value = serde_json::to_value(self)?;
        let payload = value.get("payload").cloned().unwrap_or(serde_json::Value::Null);
        Ok(serde_json::to_vec(&payload)?)
    }
}

pub fn order_id_for(open: &OrderOpen) -> Result<OrderId, OrderMessageError> {
    let bytes = serde_json::to_vec(open)?;
    Ok(OrderId::new(blake2b_hex(&bytes)))
}

fn signing_message(order_id: &OrderId, message: &OrderMessage) -> Result<Vec<u8>, OrderMessageError> {
    let mut result = order_id.as_str().as_bytes().to_vec();
    result.extend_from_slice(message.kind().as_str().as_bytes());
    result.extend(message.payload_bytes()?);
    Ok(result)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedOrderMessage {
    pub order_id: OrderId,
    pub sender: PeerId,
    pub message: OrderMessage,
    pub signature: IdentitySignature,
}

impl SignedOrderMessage {
    pub fn sign(identity: &NodeIdentity, order_id: OrderId, message: OrderMessage) -> Result<Self, OrderMessageError> {
        let signature = identity.sign(&signing_message(&order_id, &message)?)?;
        Ok(Self { order_id, sender: identity.peer_id().clone(), message, signature })
    }

    /// Signs a new `ORDER_OPEN`, deriving its order id from the payload.
    pub fn open(identity: &NodeIdentity, open: OrderOpen) -> Result<Self, OrderMessageError> {
        let order_id = order_id_for(&open)?;
        Self::sign(identity, order_id, OrderMessage::OrderOpen(open))
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Checks the envelope signature against the sender's identity key and, for `ORDER_OPEN`, that the order id is
    /// the hash of the payload.
    pub fn verify(&self) -> Result<(), OrderMessageError> {
        if let OrderMessage::OrderOpen(open) = &self.message {
            let expected = order_id_for(open)?;
            if expected != self.order_id {
                return Err(OrderMessageError::OrderIdMismatch { given: self.order_id.clone(), expected });
            }
        }
        let message = signing_message(&self.order_id, &self.message)?;
        self.signature.verify(&self.sender, &message)?;
        Ok(())
    }

    pub fn to_blob(&self) -> Result<Vec<u8>, OrderMessageError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self, OrderMessageError> {
        Ok(serde_json::from_slice(blob)?)
    }
}

#[cfg(test)]
mod test {
    use chrono::Utc;

    use super::*;

    fn reject(reason: &str) -> OrderMessage {
        OrderMessage::OrderReject(OrderReject { timestamp: Utc::now(), reason: reason.into() })
    }

    #[test]
    fn signed_messages_verify() {
        let vendor = NodeIdentity::random();
        let msg = SignedOrderMessage::sign(&vendor, OrderId::new("abc"), reject("out of stock")).unwrap();
        assert_eq!(msg.kind(), MessageKind::OrderReject);
        assert!(msg.verify().is_ok());

        let mut tampered = msg.clone();
        tampered.message = reject("changed my mind");
        assert!(tampered.verify().is_err());

        let mut moved = msg.clone();
        moved.order_id = OrderId::new("abd");
        assert!(moved.verify().is_err());

        let mut impostor = msg;
        impostor.sender = NodeIdentity::random().peer_id().clone();
        assert!(matches!(impostor.verify(), Err(OrderMessageError::Identity(_))));
    }

    #[test]
    fn blobs_are_stable() {
        let buyer = NodeIdentity::random();
        let msg = SignedOrderMessage::sign(
            &buyer,
            OrderId::new("abc"),
            OrderMessage::PaymentSent(PaymentSent { timestamp: Utc::now(), txid: "t1".into() }),
        )
        .unwrap();
        let blob = msg.to_blob().unwrap();
        let decoded = SignedOrderMessage::from_blob(&blob).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.to_blob().unwrap(), blob);
        let text = String::from_utf8(blob).unwrap();
        assert!(text.contains(r#""messageType":"PAYMENT_SENT""#));
    }
}
