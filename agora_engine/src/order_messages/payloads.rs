use agora_common::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    db_types::{PaymentMethod, PeerId, Role},
    escrow::ReleaseInfo,
    helpers::{ChainCode, IdentityKeys, IdentitySignature},
    order_messages::SignedListing,
    ratings::{Rating, RatingSignature},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingAddress {
    pub ship_to: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
    pub address_notes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyerId {
    pub peer_id: PeerId,
    pub handle: String,
    pub pubkeys: IdentityKeys,
    /// Identity signature over the buyer's secp256k1 key.
    pub sig: IdentitySignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedOption {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedShipping {
    pub name: String,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub listing_hash: String,
    pub quantity: u64,
    pub options: Vec<SelectedOption>,
    pub shipping_option: Option<SelectedShipping>,
    pub memo: String,
    pub coupon_codes: Vec<String>,
    pub payment_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub method: PaymentMethod,
    pub moderator: Option<PeerId>,
    /// In the smallest unit of `coin`.
    pub amount: Amount,
    pub chaincode: ChainCode,
    pub address: String,
    /// Hex redeem script of the payment address.
    pub redeem_script: String,
    /// The moderator's secp256k1 escrow key (hex), for moderated payments.
    pub moderator_key: Option<String>,
    pub coin: String,
    pub escrow_release_fee: Amount,
    pub escrow_timeout_hours: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderOpen {
    pub listings: Vec<SignedListing>,
    pub refund_address: String,
    pub shipping: Option<ShippingAddress>,
    pub buyer_id: BuyerId,
    pub timestamp: DateTime<Utc>,
    pub items: Vec<OrderItem>,
    pub payment: Payment,
    pub rating_keys: Vec<String>,
    pub alternate_contact_info: String,
    pub version: u32,
}

impl OrderOpen {
    pub fn buyer(&self) -> &PeerId {
        &self.buyer_id.peer_id
    }

    pub fn vendor(&self) -> Option<&PeerId> {
        self.listings.first().map(|l| &l.listing.vendor.peer_id)
    }

    pub fn vendor_keys(&self) -> Option<&IdentityKeys> {
        self.listings.first().map(|l| &l.listing.vendor.pubkeys)
    }

    pub fn moderator(&self) -> Option<&PeerId> {
        self.payment.moderator.as_ref()
    }

    /// The role `peer` plays in this order.
    pub fn role_of(&self, peer: &PeerId) -> Role {
        if self.buyer() == peer {
            Role::Buyer
        } else if self.vendor() == Some(peer) {
            Role::Vendor
        } else if self.moderator() == Some(peer) {
            Role::Moderator
        } else {
            Role::Unknown
        }
    }

    /// Everyone involved in the order apart from `me`.
    pub fn counterparties(&self, me: &PeerId) -> Vec<PeerId> {
        [Some(self.buyer()), self.vendor(), self.moderator()]
            .into_iter()
            .flatten()
            .filter(|p| *p != me)
            .cloned()
            .collect()
    }

    pub fn listing_for(&self, item: &OrderItem) -> Option<&SignedListing> {
        self.listings.iter().find(|l| l.hash().map(|h| h == item.listing_hash).unwrap_or(false))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderReject {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancel {
    pub timestamp: DateTime<Utc>,
    /// The sweep of a cancelable escrow back to the buyer, if there was anything to sweep.
    pub refund_txid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderConfirmation {
    pub timestamp: DateTime<Utc>,
    /// Carried here for direct and cancelable orders. Moderated orders send `RATING_SIGNATURES` once funded.
    pub rating_signatures: Vec<RatingSignature>,
    /// The vendor's sweep of a cancelable escrow.
    pub payout_txid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingSignatures {
    pub timestamp: DateTime<Utc>,
    pub signatures: Vec<RatingSignature>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tracking {
    pub carrier: String,
    pub number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigitalDelivery {
    pub url: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfilledItem {
    pub item_index: u32,
    pub tracking: Option<Tracking>,
    pub digital: Option<DigitalDelivery>,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFulfillment {
    pub timestamp: DateTime<Utc>,
    pub items: Vec<FulfilledItem>,
    pub note: String,
    /// Where the buyer should release a moderated escrow to.
    pub payout_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderComplete {
    pub timestamp: DateTime<Utc>,
    pub ratings: Vec<Rating>,
    /// The buyer's half of a moderated escrow release.
    pub release: Option<ReleaseInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeOpen {
    pub timestamp: DateTime<Utc>,
    pub claim: String,
    pub opened_by: Role,
    pub payout_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeUpdate {
    pub timestamp: DateTime<Utc>,
    pub claim: String,
    pub submitted_by: Role,
    pub payout_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutOutput {
    pub address: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputePayout {
    pub buyer: Option<PayoutOutput>,
    pub vendor: Option<PayoutOutput>,
    pub moderator: Option<PayoutOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeClose {
    pub timestamp: DateTime<Utc>,
    pub resolution: String,
    pub payout: DisputePayout,
    /// The moderator's signatures over the payout transaction.
    pub release: ReleaseInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Refund {
    pub timestamp: DateTime<Utc>,
    /// Direct refunds: the vendor's payment back to the buyer.
    pub txid: Option<String>,
    /// Moderated refunds: the vendor's half of an escrow release to the buyer.
    pub release: Option<ReleaseInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSent {
    pub timestamp: DateTime<Utc>,
    pub txid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFinalized {
    pub timestamp: DateTime<Utc>,
    pub txid: String,
}
