use agora_common::Amount;
use serde::{Deserialize, Serialize};

use crate::{
    db_types::PeerId,
    helpers::{hashing::blake2b_hex, IdentityError, IdentityKeys, IdentitySignature, NodeIdentity},
    order_messages::OrderMessageError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractType {
    PhysicalGood,
    DigitalGood,
    Service,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorId {
    pub peer_id: PeerId,
    pub handle: String,
    pub pubkeys: IdentityKeys,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingMetadata {
    pub contract_type: ContractType,
    /// Currency the item and shipping prices are quoted in.
    pub pricing_currency: String,
    pub accepted_currencies: Vec<String>,
    /// Hours after funding before the vendor may claim a moderated escrow alone. Zero disables the escape.
    pub escrow_timeout_hours: u32,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionVariant {
    pub name: String,
    pub surcharge: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingOption {
    pub name: String,
    pub variants: Vec<OptionVariant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingItem {
    pub title: String,
    pub description: String,
    pub price: Amount,
    pub options: Vec<ListingOption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingService {
    pub name: String,
    pub price: Amount,
    pub additional_item_price: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingOption {
    pub name: String,
    pub regions: Vec<String>,
    pub services: Vec<ShippingService>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CouponDiscount {
    Percent(u32),
    Price(Amount),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coupon {
    pub title: String,
    /// blake2b hash of the code a buyer must present.
    pub discount_code: String,
    pub discount: CouponDiscount,
}

impl Coupon {
    pub fn hash_code(code: &str) -> String {
        blake2b_hex(code.as_bytes())
    }

    pub fn matches(&self, code: &str) -> bool {
        self.discount_code == Self::hash_code(code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub slug: String,
    pub vendor: VendorId,
    pub metadata: ListingMetadata,
    pub item: ListingItem,
    pub shipping_options: Vec<ShippingOption>,
    pub moderators: Vec<PeerId>,
    pub coupons: Vec<Coupon>,
    pub terms_and_conditions: String,
    pub refund_policy: String,
}

impl Listing {
    pub fn option_surcharge(&self, option: &str, variant: &str) -> Option<&Amount> {
        self.item
            .options
            .iter()
            .find(|o| o.name == option)
            .and_then(|o| o.variants.iter().find(|v| v.name == variant))
            .map(|v| &v.surcharge)
    }

    pub fn shipping_service(&self, option: &str, service: &str) -> Option<&ShippingService> {
        self.shipping_options
            .iter()
            .find(|o| o.name == option)
            .and_then(|o| o.services.iter().find(|s| s.name == service))
    }
}

/// A listing as published by its vendor, with the vendor's identity signature over the serialized listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedListing {
    pub listing: Listing,
    pub signature: IdentitySignature,
}

impl SignedListing {
    pub fn sign(listing: Listing, vendor: &NodeIdentity) -> Result<Self, OrderMessageError> {
        let bytes = serde_json::to_vec(&listing)?;
        let signature = vendor.sign(&bytes)?;
        Ok(Self { listing, signature })
    }

    pub fn verify(&self) -> Result<(), IdentityError> {
        let bytes = serde_json::to_vec(&self.listing).map_err(|e| IdentityError::InvalidSignature(e.to_string()))?;
        self.signature.verify(&self.listing.vendor.peer_id, &bytes)
    }

    /// The content hash order items use to refer to this listing.
    pub fn hash(&self) -> Result<String, OrderMessageError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(blake2b_hex(&bytes))
    }
}
