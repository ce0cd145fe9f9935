//! Identities, listings and orders shared by the unit tests, integration tests and cucumber scenarios.
//!
//! The chair listing is priced in USD cents: 1000 for the chair, 50 extra in red, and worldwide standard shipping at
//! 200 plus 100 per extra chair. The coupon `HALFOFF` takes 50% off the unit price.
use agora_common::Amount;
use chrono::Utc;

use crate::{
    db_types::{PaymentMethod, PeerId},
    helpers::{ChainCode, NodeIdentity},
    order_flow::ORDER_VERSION,
    order_messages::{
        BuyerId,
        ContractType,
        Coupon,
        CouponDiscount,
        Listing,
        ListingItem,
        ListingMetadata,
        ListingOption,
        OptionVariant,
        OrderItem,
        OrderOpen,
        Payment,
        SelectedOption,
        SelectedShipping,
        ShippingAddress,
        ShippingOption,
        ShippingService,
        SignedListing,
        VendorId,
    },
    ratings::rating_public_keys,
};

pub const TEST_COIN: &str = "TBTC";
pub const CHAIR_SLUG: &str = "oak-chair";

/// The cast of every test: a buyer, a vendor, the moderator the vendor's listings name, and a stranger.
pub struct Marketplace {
    pub buyer: NodeIdentity,
    pub vendor: NodeIdentity,
    pub moderator: NodeIdentity,
    pub stranger: NodeIdentity,
}

impl Default for Marketplace {
    fn default() -> Self {
        Self::new()
    }
}

impl Marketplace {
    pub fn new() -> Self {
        Self {
            buyer: NodeIdentity::random(),
            vendor: NodeIdentity::random(),
            moderator: NodeIdentity::random(),
            stranger: NodeIdentity::random(),
        }
    }

    /// The vendor's chair, moderated by the market's moderator.
    pub fn chair(&self, escrow_timeout_hours: u32) -> SignedListing {
        listing(&self.vendor, &[self.moderator.peer_id().clone()], escrow_timeout_hours)
    }
}

/// A chair listing with no moderators.
pub fn chair_listing(vendor: &NodeIdentity) -> SignedListing {
    listing(vendor, &[], 0)
}

pub fn listing(vendor: &NodeIdentity, moderators: &[PeerId], escrow_timeout_hours: u32) -> SignedListing {
    let listing = Listing {
        slug: CHAIR_SLUG.into(),
        vendor: VendorId { peer_id: vendor.peer_id().clone(), handle: "@chairs".into(), pubkeys: vendor.keys() },
        metadata: ListingMetadata {
            contract_type: ContractType::PhysicalGood,
            pricing_currency: "USD".into(),
            accepted_currencies: vec![TEST_COIN.into()],
            escrow_timeout_hours,
            version: 1,
        },
        item: ListingItem {
            title: "Oak chair".into(),
            description: "A <b>sturdy</b> chair".into(),
            price: Amount::from(1000u64),
            options: vec![ListingOption {
                name: "colour".into(),
                variants: vec![
                    OptionVariant { name: "natural".into(), surcharge: Amount::zero() },
                    OptionVariant { name: "red".into(), surcharge: Amount::from(50u64) },
                ],
            }],
        },
        shipping_options: vec![ShippingOption {
            name: "worldwide".into(),
            regions: vec!["ALL".into()],
            services: vec![ShippingService {
                name: "standard".into(),
                price: Amount::from(200u64),
                additional_item_price: Amount::from(100u64),
            }],
        }],
        moderators: moderators.to_vec(),
        coupons: vec![Coupon {
            title: "Half off".into(),
            discount_code: Coupon::hash_code("HALFOFF"),
            discount: CouponDiscount::Percent(50),
        }],
        terms_and_conditions: String::new(),
        refund_policy: "Returns within 30 days".into(),
    };
    SignedListing::sign(listing, vendor).expect("Could not sign listing")
}

/// One red chair, shipped worldwide.
pub fn chair_item(listing: &SignedListing) -> OrderItem {
    OrderItem {
        listing_hash: listing.hash().expect("Could not hash listing"),
        quantity: 1,
        options: vec![SelectedOption { name: "colour".into(), value: "red".into() }],
        shipping_option: Some(SelectedShipping { name: "worldwide".into(), service: "standard".into() }),
        memo: String::new(),
        coupon_codes: vec![],
        payment_address: String::new(),
    }
}

pub fn shipping_address() -> ShippingAddress {
    ShippingAddress {
        ship_to: "Alice".into(),
        address: "1 Main Street".into(),
        city: "Springfield".into(),
        state: "IL".into(),
        postal_code: "62701".into(),
        country: "US".into(),
        address_notes: String::new(),
    }
}

/// A well-formed `ORDER_OPEN` from the market's buyer for `n_items` chairs. The payment address and redeem script
/// are placeholders, so it is only good for checks that never touch a wallet.
pub fn order_open_fixture(market: &Marketplace, method: PaymentMethod, n_items: usize) -> OrderOpen {
    let buyer = &market.buyer;
    let listing = market.chair(0);
    let chaincode = ChainCode::random();
    let moderated = method == PaymentMethod::Moderated;
    OrderOpen {
        items: (0..n_items).map(|_| chair_item(&listing)).collect(),
        listings: vec![listing],
        refund_address: "refund-address".into(),
        shipping: Some(shipping_address()),
        buyer_id: BuyerId {
            peer_id: buyer.peer_id().clone(),
            handle: String::new(),
            pubkeys: buyer.keys(),
            sig: buyer.sign_escrow_key().expect("Could not sign escrow key"),
        },
        timestamp: Utc::now(),
        payment: Payment {
            method,
            moderator: moderated.then(|| market.moderator.peer_id().clone()),
            amount: Amount::from(25_000u64 * n_items as u64),
            chaincode,
            address: "escrow-address".into(),
            redeem_script: String::new(),
            moderator_key: moderated.then(|| market.moderator.escrow_public().to_string()),
            coin: TEST_COIN.into(),
            escrow_release_fee: Amount::from(1_000u64),
            escrow_timeout_hours: 0,
        },
        rating_keys: rating_public_keys(buyer.rating_master(), &chaincode, n_items).expect("Could not derive keys"),
        alternate_contact_info: String::new(),
        version: ORDER_VERSION,
    }
}
