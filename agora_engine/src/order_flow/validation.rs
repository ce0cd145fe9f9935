//! Pricing and vendor-side checks of an incoming `ORDER_OPEN`.
use std::collections::BTreeMap;

use agora_common::{Amount, CurrencyDefinition, CurrencyDictionary, CurrencyValue};
use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::One;

use crate::{
    db_types::PaymentMethod,
    exchange_rates::ExchangeRateCache,
    helpers::NodeIdentity,
    order_flow::OrderFlowError,
    order_messages::{ContractType, CouponDiscount, Listing, OrderItem, OrderOpen, SignedListing},
};

pub(crate) fn listing_for<'a>(listings: &'a [SignedListing], item: &OrderItem) -> Option<&'a SignedListing> {
    listings.iter().find(|l| l.hash().map(|h| h == item.listing_hash).unwrap_or(false))
}

/// The price of one order line in the listing's pricing currency: options, coupons, quantity and shipping included.
pub fn line_total(listing: &Listing, item: &OrderItem, index: usize) -> Result<Amount, OrderFlowError> {
    if item.quantity == 0 {
        return Err(OrderFlowError::bad_request(format!("item {index} has a quantity of zero")));
    }
    if item.options.len() != listing.item.options.len() {
        return Err(OrderFlowError::bad_request(format!(
            "item {index} selects {} options but {} has {}",
            item.options.len(),
            listing.slug,
            listing.item.options.len()
        )));
    }
    let mut unit = listing.item.price.clone();
    for option in &item.options {
        let surcharge = listing.option_surcharge(&option.name, &option.value).ok_or_else(|| {
            let (slug, name, value) = (&listing.slug, &option.name, &option.value);
            OrderFlowError::bad_request(format!("item {index}: {slug} has no option {name}={value}"))
        })?;
        unit += surcharge.clone();
    }
    for code in &item.coupon_codes {
        let coupon = listing
            .coupons
            .iter()
            .find(|c| c.matches(code))
            .ok_or_else(|| OrderFlowError::bad_request(format!("item {index}: invalid coupon code")))?;
        let discount = match &coupon.discount {
            CouponDiscount::Percent(p) => Amount::new(unit.value() * BigInt::from((*p).min(100)) / 100),
            CouponDiscount::Price(price) => price.clone(),
        };
        unit -= discount;
        if unit.is_negative() {
            unit = Amount::zero();
        }
    }
    let mut total = Amount::new(unit.value() * BigInt::from(item.quantity));
    match (&item.shipping_option, listing.metadata.contract_type) {
        (Some(selected), _) => {
            let service = listing.shipping_service(&selected.name, &selected.service).ok_or_else(|| {
                OrderFlowError::bad_request(format!(
                    "item {index}: {} does not ship with {}/{}",
                    listing.slug, selected.name, selected.service
                ))
            })?;
            let extra = Amount::new(service.additional_item_price.value() * BigInt::from(item.quantity - 1));
            total += service.price.clone() + extra;
        },
        (None, ContractType::PhysicalGood) => {
            return Err(OrderFlowError::bad_request(format!("item {index} is a physical good without shipping")));
        },
        (None, _) => {},
    }
    Ok(total)
}

/// Sums the order lines per pricing currency.
pub fn order_totals(
    listings: &[SignedListing],
    items: &[OrderItem],
    dictionary: &CurrencyDictionary,
) -> Result<Vec<CurrencyValue>, OrderFlowError> {
    if items.is_empty() {
        return Err(OrderFlowError::bad_request("the order has no items"));
    }
    let mut totals: BTreeMap<String, CurrencyValue> = BTreeMap::new();
    for (index, item) in items.iter().enumerate() {
        let listing = listing_for(listings, item)
            .ok_or_else(|| OrderFlowError::bad_request(format!("item {index} refers to an unknown listing")))?;
        let currency = dictionary.lookup(&listing.listing.metadata.pricing_currency)?;
        let line = CurrencyValue::new(line_total(&listing.listing, item, index)?, currency);
        let code = line.currency.code.clone();
        let total = match totals.remove(&code) {
            Some(total) => total.checked_add(&line)?,
            None => line,
        };
        totals.insert(code, total);
    }
    Ok(totals.into_values().collect())
}

/// What the order costs in `coin`. The flag is true when no exchange rate was involved.
pub(crate) async fn payment_due(
    rates: &ExchangeRateCache,
    totals: &[CurrencyValue],
    coin: &CurrencyDefinition,
) -> Result<(Amount, bool), OrderFlowError> {
    let mut due = Amount::zero();
    let mut exact = true;
    for total in totals {
        if total.currency.equal(coin) {
            due += total.amount.clone();
        } else {
            exact = false;
            due += rates.convert(total, coin).await?.amount;
        }
    }
    Ok((due, exact))
}

/// A payment is short when it is below `expected`, or below `expected × (1 − tolerance)` after a currency conversion.
pub(crate) fn check_payment_amount(
    paid: &Amount,
    expected: &Amount,
    exact: bool,
    tolerance: &BigRational,
) -> Result<(), OrderFlowError> {
    let floor = if exact {
        BigRational::from_integer(expected.value().clone())
    } else {
        BigRational::from_integer(expected.value().clone()) * (BigRational::one() - tolerance)
    };
    if BigRational::from_integer(paid.value().clone()) < floor {
        return Err(OrderFlowError::bad_request(format!("the payment of {paid} is less than the {expected} due")));
    }
    Ok(())
}

/// The listing checks a vendor runs on every `ORDER_OPEN`: its own signed listings, one rating key per item, a
/// buyer id bound to its escrow key, an accepted coin, and a moderator the listings allow.
pub(crate) fn check_order_open(
    open: &OrderOpen,
    vendor: &NodeIdentity,
    dictionary: &CurrencyDictionary,
) -> Result<(), OrderFlowError> {
    if open.listings.is_empty() {
        return Err(OrderFlowError::bad_request("the order has no listings"));
    }
    for listing in &open.listings {
        if &listing.listing.vendor.peer_id != vendor.peer_id() || listing.listing.vendor.pubkeys != vendor.keys() {
            return Err(OrderFlowError::bad_request(format!("listing {} is not one of ours", listing.listing.slug)));
        }
        listing.verify()?;
    }
    if open.rating_keys.len() != open.items.len() {
        return Err(OrderFlowError::bad_request(format!(
            "{} rating keys for {} items",
            open.rating_keys.len(),
            open.items.len()
        )));
    }
    let buyer = &open.buyer_id;
    buyer.sig.verify(&buyer.peer_id, buyer.pubkeys.secp256k1.as_bytes())?;
    if buyer.pubkeys.identity != buyer.peer_id.as_str() {
        return Err(OrderFlowError::bad_request("the buyer's identity key does not match their peer id"));
    }
    let payment = &open.payment;
    if !payment.amount.is_positive() {
        return Err(OrderFlowError::bad_request(format!("payment amount of {} is not positive", payment.amount)));
    }
    if payment.escrow_release_fee.is_negative() || payment.escrow_release_fee >= payment.amount {
        return Err(OrderFlowError::bad_request(format!(
            "escrow release fee of {} is outside [0, {})",
            payment.escrow_release_fee, payment.amount
        )));
    }
    let coin = dictionary.lookup(&open.payment.coin)?;
    for listing in &open.listings {
        let accepted = listing
            .listing
            .metadata
            .accepted_currencies
            .iter()
            .filter_map(|c| dictionary.lookup(c).ok())
            .any(|c| c.equal(&coin));
        if !accepted {
            return Err(OrderFlowError::bad_request(format!(
                "listing {} does not accept {}",
                listing.listing.slug, open.payment.coin
            )));
        }
    }
    if open.payment.method == PaymentMethod::Moderated {
        let moderator =
            open.moderator().ok_or_else(|| OrderFlowError::bad_request("a moderated order needs a moderator"))?;
        if open.payment.moderator_key.is_none() {
            return Err(OrderFlowError::bad_request("a moderated order needs the moderator's escrow key"));
        }
        if let Some(listing) = open.listings.iter().find(|l| !l.listing.moderators.contains(moderator)) {
            return Err(OrderFlowError::bad_request(format!(
                "{moderator} does not moderate listing {}",
                listing.listing.slug
            )));
        }
        let timeout = open.listings[0].listing.metadata.escrow_timeout_hours;
        if open.payment.escrow_timeout_hours != timeout {
            return Err(OrderFlowError::bad_request(format!(
                "escrow timeout of {} hours differs from the listing's {timeout}",
                open.payment.escrow_timeout_hours
            )));
        }
    } else if open.moderator().is_some() {
        return Err(OrderFlowError::bad_request(format!("{} orders have no moderator", open.payment.method)));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use agora_common::CurrencyDictionary;

    use super::*;
    use crate::{
        order_messages::{Coupon, SelectedOption, SelectedShipping},
        test_utils::fixtures::{chair_listing, Marketplace},
    };

    fn item(listing: &SignedListing, quantity: u64) -> OrderItem {
        OrderItem {
            listing_hash: listing.hash().unwrap(),
            quantity,
            options: vec![SelectedOption { name: "colour".into(), value: "red".into() }],
            shipping_option: Some(SelectedShipping { name: "worldwide".into(), service: "standard".into() }),
            memo: String::new(),
            coupon_codes: vec![],
            payment_address: String::new(),
        }
    }

    #[test]
    fn line_totals() {
        let market = Marketplace::new();
        let listing = chair_listing(&market.vendor);
        // 1000 + 50 for red, 200 shipping + 100 per extra chair: 3 × 1050 + 200 + 2 × 100 = 3550
        assert_eq!(line_total(&listing.listing, &item(&listing, 1), 0).unwrap(), Amount::from(1250u64));
        assert_eq!(line_total(&listing.listing, &item(&listing, 3), 0).unwrap(), Amount::from(3550u64));

        let mut coupon = item(&listing, 2);
        coupon.coupon_codes.push("HALFOFF".into());
        assert!(listing.listing.coupons.iter().any(|c| c.discount_code == Coupon::hash_code("HALFOFF")));
        // 525 × 2 + 300
        assert_eq!(line_total(&listing.listing, &coupon, 0).unwrap(), Amount::from(1350u64));

        let mut bad = item(&listing, 1);
        bad.coupon_codes.push("FREE".into());
        assert!(matches!(line_total(&listing.listing, &bad, 0), Err(OrderFlowError::BadRequest(_))));
        let mut unshipped = item(&listing, 1);
        unshipped.shipping_option = None;
        assert!(matches!(line_total(&listing.listing, &unshipped, 0), Err(OrderFlowError::BadRequest(_))));
        let mut nothing = item(&listing, 0);
        nothing.quantity = 0;
        assert!(line_total(&listing.listing, &nothing, 0).is_err());
        let mut blue = item(&listing, 1);
        blue.options[0].value = "blue".into();
        assert!(line_total(&listing.listing, &blue, 0).is_err());
    }

    #[test]
    fn totals_group_by_currency() {
        let market = Marketplace::new();
        let listing = chair_listing(&market.vendor);
        let items = vec![item(&listing, 1), item(&listing, 1)];
        let totals = order_totals(&[listing.clone()], &items, CurrencyDictionary::global()).unwrap();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].amount, Amount::from(2500u64));
        assert_eq!(totals[0].currency.code, "USD");
        let mut stray = item(&listing, 1);
        stray.listing_hash = "nope".into();
        assert!(order_totals(&[listing], &[stray], CurrencyDictionary::global()).is_err());
    }

    #[test]
    fn tolerance_only_applies_after_conversion() {
        let tolerance = BigRational::new(BigInt::from(5), BigInt::from(100));
        let expected = Amount::from(10_000u64);
        assert!(check_payment_amount(&Amount::from(10_000u64), &expected, true, &tolerance).is_ok());
        assert!(check_payment_amount(&Amount::from(9_999u64), &expected, true, &tolerance).is_err());
        assert!(check_payment_amount(&Amount::from(9_500u64), &expected, false, &tolerance).is_ok());
        assert!(check_payment_amount(&Amount::from(9_499u64), &expected, false, &tolerance).is_err());
    }

    #[test]
    fn vendors_only_accept_their_own_listings() {
        let market = Marketplace::new();
        let open = crate::test_utils::fixtures::order_open_fixture(&market, PaymentMethod::Moderated, 1);
        assert!(check_order_open(&open, &market.vendor, CurrencyDictionary::global()).is_ok());
        assert!(check_order_open(&open, &market.moderator, CurrencyDictionary::global()).is_err());

        let mut short_keys = open.clone();
        short_keys.rating_keys.clear();
        assert!(check_order_open(&short_keys, &market.vendor, CurrencyDictionary::global()).is_err());

        let mut unaccepted = open.clone();
        unaccepted.payment.coin = "TLTC".into();
        assert!(check_order_open(&unaccepted, &market.vendor, CurrencyDictionary::global()).is_err());

        let mut stranger = open;
        stranger.payment.moderator = Some(market.stranger.peer_id().clone());
        assert!(check_order_open(&stranger, &market.vendor, CurrencyDictionary::global()).is_err());
    }

    #[test]
    fn release_fee_must_leave_something_to_release() {
        let market = Marketplace::new();
        let open = crate::test_utils::fixtures::order_open_fixture(&market, PaymentMethod::Moderated, 1);
        let check = |fee: i64, amount: i64| {
            let mut open = open.clone();
            open.payment.escrow_release_fee = Amount::from(fee);
            open.payment.amount = Amount::from(amount);
            check_order_open(&open, &market.vendor, CurrencyDictionary::global())
        };
        assert!(check(0, 25_000).is_ok());
        assert!(check(24_999, 25_000).is_ok());
        assert!(matches!(check(25_000, 25_000), Err(OrderFlowError::BadRequest(_))));
        assert!(matches!(check(30_000, 25_000), Err(OrderFlowError::BadRequest(_))));
        assert!(matches!(check(-1, 25_000), Err(OrderFlowError::BadRequest(_))));
        assert!(matches!(check(0, 0), Err(OrderFlowError::BadRequest(_))));
        assert!(matches!(check(0, -5), Err(OrderFlowError::BadRequest(_))));
    }
}
