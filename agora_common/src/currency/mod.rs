//! Currencies and arbitrary-precision monetary values.
//!
//! Every amount in the order core is an integer count of the currency's smallest unit ([`Amount`]) paired with a
//! [`CurrencyDefinition`]. Conversion between currencies goes through exact rationals so that no floating point
//! rounding can creep into order totals.
mod amount;
mod dictionary;
mod errors;
mod rational;
mod value;

pub use amount::Amount;
pub use dictionary::{CurrencyDefinition, CurrencyDictionary, CurrencyType, RESERVE_CURRENCY_CODE};
pub use errors::CurrencyError;
pub use rational::parse_decimal_rational;
pub use value::CurrencyValue;
