//! Primitives shared by every Agora crate: monetary amounts and currencies, secrets and small parsing helpers.
pub mod currency;
pub mod helpers;
pub mod op;
mod secret;

pub use currency::{
    parse_decimal_rational,
    Amount,
    CurrencyDefinition,
    CurrencyDictionary,
    CurrencyError,
    CurrencyType,
    CurrencyValue,
    RESERVE_CURRENCY_CODE,
};
pub use secret::Secret;
