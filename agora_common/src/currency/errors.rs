use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CurrencyError {
    #[error("Exchange rate must be positive")]
    NegativeRate,
    #[error("Invalid currency value: {0}")]
    InvalidValue(String),
    #[error("Currency definition is undefined: {0}")]
    CurrencyDefinitionUndefined(String),
    #[error("Value has more precision than the currency allows: {0}")]
    InsufficientPrecision(String),
    #[error("Cannot combine values in different currencies ({0} and {1})")]
    CurrencyMismatch(String, String),
}
