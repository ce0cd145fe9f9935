use std::collections::HashMap;

use agora_common::CurrencyError;
use async_trait::async_trait;
use num_rational::BigRational;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeRateError {
    #[error("Every exchange rate provider failed")]
    AllProvidersFailed,
    #[error("Exchange rate provider {provider} failed: {reason}")]
    ProviderError { provider: String, reason: String },
    #[error("No exchange rate is known for {0}")]
    RateDoesNotExist(String),
    #[error("{0}")]
    Currency(#[from] CurrencyError),
}

/// An upstream feed of exchange rates.
#[async_trait]
pub trait RateSource: Send + Sync {
    fn name(&self) -> &str;

    /// Units of each listed currency per one unit of the reserve currency.
    async fn fetch_rates(&self) -> Result<HashMap<String, BigRational>, ExchangeRateError>;
}
