use std::{collections::HashMap, time::Duration};

use agora_common::parse_decimal_rational;
use async_trait::async_trait;
use log::*;
use num_rational::BigRational;
use serde_json::Value;

use crate::traits::{ExchangeRateError, RateSource};

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Fetches reserve-currency rates from a JSON endpoint.
///
/// Two response shapes are understood: `{"USD": {"last": 407.2}, ...}` and `{"USD": 407.2, ...}`. Numbers are read
/// from their decimal text, never through `f64`.
pub struct HttpRateSource {
    url: String,
    client: reqwest::Client,
}

impl HttpRateSource {
    pub fn new(url: &str) -> Result<Self, ExchangeRateError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ExchangeRateError::ProviderError { provider: url.to_string(), reason: e.to_string() })?;
        Ok(Self { url: url.to_string(), client })
    }

    fn provider_error<E: std::fmt::Display>(&self, e: E) -> ExchangeRateError {
        ExchangeRateError::ProviderError { provider: self.url.clone(), reason: e.to_string() }
    }
}

/// Extracts `code → rate` pairs from a decoded response body. Entries that are not positive numbers are skipped.
pub(crate) fn parse_rate_response(body: &Value) -> Option<HashMap<String, BigRational>> {
    let obj = body.as_object()?;
    let rates = obj
        .iter()
        .filter_map(|(code, entry)| {
            let number = match entry {
                Value::Number(n) => n,
                Value::Object(o) => match o.get("last")? {
                    Value::Number(n) => n,
                    _ => return None,
                },
                _ => return None,
            };
            parse_decimal_rational(&number.to_string()).map(|rate| (code.to_ascii_uppercase(), rate))
        })
        .collect::<HashMap<_, _>>();
    Some(rates)
}

#[async_trait]
impl RateSource for HttpRateSource {
    fn name(&self) -> &str {
        &self.url
    }

    async fn fetch_rates(&self) -> Result<HashMap<String, BigRational>, ExchangeRateError> {
        trace!("💱️ Fetching rates from {}", self.url);
        let response = self.client.get(&self.url).send().await.map_err(|e| self.provider_error(e))?;
        let response = response.error_for_status().map_err(|e| self.provider_error(e))?;
        let body = response.json::<Value>().await.map_err(|e| self.provider_error(e))?;
        let rates = parse_rate_response(&body).ok_or_else(|| self.provider_error("response is not a JSON object"))?;
        if rates.is_empty() {
            return Err(self.provider_error("response contained no rates"));
        }
        Ok(rates)
    }
}

/// A fixed table of reserve-currency rates, for regtest nodes and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticRateSource {
    rates: HashMap<String, BigRational>,
}

impl StaticRateSource {
    pub fn new<'a, I: IntoIterator<Item = (&'a str, BigRational)>>(rates: I) -> Self {
        Self { rates: rates.into_iter().map(|(c, r)| (c.to_ascii_uppercase(), r)).collect() }
    }
}

#[async_trait]
impl RateSource for StaticRateSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch_rates(&self) -> Result<HashMap<String, BigRational>, ExchangeRateError> {
        if self.rates.is_empty() {
            return Err(ExchangeRateError::ProviderError { provider: "static".into(), reason: "no rates".into() });
        }
        Ok(self.rates.clone())
    }
}

#[cfg(test)]
mod test {
    use num_bigint::BigInt;

    use super::*;

    #[test]
    fn both_response_shapes() {
        let nested = r#"{"USD": {"last": 407.2, "volume": 3}, "eur": {"bid": 1}}"#;
        let nested: Value = serde_json::from_str(nested).unwrap();
        let rates = parse_rate_response(&nested).unwrap();
        assert_eq!(rates["USD"], BigRational::new(BigInt::from(4072), BigInt::from(10)));
        assert!(!rates.contains_key("EUR"));

        let flat: Value = serde_json::from_str(r#"{"USD": 60000, "gbp": 0.1, "note": "hi"}"#).unwrap();
        let rates = parse_rate_response(&flat).unwrap();
        assert_eq!(rates.len(), 2);
        assert_eq!(rates["GBP"], BigRational::new(BigInt::from(1), BigInt::from(10)));
        assert!(parse_rate_response(&Value::Null).is_none());
    }
}
