//! # Exchange-rate cache
//!
//! Listings are priced in whatever currency the vendor likes, and orders are paid in a cryptocurrency. The cache turns
//! one into the other.
//!
//! Every [`RateSource`] quotes rates against the reserve currency ([`RESERVE_CURRENCY_CODE`]). A query for any other
//! base is pivoted through the reserve using exact rational arithmetic, so `rate(b → c) = reserve[c] / reserve[b]`.
//! Results are cached per base currency for a configurable time-to-live (ten minutes by default). Sources are tried in
//! order on a miss; if every one of them fails the query fails with [`ExchangeRateError::AllProvidersFailed`].
//!
//! Testnet codes (`TBTC`, `TLTC`, ...) are priced as their mainnet twins.
mod sources;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use agora_common::{CurrencyDefinition, CurrencyDictionary, CurrencyValue, RESERVE_CURRENCY_CODE};
use log::*;
use num_rational::BigRational;
use num_traits::{One, Signed};
pub use sources::{HttpRateSource, StaticRateSource, HTTP_TIMEOUT};

use crate::traits::{ExchangeRateError, RateSource};

pub const DEFAULT_RATE_TTL: Duration = Duration::from_secs(600);

struct CachedRates {
    fetched_at: Instant,
    rates: Arc<HashMap<String, BigRational>>,
}

#[derive(Clone)]
pub struct ExchangeRateCache {
    sources: Vec<Arc<dyn RateSource>>,
    ttl: Duration,
    dictionary: CurrencyDictionary,
    cache: Arc<Mutex<HashMap<String, CachedRates>>>,
}

impl std::fmt::Debug for ExchangeRateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self.sources.iter().map(|s| s.name()).collect::<Vec<_>>();
        write!(f, "ExchangeRateCache({})", names.join(", "))
    }
}

impl ExchangeRateCache {
    pub fn new(sources: Vec<Arc<dyn RateSource>>, ttl: Duration) -> Self {
        Self::with_dictionary(sources, ttl, CurrencyDictionary::global().clone())
    }

    pub fn with_dictionary(sources: Vec<Arc<dyn RateSource>>, ttl: Duration, dictionary: CurrencyDictionary) -> Self {
        Self { sources, ttl, dictionary, cache: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn dictionary(&self) -> &CurrencyDictionary {
        &self.dictionary
    }

    /// The code rates are looked up under: uppercased, with any testnet prefix removed.
    fn rate_code(&self, code: &str) -> String {
        self.dictionary
            .lookup(code)
            .map(|d| d.base_code().to_string())
            .unwrap_or_else(|_| code.trim().to_ascii_uppercase())
    }

    /// Drops every cached rate, forcing the next query to hit the sources.
    pub fn break_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
        debug!("💱️ Exchange rate cache cleared");
    }

    fn cached(&self, base: &str) -> Option<Arc<HashMap<String, BigRational>>> {
        let cache = self.cache.lock().ok()?;
        cache.get(base).filter(|c| c.fetched_at.elapsed() < self.ttl).map(|c| c.rates.clone())
    }

    fn store(&self, base: &str, rates: Arc<HashMap<String, BigRational>>) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(base.to_string(), CachedRates { fetched_at: Instant::now(), rates });
        }
    }

    async fn fetch_reserve_rates(&self) -> Result<HashMap<String, BigRational>, ExchangeRateError> {
        for source in &self.sources {
            match source.fetch_rates().await {
                Ok(rates) => {
                    debug!("💱️ Fetched {} rates from {}", rates.len(), source.name());
                    let mut rates = rates
                        .into_iter()
                        .map(|(code, rate)| (code.to_ascii_uppercase(), rate))
                        .filter(|(_, rate)| rate.is_positive())
                        .collect::<HashMap<_, _>>();
                    rates.insert(RESERVE_CURRENCY_CODE.to_string(), BigRational::one());
                    return Ok(rates);
                },
                Err(e) => warn!("💱️ Exchange rate source {} failed: {e}", source.name()),
            }
        }
        error!("💱️ Every exchange rate source failed");
        Err(ExchangeRateError::AllProvidersFailed)
    }

    /// Units of every known currency per one unit of `base`.
    pub async fn get_all_rates(
        &self,
        base: &str,
        break_cache: bool,
    ) -> Result<Arc<HashMap<String, BigRational>>, ExchangeRateError> {
        let base = self.rate_code(base);
        if break_cache {
            self.break_cache();
        } else if let Some(rates) = self.cached(&base) {
            trace!("💱️ Cache hit for {base}");
            return Ok(rates);
        }
        let reserve = match self.cached(RESERVE_CURRENCY_CODE) {
            Some(rates) => rates,
            None => {
                let rates = Arc::new(self.fetch_reserve_rates().await?);
                self.store(RESERVE_CURRENCY_CODE, rates.clone());
                rates
            },
        };
        if base == RESERVE_CURRENCY_CODE {
            return Ok(reserve);
        }
        let per_reserve = reserve.get(&base).ok_or_else(|| ExchangeRateError::RateDoesNotExist(base.clone()))?;
        let rates = Arc::new(reserve.iter().map(|(code, rate)| (code.clone(), rate / per_reserve)).collect());
        self.store(&base, Arc::clone(&rates));
        Ok(rates)
    }

    /// Units of `target` per one unit of `base`.
    pub async fn get_exchange_rate(
        &self,
        base: &str,
        target: &str,
        break_cache: bool,
    ) -> Result<BigRational, ExchangeRateError> {
        if self.rate_code(base) == self.rate_code(target) {
            return Ok(BigRational::one());
        }
        let rates = self.get_all_rates(base, break_cache).await?;
        let target = self.rate_code(target);
        rates.get(&target).cloned().ok_or(ExchangeRateError::RateDoesNotExist(target))
    }

    /// Converts `value` into `target` at the current rate.
    pub async fn convert(
        &self,
        value: &CurrencyValue,
        target: &CurrencyDefinition,
    ) -> Result<CurrencyValue, ExchangeRateError> {
        let rate = self.get_exchange_rate(&value.currency.code, &target.code, false).await?;
        Ok(value.convert_to(target, &rate)?)
    }
}
