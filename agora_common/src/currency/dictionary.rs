use std::{collections::HashMap, fmt::Display};

use log::*;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::currency::CurrencyError;

/// Every upstream exchange rate is quoted against this currency.
pub const RESERVE_CURRENCY_CODE: &str = "BTC";

const TESTNET_PREFIX: char = 'T';
const MAX_DIVISIBILITY: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrencyType {
    Crypto,
    Fiat,
}

impl Display for CurrencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CurrencyType::Crypto => write!(f, "crypto"),
            CurrencyType::Fiat => write!(f, "fiat"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurrencyDefinition {
    pub code: String,
    pub name: String,
    pub divisibility: u32,
    pub currency_type: CurrencyType,
    #[serde(default)]
    pub testnet: bool,
}

impl CurrencyDefinition {
    pub fn new(code: &str, name: &str, divisibility: u32, currency_type: CurrencyType) -> Self {
        Self { code: code.to_string(), name: name.to_string(), divisibility, currency_type, testnet: false }
    }

    /// The code used for exchange-rate lookups. Testnet coins trade at the price of their mainnet twin.
    pub fn base_code(&self) -> &str {
        if self.testnet {
            self.code.strip_prefix(TESTNET_PREFIX).unwrap_or(&self.code)
        } else {
            &self.code
        }
    }

    /// Compares the rate-lookup code, divisibility and type. Display names are ignored.
    pub fn equal(&self, other: &CurrencyDefinition) -> bool {
        self.base_code() == other.base_code() &&
            self.divisibility == other.divisibility &&
            self.currency_type == other.currency_type
    }

    pub fn is_valid(&self) -> bool {
        !self.code.is_empty() && self.divisibility <= MAX_DIVISIBILITY
    }

    pub fn validate(&self) -> Result<(), CurrencyError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(CurrencyError::InvalidValue(format!("invalid currency definition {self}")))
        }
    }

    fn testnet_twin(&self) -> Self {
        Self {
            code: format!("{TESTNET_PREFIX}{}", self.code),
            name: format!("Testnet {}", self.name),
            divisibility: self.divisibility,
            currency_type: self.currency_type,
            testnet: true,
        }
    }
}

impl Display for CurrencyDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}, {} decimals, {})", self.code, self.name, self.divisibility, self.currency_type)
    }
}

const DEFAULT_CURRENCIES: &[(&str, &str, u32, CurrencyType)] = &[
    ("BTC", "Bitcoin", 8, CurrencyType::Crypto),
    ("BCH", "Bitcoin Cash", 8, CurrencyType::Crypto),
    ("LTC", "Litecoin", 8, CurrencyType::Crypto),
    ("ZEC", "Zcash", 8, CurrencyType::Crypto),
    ("ETH", "Ethereum", 18, CurrencyType::Crypto),
    ("XMR", "Monero", 12, CurrencyType::Crypto),
    ("USD", "United States Dollar", 2, CurrencyType::Fiat),
    ("EUR", "Euro", 2, CurrencyType::Fiat),
    ("GBP", "Pound Sterling", 2, CurrencyType::Fiat),
    ("JPY", "Japanese Yen", 0, CurrencyType::Fiat),
    ("CAD", "Canadian Dollar", 2, CurrencyType::Fiat),
    ("AUD", "Australian Dollar", 2, CurrencyType::Fiat),
    ("CHF", "Swiss Franc", 2, CurrencyType::Fiat),
    ("CNY", "Chinese Yuan", 2, CurrencyType::Fiat),
    ("BRL", "Brazilian Real", 2, CurrencyType::Fiat),
    ("INR", "Indian Rupee", 2, CurrencyType::Fiat),
    ("KRW", "South Korean Won", 0, CurrencyType::Fiat),
    ("MXN", "Mexican Peso", 2, CurrencyType::Fiat),
    ("NZD", "New Zealand Dollar", 2, CurrencyType::Fiat),
    ("RUB", "Russian Ruble", 2, CurrencyType::Fiat),
    ("SEK", "Swedish Krona", 2, CurrencyType::Fiat),
    ("TRY", "Turkish Lira", 2, CurrencyType::Fiat),
    ("ZAR", "South African Rand", 2, CurrencyType::Fiat),
];

static GLOBAL_DICTIONARY: Lazy<CurrencyDictionary> = Lazy::new(CurrencyDictionary::default);

/// The set of currencies a node knows how to price and convert.
#[derive(Debug, Clone)]
pub struct CurrencyDictionary {
    definitions: HashMap<String, CurrencyDefinition>,
}

impl Default for CurrencyDictionary {
    fn default() -> Self {
        let defs = DEFAULT_CURRENCIES
            .iter()
            .map(|(code, name, divisibility, currency_type)| {
                CurrencyDefinition::new(code, name, *divisibility, *currency_type)
            })
            .collect::<Vec<_>>();
        Self::new(defs)
    }
}

impl CurrencyDictionary {
    pub fn new<I: IntoIterator<Item = CurrencyDefinition>>(definitions: I) -> Self {
        let definitions = definitions.into_iter().map(|d| (d.code.to_ascii_uppercase(), d)).collect();
        Self { definitions }
    }

    /// The process-wide dictionary of built-in currencies.
    pub fn global() -> &'static CurrencyDictionary {
        &GLOBAL_DICTIONARY
    }

    /// Looks up a currency code, case-insensitively.
    ///
    /// An exact match always wins (so `TRY` is the Turkish Lira). Failing that, a `T` prefix on a known crypto code
    /// yields the testnet twin of that coin.
    pub fn lookup(&self, code: &str) -> Result<CurrencyDefinition, CurrencyError> {
        let code = code.trim().to_ascii_uppercase();
        if let Some(def) = self.definitions.get(&code) {
            return Ok(def.clone());
        }
        let testnet = code
            .strip_prefix(TESTNET_PREFIX)
            .and_then(|base| self.definitions.get(base))
            .filter(|def| def.currency_type == CurrencyType::Crypto)
            .map(CurrencyDefinition::testnet_twin);
        match testnet {
            Some(def) => Ok(def),
            None => {
                trace!("💱️ Currency {code} is not in the dictionary");
                Err(CurrencyError::CurrencyDefinitionUndefined(code))
            },
        }
    }

    pub fn contains(&self, code: &str) -> bool {
        self.lookup(code).is_ok()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let dict = CurrencyDictionary::default();
        let btc = dict.lookup("btc").unwrap();
        assert_eq!(btc.code, "BTC");
        assert_eq!(btc.divisibility, 8);
        assert!(matches!(dict.lookup("DOGE2"), Err(CurrencyError::CurrencyDefinitionUndefined(_))));
    }

    #[test]
    fn testnet_lookup_mirrors_mainnet() {
        let dict = CurrencyDictionary::default();
        for code in ["BTC", "BCH", "LTC", "ZEC", "ETH"] {
            let main = dict.lookup(code).unwrap();
            let test = dict.lookup(&format!("T{code}")).unwrap();
            assert_eq!(test.base_code(), main.code);
            assert_eq!(test.divisibility, main.divisibility);
            assert_eq!(test.currency_type, main.currency_type);
            assert!(test.testnet);
            assert!(test.equal(&main));
        }
    }

    #[test]
    fn real_codes_beat_testnet_prefix() {
        let dict = CurrencyDictionary::default();
        let lira = dict.lookup("TRY").unwrap();
        assert_eq!(lira.currency_type, CurrencyType::Fiat);
        assert!(!lira.testnet);
        // Fiat currencies have no testnet twin
        assert!(dict.lookup("TUSD").is_err());
    }

    #[test]
    fn equality_ignores_names() {
        let a = CurrencyDefinition::new("BTC", "Bitcoin", 8, CurrencyType::Crypto);
        let b = CurrencyDefinition::new("BTC", "Bitcoin Core", 8, CurrencyType::Crypto);
        let c = CurrencyDefinition::new("BTC", "Bitcoin", 6, CurrencyType::Crypto);
        assert!(a.equal(&b));
        assert!(!a.equal(&c));
    }
}
