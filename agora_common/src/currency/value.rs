use std::{cmp::Ordering, fmt::Display};

use num_bigint::BigInt;
use num_integer::Integer;
use num_rational::BigRational;
use num_traits::{Signed, Zero};
use serde::{Deserialize, Serialize};

use crate::currency::{rational::power_of_ten, Amount, CurrencyDefinition, CurrencyDictionary, CurrencyError};

/// An amount of money: a count of smallest units in a given currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyValue {
    pub amount: Amount,
    pub currency: CurrencyDefinition,
}

impl CurrencyValue {
    pub fn new<A: Into<Amount>>(amount: A, currency: CurrencyDefinition) -> Self {
        Self { amount: amount.into(), currency }
    }

    pub fn zero(currency: CurrencyDefinition) -> Self {
        Self { amount: Amount::zero(), currency }
    }

    /// Builds a value from a smallest-unit string and a currency code resolved through `dict`.
    pub fn from_str_amount(amount: &str, code: &str, dict: &CurrencyDictionary) -> Result<Self, CurrencyError> {
        let currency = dict.lookup(code)?;
        let amount = amount.parse::<Amount>()?;
        Ok(Self { amount, currency })
    }

    /// Converts this value into `target` at `rate`, where `rate` is the number of whole `target` units bought by one
    /// whole unit of this value's currency.
    ///
    /// `amount × rate × 10^(target.divisibility − self.divisibility)`, truncated toward zero.
    pub fn convert_to(&self, target: &CurrencyDefinition, rate: &BigRational) -> Result<CurrencyValue, CurrencyError> {
        if !rate.is_positive() {
            return Err(CurrencyError::NegativeRate);
        }
        if !self.currency.is_valid() {
            return Err(CurrencyError::InvalidValue(format!("source currency {} is not defined", self.currency.code)));
        }
        if !target.is_valid() {
            return Err(CurrencyError::InvalidValue(format!("target currency {} is not defined", target.code)));
        }
        let shift = i64::from(target.divisibility) - i64::from(self.currency.divisibility);
        let exact = BigRational::from_integer(self.amount.value().clone()) * rate * power_of_ten(shift);
        let amount = exact.trunc().to_integer();
        Ok(CurrencyValue { amount: Amount::new(amount), currency: target.clone() })
    }

    pub fn checked_add(&self, other: &CurrencyValue) -> Result<CurrencyValue, CurrencyError> {
        self.ensure_same_currency(other)?;
        Ok(CurrencyValue { amount: self.amount.clone() + other.amount.clone(), currency: self.currency.clone() })
    }

    pub fn checked_sub(&self, other: &CurrencyValue) -> Result<CurrencyValue, CurrencyError> {
        self.ensure_same_currency(other)?;
        Ok(CurrencyValue { amount: self.amount.clone() - other.amount.clone(), currency: self.currency.clone() })
    }

    /// Multiplies by an integer quantity, e.g. a line-item count.
    pub fn times(&self, quantity: u64) -> CurrencyValue {
        let amount = self.amount.value() * BigInt::from(quantity);
        CurrencyValue { amount: Amount::new(amount), currency: self.currency.clone() }
    }

    pub fn compare(&self, other: &CurrencyValue) -> Result<Ordering, CurrencyError> {
        self.ensure_same_currency(other)?;
        Ok(self.amount.cmp(&other.amount))
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.amount.is_negative()
    }

    fn ensure_same_currency(&self, other: &CurrencyValue) -> Result<(), CurrencyError> {
        if self.currency.equal(&other.currency) {
            Ok(())
        } else {
            Err(CurrencyError::CurrencyMismatch(self.currency.code.clone(), other.currency.code.clone()))
        }
    }
}

impl Display for CurrencyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let div = self.currency.divisibility as usize;
        if div == 0 {
            return write!(f, "{} {}", self.amount, self.currency.code);
        }
        let value = self.amount.value();
        let scale = num_traits::pow(BigInt::from(10u8), div);
        let (whole, frac) = value.abs().div_rem(&scale);
        let sign = if value.is_negative() { "-" } else { "" };
        let frac = frac.to_string();
        write!(f, "{sign}{whole}.{frac:0>div$} {}", self.currency.code)
    }
}
