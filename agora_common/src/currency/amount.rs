use std::{
    fmt::Display,
    iter::Sum,
    ops::{Add, AddAssign, Neg, Sub, SubAssign},
    str::FromStr,
};

use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{currency::CurrencyError, op};

//--------------------------------------       Amount        ---------------------------------------------------------
/// An integer number of the smallest unit of some currency (satoshi, cent, wei, ...).
///
/// Amounts are unbounded. On the wire and in the database they are written as base-10 strings, since several of the
/// supported currencies overflow 64 bits.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(BigInt);

op!(binary Amount, Add, add);
op!(binary Amount, Sub, sub);
op!(inplace Amount, AddAssign, add_assign);
op!(inplace Amount, SubAssign, sub_assign);
op!(unary Amount, Neg, neg);

impl Amount {
    pub fn new(value: BigInt) -> Self {
        Self(value)
    }

    pub fn zero() -> Self {
        Self(BigInt::zero())
    }

    pub fn value(&self) -> &BigInt {
        &self.0
    }

    pub fn into_inner(self) -> BigInt {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_negative()
    }

    pub fn is_positive(&self) -> bool {
        self.0.is_positive()
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self(BigInt::from(value))
    }
}

impl From<i64> for Amount {
    fn from(value: i64) -> Self {
        Self(BigInt::from(value))
    }
}

impl From<BigInt> for Amount {
    fn from(value: BigInt) -> Self {
        Self(value)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), Add::add)
    }
}

impl<'a> Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Amount>>(iter: I) -> Self {
        iter.fold(Self::zero(), |acc, v| acc + v.clone())
    }
}

impl FromStr for Amount {
    type Err = CurrencyError;

    /// Only plain base-10 integers are accepted. A decimal point means the caller has not converted to the smallest
    /// unit, which is a precision fault rather than a formatting one.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains('.') {
            return Err(CurrencyError::InsufficientPrecision(s.to_string()));
        }
        BigInt::from_str(s).map(Self).map_err(|e| CurrencyError::InvalidValue(format!("{s}: {e}")))
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Amount::from_str(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn arithmetic() {
        let a = Amount::from(1000u64);
        let b = Amount::from(250u64);
        assert_eq!(a.clone() - b.clone(), Amount::from(750u64));
        assert_eq!(a.clone() + b.clone(), Amount::from(1250u64));
        let mut c = a.clone();
        c -= b.clone();
        c += Amount::from(1u64);
        assert_eq!(c, Amount::from(751u64));
        assert!((-a).is_negative());
        let total: Amount = [b.clone(), b.clone(), b].iter().sum();
        assert_eq!(total, Amount::from(750u64));
    }

    #[test]
    fn parsing() {
        let big = "123456789012345678901234567890";
        assert_eq!(big.parse::<Amount>().unwrap().to_string(), big);
        assert!(matches!("1.5".parse::<Amount>(), Err(CurrencyError::InsufficientPrecision(_))));
        assert!(matches!("abc".parse::<Amount>(), Err(CurrencyError::InvalidValue(_))));
    }

    #[test]
    fn json_uses_strings() {
        let a = Amount::from(42u64);
        assert_eq!(serde_json::to_string(&a).unwrap(), "\"42\"");
        let b: Amount = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(a, b);
    }
}
