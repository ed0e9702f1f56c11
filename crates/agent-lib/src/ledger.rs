//! Resource ledgers
//!
//! A ledger maps a resource name (`cpu`, `memory`, `nvidia.com/gpu`, ...) to a
//! quantity held in milli-units. Quantities parse from and serialize to the
//! Kubernetes quantity notation so ledgers travel over the wire in the same
//! shape the cluster API reports them.

use crate::error::QuantityError;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::str::FromStr;

/// Largest decimal exponent accepted in `1e<n>` notation
const MAX_EXPONENT: i32 = 18;

/// Longest digit run accepted in the numeric part of a quantity
const MAX_DIGITS: usize = 30;

/// A resource quantity in milli-units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity(i64);

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);

    pub fn from_milli(milli: i64) -> Self {
        Self(milli)
    }

    pub fn from_units(units: i64) -> Self {
        Self(units.saturating_mul(1000))
    }

    /// Value in milli-units (`500m` cpu is 500, `1Ki` memory is 1_024_000)
    pub fn milli_value(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

enum Scale {
    Decimal(i32),
    Binary(u32),
}

fn parse_suffix(quantity: &str, suffix: &str) -> Result<Scale, QuantityError> {
    let scale = match suffix {
        "" => Scale::Decimal(0),
        "n" => Scale::Decimal(-9),
        "u" => Scale::Decimal(-6),
        "m" => Scale::Decimal(-3),
        "k" => Scale::Decimal(3),
        "M" => Scale::Decimal(6),
        "G" => Scale::Decimal(9),
        "T" => Scale::Decimal(12),
        "P" => Scale::Decimal(15),
        "E" => Scale::Decimal(18),
        "Ki" => Scale::Binary(10),
        "Mi" => Scale::Binary(20),
        "Gi" => Scale::Binary(30),
        "Ti" => Scale::Binary(40),
        "Pi" => Scale::Binary(50),
        "Ei" => Scale::Binary(60),
        other if other.len() > 1 && (other.starts_with('e') || other.starts_with('E')) => {
            let exponent: i32 = other[1..]
                .parse()
                .map_err(|_| QuantityError::Invalid(quantity.to_string()))?;
            if exponent.abs() > MAX_EXPONENT {
                return Err(QuantityError::OutOfRange(quantity.to_string()));
            }
            Scale::Decimal(exponent)
        }
        other => {
            return Err(QuantityError::UnknownSuffix {
                quantity: quantity.to_string(),
                suffix: other.to_string(),
            })
        }
    };
    Ok(scale)
}

impl FromStr for Quantity {
    type Err = QuantityError;

    /// Parse Kubernetes quantity notation, rounding up to the next milli-unit
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(QuantityError::Empty);
        }

        let (negative, body) = match s.as_bytes()[0] {
            b'-' => (true, &s[1..]),
            b'+' => (false, &s[1..]),
            _ => (false, s),
        };

        let number_len = body
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(body.len());
        let (number, suffix) = body.split_at(number_len);

        let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
        if frac_part.contains('.') || (int_part.is_empty() && frac_part.is_empty()) {
            return Err(QuantityError::Invalid(s.to_string()));
        }

        let digits = format!("{int_part}{frac_part}");
        if digits.len() > MAX_DIGITS {
            return Err(QuantityError::OutOfRange(s.to_string()));
        }
        let mantissa: i128 = digits
            .parse()
            .map_err(|_| QuantityError::Invalid(s.to_string()))?;

        let out_of_range = || QuantityError::OutOfRange(s.to_string());

        // value = mantissa / 10^frac * scale, held as num / den in milli-units
        let mut num = mantissa.checked_mul(1000).ok_or_else(out_of_range)?;
        let mut den = 10i128
            .checked_pow(frac_part.len() as u32)
            .ok_or_else(out_of_range)?;

        match parse_suffix(s, suffix)? {
            Scale::Decimal(p) if p >= 0 => {
                num = num
                    .checked_mul(10i128.pow(p as u32))
                    .ok_or_else(out_of_range)?;
            }
            Scale::Decimal(p) => {
                den = den
                    .checked_mul(10i128.pow(p.unsigned_abs()))
                    .ok_or_else(out_of_range)?;
            }
            Scale::Binary(shift) => {
                num = num.checked_mul(1i128 << shift).ok_or_else(out_of_range)?;
            }
        }

        let milli = (num + den - 1) / den;
        let milli = i64::try_from(milli).map_err(|_| out_of_range())?;

        Ok(Quantity(if negative { -milli } else { milli }))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) {
        *self = *self + rhs;
    }
}

impl Sub for Quantity {
    type Output = Quantity;

    fn sub(self, rhs: Quantity) -> Quantity {
        Quantity(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for Quantity {
    fn sub_assign(&mut self, rhs: Quantity) {
        *self = *self - rhs;
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct QuantityVisitor;

impl<'de> Visitor<'de> for QuantityVisitor {
    type Value = Quantity;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a kubernetes quantity string or an integer")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Quantity, E> {
        v.parse().map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Quantity, E> {
        Ok(Quantity::from_units(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Quantity, E> {
        let units = i64::try_from(v).map_err(E::custom)?;
        Ok(Quantity::from_units(units))
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(QuantityVisitor)
    }
}

/// Mapping from resource name to quantity
///
/// Arithmetic is key-wise. No non-negativity invariant is enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceLedger(BTreeMap<String, Quantity>);

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ledger from quantity strings, e.g. `[("cpu", "500m")]`
    pub fn parse<'a, I>(entries: I) -> Result<Self, QuantityError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        entries
            .into_iter()
            .map(|(name, quantity)| Ok((name.to_string(), quantity.parse()?)))
            .collect()
    }

    pub fn insert(&mut self, name: impl Into<String>, quantity: Quantity) {
        self.0.insert(name.into(), quantity);
    }

    pub fn get(&self, name: &str) -> Option<Quantity> {
        self.0.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Quantity)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Sum any number of ledgers
    pub fn sum<'a>(ledgers: impl IntoIterator<Item = &'a ResourceLedger>) -> ResourceLedger {
        let mut total = ResourceLedger::new();
        for ledger in ledgers {
            total += ledger;
        }
        total
    }
}

impl FromIterator<(String, Quantity)> for ResourceLedger {
    fn from_iter<T: IntoIterator<Item = (String, Quantity)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl AddAssign<&ResourceLedger> for ResourceLedger {
    /// Sum keys present in both; copy keys only present in `rhs`
    fn add_assign(&mut self, rhs: &ResourceLedger) {
        for (name, quantity) in &rhs.0 {
            self.0
                .entry(name.clone())
                .and_modify(|q| *q += *quantity)
                .or_insert(*quantity);
        }
    }
}

impl SubAssign<&ResourceLedger> for ResourceLedger {
    /// Subtract keys present in both; keys missing from `self` are not created
    fn sub_assign(&mut self, rhs: &ResourceLedger) {
        for (name, quantity) in &rhs.0 {
            if let Some(q) = self.0.get_mut(name) {
                *q -= *quantity;
            }
        }
    }
}

impl Add<&ResourceLedger> for &ResourceLedger {
    type Output = ResourceLedger;

    fn add(self, rhs: &ResourceLedger) -> ResourceLedger {
        let mut out = self.clone();
        out += rhs;
        out
    }
}

impl Sub<&ResourceLedger> for &ResourceLedger {
    type Output = ResourceLedger;

    fn sub(self, rhs: &ResourceLedger) -> ResourceLedger {
        let mut out = self.clone();
        out -= rhs;
        out
    }
}

/// Allocation rate per resource name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceRate(BTreeMap<String, f64>);

impl ResourceRate {
    /// Compute `requested / capacity` for every resource in `capacity`
    ///
    /// Resources with zero capacity are omitted. Resources missing from
    /// `requested` report 0. Overcommit yields rates above 1.
    pub fn calculate(capacity: &ResourceLedger, requested: &ResourceLedger) -> Self {
        let mut rates = BTreeMap::new();
        for (name, cap) in capacity.iter() {
            if cap.is_zero() {
                continue;
            }
            let rate = match requested.get(name) {
                Some(req) => req.milli_value() as f64 / cap.milli_value() as f64,
                None => 0.0,
            };
            rates.insert(name.to_string(), rate);
        }
        Self(rates)
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
