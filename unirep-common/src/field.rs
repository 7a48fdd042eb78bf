//! Field elements of the BN254 scalar field.
//!
//! Every value the protocol moves around (leaves, roots, epoch keys,
//! nullifiers, public signals) is an element of this field. The canonical
//! text encoding is the decimal string (this is what lands in the database
//! and in persisted `publicSignals`/`proof` blobs); the canonical binary
//! encoding is the 32-byte big-endian word used by the event ABI.

use std::fmt;
use std::str::FromStr;

use num_bigint::BigUint;
use num_traits::{Num, One, Zero};
use once_cell::sync::Lazy;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Order of the BN254 scalar field.
const MODULUS_DEC: &str =
    "21888242871839275222246405745257275088548364400416034343698204186575808495617";

static MODULUS: Lazy<BigUint> = Lazy::new(|| {
    BigUint::from_str_radix(MODULUS_DEC, 10).expect("modulus literal is valid decimal")
});

/// Errors produced when parsing external field-element encodings.
#[derive(Debug, Error)]
pub enum FieldError {
    #[error("invalid decimal field element '{0}'")]
    InvalidDecimal(String),
    #[error("value does not fit in {0} bits")]
    Overflow(usize),
}

/// An element of the BN254 scalar field, always kept reduced.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Field(BigUint);

impl Field {
    pub fn zero() -> Self {
        Field(BigUint::zero())
    }

    pub fn one() -> Self {
        Field(BigUint::one())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// The field order, exposed for range checks.
    pub fn modulus() -> &'static BigUint {
        &MODULUS
    }

    /// Reduce an arbitrary big-endian byte string into the field.
    pub fn from_be_bytes_reduced(bytes: &[u8]) -> Self {
        Field(BigUint::from_bytes_be(bytes) % &*MODULUS)
    }

    /// Parse the canonical decimal encoding. Values are reduced, so any
    /// non-negative decimal integer is accepted.
    pub fn from_decimal(s: &str) -> Result<Self, FieldError> {
        let n = BigUint::from_str_radix(s.trim(), 10)
            .map_err(|_| FieldError::InvalidDecimal(s.to_string()))?;
        Ok(Field(n % &*MODULUS))
    }

    /// The canonical decimal encoding.
    pub fn to_decimal(&self) -> String {
        self.0.to_str_radix(10)
    }

    /// The 32-byte big-endian ABI word.
    pub fn to_word(&self) -> [u8; 32] {
        let bytes = self.0.to_bytes_be();
        let mut word = [0u8; 32];
        word[32 - bytes.len()..].copy_from_slice(&bytes);
        word
    }

    /// Keep the low `bits` bits, dropping the rest. Used to truncate epoch
    /// keys to the epoch-tree depth.
    pub fn truncate_bits(&self, bits: usize) -> Self {
        let mask = (BigUint::one() << bits) - BigUint::one();
        Field(&self.0 & mask)
    }

    /// Bit `i` (little-endian), for sparse-tree path derivation.
    pub fn bit(&self, i: usize) -> bool {
        self.0.bit(i as u64)
    }

    /// Convert to `u64`, failing when the value does not fit. Tree keys and
    /// epoch numbers travel as field elements but index into 64-bit spaces.
    pub fn to_u64(&self) -> Result<u64, FieldError> {
        let digits = self.0.to_u64_digits();
        match digits.len() {
            0 => Ok(0),
            1 => Ok(digits[0]),
            _ => Err(FieldError::Overflow(64)),
        }
    }
}

impl std::ops::Add<&Field> for &Field {
    type Output = Field;

    fn add(self, rhs: &Field) -> Field {
        Field((&self.0 + &rhs.0) % &*MODULUS)
    }
}

impl std::ops::AddAssign<&Field> for Field {
    fn add_assign(&mut self, rhs: &Field) {
        self.0 = (&self.0 + &rhs.0) % &*MODULUS;
    }
}

impl From<u64> for Field {
    fn from(v: u64) -> Self {
        Field(BigUint::from(v))
    }
}

impl From<u32> for Field {
    fn from(v: u32) -> Self {
        Field(BigUint::from(v))
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_decimal())
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Field({})", self.to_decimal())
    }
}

impl FromStr for Field {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Field::from_decimal(s)
    }
}

impl Serialize for Field {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_decimal())
    }
}

impl<'de> Deserialize<'de> for Field {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Field::from_decimal(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_round_trip() {
        let f = Field::from(123456789u64);
        let s = f.to_decimal();
        assert_eq!(Field::from_decimal(&s).unwrap(), f);
    }

    #[test]
    fn parse_reduces_modulo_order() {
        // modulus + 5 reduces to 5
        let big = format!("{}", Field::modulus() + 5u32);
        assert_eq!(Field::from_decimal(&big).unwrap(), Field::from(5u64));
    }

    #[test]
    fn word_is_big_endian_padded() {
        let f = Field::from(0x0102u64);
        let w = f.to_word();
        assert_eq!(w[30], 0x01);
        assert_eq!(w[31], 0x02);
        assert!(w[..30].iter().all(|b| *b == 0));
        assert_eq!(Field::from_be_bytes_reduced(&w), f);
    }

    #[test]
    fn truncate_keeps_low_bits() {
        let f = Field::from(0b1011_0110u64);
        assert_eq!(f.truncate_bits(4), Field::from(0b0110u64));
    }

    #[test]
    fn serde_uses_decimal_strings() {
        let f = Field::from(42u64);
        let json = serde_json::to_string(&f).unwrap();
        assert_eq!(json, "\"42\"");
        let back: Field = serde_json::from_str(&json).unwrap();
        assert_eq!(back, f);
    }
}
