//! Argument values as they appear in a deployment file.

use std::fmt;
use std::str::FromStr;

use alloy_core::primitives::{Address, U256};
use derive_more::Deref;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::abi::{AbiValue, role_id};
use crate::error::DeployError;
use crate::plan::AddressBook;

/// A token amount or other unsigned integer.
///
/// Accepts plain integers, `0x` hex, and scientific notation with an
/// optional fractional mantissa (`1500e18`, `99.75e18`, `1000e6`), which
/// keeps 18-decimal amounts readable in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deref)]
pub struct Amount(pub U256);

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl FromStr for Amount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().replace('_', "");
        if s.is_empty() {
            return Err("empty amount".to_string());
        }

        if s.starts_with("0x") {
            return U256::from_str(&s).map(Self).map_err(|e| e.to_string());
        }

        let (mantissa, exponent) = match s.split_once(['e', 'E']) {
            Some((m, e)) => (
                m,
                e.parse::<u32>()
                    .map_err(|_| format!("invalid exponent in `{}`", s))?,
            ),
            None => (s.as_str(), 0),
        };

        let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
        let frac_part = frac_part.trim_end_matches('0');
        let frac_len = frac_part.len() as u32;
        if frac_len > exponent {
            return Err(format!("`{}` is not an integer", s));
        }

        let digits = format!("{}{}", int_part, frac_part);
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("invalid amount `{}`", s));
        }

        let base = U256::from_str(&digits).map_err(|e| e.to_string())?;
        let scale = U256::from(10u8)
            .checked_pow(U256::from(exponent - frac_len))
            .ok_or_else(|| format!("`{}` overflows uint256", s))?;
        base.checked_mul(scale)
            .map(Self)
            .ok_or_else(|| format!("`{}` overflows uint256", s))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
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
        struct AmountVisitor;

        impl de::Visitor<'_> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "an unsigned integer or a numeric string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
                Ok(Amount::from(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
                u64::try_from(v)
                    .map(Amount::from)
                    .map_err(|_| E::custom("amount must not be negative"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}

/// A constructor or call argument.
///
/// In TOML every variant is a one-key table, e.g. `{ ref = "dei" }` or
/// `{ uint = "1500e18" }`; `"deployer"` and `"admin"` are bare strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgSpec {
    /// Address of a unit, pair, or entry of `[addresses]`, by name.
    Ref(String),
    Address(Address),
    Uint(Amount),
    Bool(bool),
    String(String),
    /// An access-control role identifier, by name.
    Role(String),
    /// The signer running the deployment.
    Deployer,
    /// The final administrative identity from `[handover]`.
    Admin,
}

impl ArgSpec {
    /// The logical name this argument points at, if any.
    pub fn reference(&self) -> Option<&str> {
        match self {
            Self::Ref(name) => Some(name),
            _ => None,
        }
    }

    /// Turn the argument into a concrete value.
    ///
    /// `owner` names the unit or step the argument belongs to and is only
    /// used for error reporting.
    pub fn resolve(&self, book: &AddressBook, owner: &str) -> Result<AbiValue, DeployError> {
        let value = match self {
            Self::Ref(name) => AbiValue::Address(book.resolve(name).ok_or_else(|| {
                DeployError::UnresolvedReference {
                    unit: owner.to_string(),
                    reference: name.clone(),
                }
            })?),
            Self::Address(addr) => AbiValue::Address(*addr),
            Self::Uint(amount) => AbiValue::Uint(amount.0),
            Self::Bool(b) => AbiValue::Bool(*b),
            Self::String(s) => AbiValue::String(s.clone()),
            Self::Role(name) => AbiValue::Bytes32(role_id(name)),
            Self::Deployer => AbiValue::Address(book.deployer()),
            Self::Admin => AbiValue::Address(book.admin().ok_or_else(|| {
                DeployError::UnresolvedReference {
                    unit: owner.to_string(),
                    reference: "admin".to_string(),
                }
            })?),
        };
        Ok(value)
    }
}
