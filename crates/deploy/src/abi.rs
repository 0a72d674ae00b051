//! Minimal Solidity ABI encoding for the calls issued during a deployment.
//!
//! Only the handful of types the deployment needs are supported: `address`,
//! `uint<N>`, `bool`, `bytes32` and `string`.

use std::fmt;
use std::str::FromStr;

use alloy_core::primitives::{Address, B256, Bytes, U256, keccak256};

use crate::error::DeployError;

/// Name of the OpenZeppelin top-level administrative role.
pub const DEFAULT_ADMIN_ROLE: &str = "DEFAULT_ADMIN_ROLE";

/// A Solidity parameter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiType {
    Address,
    Uint(u16),
    Bool,
    Bytes32,
    String,
}

impl AbiType {
    fn is_dynamic(&self) -> bool {
        matches!(self, Self::String)
    }
}

impl FromStr for AbiType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "address" => Ok(Self::Address),
            "bool" => Ok(Self::Bool),
            "bytes32" => Ok(Self::Bytes32),
            "string" => Ok(Self::String),
            "uint" => Ok(Self::Uint(256)),
            other => {
                let bits = other
                    .strip_prefix("uint")
                    .and_then(|b| b.parse::<u16>().ok())
                    .filter(|b| *b > 0 && *b <= 256 && b % 8 == 0)
                    .ok_or_else(|| format!("unsupported parameter type `{}`", other))?;
                Ok(Self::Uint(bits))
            }
        }
    }
}

impl fmt::Display for AbiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address => write!(f, "address"),
            Self::Uint(bits) => write!(f, "uint{}", bits),
            Self::Bool => write!(f, "bool"),
            Self::Bytes32 => write!(f, "bytes32"),
            Self::String => write!(f, "string"),
        }
    }
}

/// A concrete argument value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiValue {
    Address(Address),
    Uint(U256),
    Bool(bool),
    Bytes32(B256),
    String(String),
}

impl AbiValue {
    pub fn abi_type(&self) -> AbiType {
        match self {
            Self::Address(_) => AbiType::Address,
            Self::Uint(_) => AbiType::Uint(256),
            Self::Bool(_) => AbiType::Bool,
            Self::Bytes32(_) => AbiType::Bytes32,
            Self::String(_) => AbiType::String,
        }
    }

    fn fits(&self, ty: AbiType) -> bool {
        match (self, ty) {
            (Self::Uint(v), AbiType::Uint(bits)) => bits == 256 || v.bit_len() <= bits as usize,
            (value, ty) => value.abi_type() == ty,
        }
    }

    fn head_word(&self) -> [u8; 32] {
        match self {
            Self::Address(addr) => address_word(*addr),
            Self::Uint(v) => v.to_be_bytes::<32>(),
            Self::Bool(b) => U256::from(*b as u8).to_be_bytes::<32>(),
            Self::Bytes32(word) => word.0,
            // Dynamic values are referenced by offset; the head is filled in by `encode`.
            Self::String(_) => [0u8; 32],
        }
    }
}

impl fmt::Display for AbiValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(addr) => write!(f, "{}", addr),
            Self::Uint(v) => write!(f, "{}", v),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Bytes32(word) => write!(f, "{}", word),
            Self::String(s) => write!(f, "{:?}", s),
        }
    }
}

/// A parsed function signature such as `setPriceBands(uint256,uint256)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSignature {
    pub name: String,
    pub params: Vec<AbiType>,
}

impl FunctionSignature {
    /// Parse a human-written signature. Whitespace is ignored and `uint` is
    /// normalised to `uint256`.
    pub fn parse(signature: &str) -> Result<Self, DeployError> {
        let invalid = |reason: &str| DeployError::InvalidCall {
            signature: signature.to_string(),
            reason: reason.to_string(),
        };

        let compact: String = signature.chars().filter(|c| !c.is_whitespace()).collect();
        let open = compact.find('(').ok_or_else(|| invalid("missing `(`"))?;
        if !compact.ends_with(')') {
            return Err(invalid("missing `)`"));
        }

        let name = &compact[..open];
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid("invalid function name"));
        }

        let inner = &compact[open + 1..compact.len() - 1];
        let params = if inner.is_empty() {
            Vec::new()
        } else {
            inner
                .split(',')
                .map(|p| p.parse::<AbiType>().map_err(|e| invalid(&e)))
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(Self {
            name: name.to_string(),
            params,
        })
    }

    /// The 4-byte function selector.
    pub fn selector(&self) -> [u8; 4] {
        selector(&self.to_string())
    }

    /// Encode a call to this function, checking arity and argument types.
    pub fn encode_call(&self, args: &[AbiValue]) -> Result<Bytes, DeployError> {
        if args.len() != self.params.len() {
            return Err(DeployError::InvalidCall {
                signature: self.to_string(),
                reason: format!("expected {} arguments, got {}", self.params.len(), args.len()),
            });
        }

        for (i, (value, ty)) in args.iter().zip(&self.params).enumerate() {
            if !value.fits(*ty) {
                return Err(DeployError::InvalidCall {
                    signature: self.to_string(),
                    reason: format!("argument {} is {} but `{}` was expected", i, value, ty),
                });
            }
        }

        let mut data = self.selector().to_vec();
        data.extend(encode(args));
        Ok(data.into())
    }
}

impl fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(|p| p.to_string()).collect();
        write!(f, "{}({})", self.name, params.join(","))
    }
}

/// Compute the selector of a canonical signature.
pub fn selector(canonical: &str) -> [u8; 4] {
    let hash = keccak256(canonical.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Encode a call from a canonical signature. Used for the fixed ERC-20,
/// router and access-control interfaces where the arguments are known to match.
pub fn encode_call(canonical: &str, args: &[AbiValue]) -> Bytes {
    let mut data = selector(canonical).to_vec();
    data.extend(encode(args));
    data.into()
}

/// ABI-encode a tuple of values (head/tail layout).
pub fn encode(values: &[AbiValue]) -> Vec<u8> {
    let head_len = values.len() * 32;
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for value in values {
        if value.abi_type().is_dynamic() {
            let offset = U256::from(head_len + tail.len());
            head.extend_from_slice(&offset.to_be_bytes::<32>());
            if let AbiValue::String(s) = value {
                tail.extend_from_slice(&U256::from(s.len()).to_be_bytes::<32>());
                tail.extend_from_slice(s.as_bytes());
                let padding = (32 - s.len() % 32) % 32;
                tail.extend(std::iter::repeat_n(0u8, padding));
            }
        } else {
            head.extend_from_slice(&value.head_word());
        }
    }

    head.extend(tail);
    head
}

/// Identifier of an access-control role.
///
/// `DEFAULT_ADMIN_ROLE` is the zero word; any other role is the keccak hash
/// of its name, which is how OpenZeppelin contracts define them.
pub fn role_id(name: &str) -> B256 {
    if name == DEFAULT_ADMIN_ROLE {
        B256::ZERO
    } else {
        keccak256(name.as_bytes())
    }
}

fn address_word(addr: Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(addr.as_slice());
    word
}

/// Read the `index`-th 32-byte word of an ABI-encoded return value.
pub fn word(data: &[u8], index: usize) -> anyhow::Result<&[u8]> {
    let start = index * 32;
    data.get(start..start + 32).ok_or_else(|| {
        anyhow::anyhow!(
            "ABI return data too short: need word {} but got {} bytes",
            index,
            data.len()
        )
    })
}

pub fn decode_address(data: &[u8]) -> anyhow::Result<Address> {
    Ok(Address::from_slice(&word(data, 0)?[12..]))
}

pub fn decode_uint(data: &[u8]) -> anyhow::Result<U256> {
    Ok(U256::from_be_slice(word(data, 0)?))
}

pub fn decode_bool(data: &[u8]) -> anyhow::Result<bool> {
    Ok(!decode_uint(data)?.is_zero())
}
