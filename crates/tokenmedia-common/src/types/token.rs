use serde::{Deserialize, Serialize};
use std::fmt;

use super::Chain;
use crate::error::{Result, TokenMediaError};

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Lowercase `0x`-prefixed 20-byte hex address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let hex = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TokenMediaError::InvalidAddress(raw.to_string()));
        }

        Ok(Self(format!("0x{}", hex.to_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0[2..].bytes().all(|b| b == b'0')
    }
}

impl TryFrom<String> for Address {
    type Error = TokenMediaError;

    fn try_from(value: String) -> Result<Self> {
        Address::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token id in canonical form: lowercase hex, `0x` prefix, no leading zeros
///
/// Unprefixed input is read as decimal, matching how token ids appear in
/// metadata and indexer responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TokenId(String);

impl TokenId {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let hex = if let Some(hex) = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(TokenMediaError::InvalidTokenId(raw.to_string()));
            }
            hex.to_lowercase()
        } else {
            if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
                return Err(TokenMediaError::InvalidTokenId(raw.to_string()));
            }
            decimal_to_hex(trimmed)
        };

        let stripped = hex.trim_start_matches('0');
        let canonical = if stripped.is_empty() { "0" } else { stripped };
        Ok(Self(format!("0x{canonical}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex digits without the `0x` prefix
    pub fn hex_digits(&self) -> &str {
        &self.0[2..]
    }
}

impl TryFrom<String> for TokenId {
    type Error = TokenMediaError;

    fn try_from(value: String) -> Result<Self> {
        TokenId::parse(&value)
    }
}

impl From<TokenId> for String {
    fn from(value: TokenId) -> Self {
        value.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Long division of a decimal digit string by 16; handles uint256-sized ids.
fn decimal_to_hex(decimal: &str) -> String {
    let mut digits: Vec<u32> = decimal.bytes().map(|b| u32::from(b - b'0')).collect();
    let mut out = Vec::new();

    while !digits.is_empty() {
        let mut remainder = 0u32;
        let mut quotient = Vec::with_capacity(digits.len());
        for digit in digits {
            let acc = remainder * 10 + digit;
            let q = acc / 16;
            remainder = acc % 16;
            if !(quotient.is_empty() && q == 0) {
                quotient.push(q);
            }
        }
        out.push(HEX_DIGITS[remainder as usize]);
        digits = quotient;
    }

    if out.is_empty() {
        return "0".to_string();
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// `(chain, contract, token id)`; identity is triple equality
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenIdentifier {
    pub chain: Chain,
    pub contract: Address,
    pub token_id: TokenId,
}

impl TokenIdentifier {
    pub fn new(chain: Chain, contract: Address, token_id: TokenId) -> Self {
        Self {
            chain,
            contract,
            token_id,
        }
    }

    pub fn parse(chain: Chain, contract: &str, token_id: &str) -> Result<Self> {
        Ok(Self::new(chain, Address::parse(contract)?, TokenId::parse(token_id)?))
    }

    /// Key used for the at-most-one-in-flight lock
    pub fn lock_key(&self) -> String {
        format!("token-processing:{self}")
    }
}

impl fmt::Display for TokenIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.chain, self.contract, self.token_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_address_normalizes_case_and_prefix() {
        let a = Address::parse("0xABCDEF0000000000000000000000000000000001").unwrap();
        let b = Address::parse("abcdef0000000000000000000000000000000001").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "0xabcdef0000000000000000000000000000000001");
    }

    #[test]
    fn test_address_rejects_bad_input() {
        assert!(Address::parse("0x1234").is_err());
        assert!(Address::parse("0xZZCDEF0000000000000000000000000000000001").is_err());
    }

    #[test]
    fn test_zero_address() {
        let zero = Address::parse("0x0000000000000000000000000000000000000000").unwrap();
        assert!(zero.is_zero());
    }

    #[test]
    fn test_token_id_decimal_and_hex_agree() {
        assert_eq!(TokenId::parse("255").unwrap(), TokenId::parse("0xFF").unwrap());
        assert_eq!(TokenId::parse("0x00ff").unwrap().as_str(), "0xff");
        assert_eq!(TokenId::parse("0").unwrap().as_str(), "0x0");
        assert_eq!(TokenId::parse("0x0000").unwrap().as_str(), "0x0");
    }

    #[test]
    fn test_token_id_uint256_decimal() {
        // 2^128
        let id = TokenId::parse("340282366920938463463374607431768211456").unwrap();
        assert_eq!(id.as_str(), "0x100000000000000000000000000000000");
    }

    #[test]
    fn test_token_id_rejects_garbage() {
        assert!(TokenId::parse("").is_err());
        assert!(TokenId::parse("12a").is_err());
        assert!(TokenId::parse("0x").is_err());
    }

    #[test]
    fn test_identifier_equality_uses_canonical_parts() {
        let a = TokenIdentifier::parse(
            Chain::Base,
            "0xAAAA000000000000000000000000000000000000",
            "16",
        )
        .unwrap();
        let b = TokenIdentifier::parse(
            Chain::Base,
            "0xaaaa000000000000000000000000000000000000",
            "0x10",
        )
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "base-0xaaaa000000000000000000000000000000000000-0x10");
    }

    #[test]
    fn test_identifier_deserializes_and_normalizes() {
        let json = r#"{"chain":"ethereum","contract":"0xAAAA000000000000000000000000000000000000","token_id":"10"}"#;
        let tid: TokenIdentifier = serde_json::from_str(json).unwrap();
        assert_eq!(tid.token_id.as_str(), "0xa");
        assert_eq!(tid.contract.as_str(), "0xaaaa000000000000000000000000000000000000");
    }
}
