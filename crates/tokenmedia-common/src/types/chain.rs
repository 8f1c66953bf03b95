use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TokenMediaError;

/// Chains the pipeline can process tokens for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Chain {
    Ethereum,
    Optimism,
    Polygon,
    Arbitrum,
    Base,
    BaseSepolia,
}

impl Chain {
    pub const ALL: [Chain; 6] = [
        Chain::Ethereum,
        Chain::Optimism,
        Chain::Polygon,
        Chain::Arbitrum,
        Chain::Base,
        Chain::BaseSepolia,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Optimism => "optimism",
            Chain::Polygon => "polygon",
            Chain::Arbitrum => "arbitrum",
            Chain::Base => "base",
            Chain::BaseSepolia => "base-sepolia",
        }
    }

    /// EVM chain id
    pub fn chain_id(&self) -> u64 {
        match self {
            Chain::Ethereum => 1,
            Chain::Optimism => 10,
            Chain::Polygon => 137,
            Chain::Arbitrum => 42161,
            Chain::Base => 8453,
            Chain::BaseSepolia => 84532,
        }
    }

    /// Suffix used by per-chain environment variables, e.g. `ALCHEMY_ETH_API_URL`
    pub fn env_suffix(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ETH",
            Chain::Optimism => "OPTIMISM",
            Chain::Polygon => "POLYGON",
            Chain::Arbitrum => "ARBITRUM",
            Chain::Base => "BASE",
            Chain::BaseSepolia => "BASE_SEPOLIA",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = TokenMediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        let chain = match normalized.as_str() {
            "ethereum" | "eth" | "1" => Chain::Ethereum,
            "optimism" | "op" | "10" => Chain::Optimism,
            "polygon" | "matic" | "137" => Chain::Polygon,
            "arbitrum" | "arb" | "42161" => Chain::Arbitrum,
            "base" | "8453" => Chain::Base,
            "base-sepolia" | "84532" => Chain::BaseSepolia,
            _ => return Err(TokenMediaError::InvalidChain(s.to_string())),
        };
        Ok(chain)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names_and_ids() {
        assert_eq!("Ethereum".parse::<Chain>().unwrap(), Chain::Ethereum);
        assert_eq!("base_sepolia".parse::<Chain>().unwrap(), Chain::BaseSepolia);
        assert_eq!("137".parse::<Chain>().unwrap(), Chain::Polygon);
        assert!("solana".parse::<Chain>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for chain in Chain::ALL {
            assert_eq!(chain.to_string().parse::<Chain>().unwrap(), chain);
        }
    }

    #[test]
    fn test_serde_uses_kebab_case() {
        let json = serde_json::to_string(&Chain::BaseSepolia).unwrap();
        assert_eq!(json, "\"base-sepolia\"");
    }
}
