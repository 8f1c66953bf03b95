//! Address activity webhook bodies

use serde::Deserialize;
use serde_json::Value;
use tokenmedia_common::{Address, Chain, TokenId};
use tracing::debug;

use crate::tasks::TokenTransfer;

/// Network names used by the webhook vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Network {
    #[serde(rename = "ETH_MAINNET")]
    EthMainnet,
    #[serde(rename = "OPT_MAINNET")]
    OptMainnet,
    #[serde(rename = "MATIC_MAINNET")]
    MaticMainnet,
    #[serde(rename = "ARB_MAINNET")]
    ArbMainnet,
    #[serde(rename = "BASE_MAINNET")]
    BaseMainnet,
    #[serde(rename = "BASE_SEPOLIA")]
    BaseSepolia,
}

impl From<Network> for Chain {
    fn from(network: Network) -> Self {
        match network {
            Network::EthMainnet => Chain::Ethereum,
            Network::OptMainnet => Chain::Optimism,
            Network::MaticMainnet => Chain::Polygon,
            Network::ArbMainnet => Chain::Arbitrum,
            Network::BaseMainnet => Chain::Base,
            Network::BaseSepolia => Chain::BaseSepolia,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawContract {
    pub address: Option<String>,
    pub raw_value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Erc1155Entry {
    pub token_id: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub from_address: String,
    pub to_address: String,
    #[serde(default)]
    pub raw_contract: Option<RawContract>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub erc721_token_id: Option<String>,
    #[serde(default)]
    pub erc1155_metadata: Option<Vec<Erc1155Entry>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivityEvent {
    pub network: Network,
    #[serde(default)]
    pub activity: Vec<Activity>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub event: ActivityEvent,
}

fn hex_amount(activity: &Activity) -> String {
    if let Some(raw) = activity.raw_contract.as_ref().and_then(|c| c.raw_value.clone()) {
        return raw;
    }
    match &activity.value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(v) => format!("{:#x}", v),
            None => n.to_string(),
        },
        _ => "0x0".to_string(),
    }
}

impl WebhookPayload {
    /// Transfers carried by the event; items with unparseable addresses are
    /// dropped, and each ERC-1155 entry becomes its own transfer.
    pub fn transfers(&self) -> Vec<TokenTransfer> {
        let chain = Chain::from(self.event.network);
        let mut transfers = Vec::new();

        for activity in &self.event.activity {
            let contract = activity.raw_contract.as_ref().and_then(|c| c.address.as_deref());
            let parsed = (
                Address::parse(&activity.from_address),
                Address::parse(&activity.to_address),
                contract.map(Address::parse),
            );
            let (Ok(from), Ok(to), Some(Ok(contract))) = parsed else {
                debug!(from = %activity.from_address, to = %activity.to_address, "Skipping activity");
                continue;
            };

            let transfer = |token_id: Option<TokenId>, amount: String| TokenTransfer {
                from: from.clone(),
                to: to.clone(),
                contract: contract.clone(),
                chain,
                amount,
                token_id,
            };

            match (&activity.erc721_token_id, &activity.erc1155_metadata) {
                (Some(id), _) => {
                    transfers.push(transfer(TokenId::parse(id).ok(), "0x1".to_string()))
                }
                (None, Some(entries)) if !entries.is_empty() => {
                    for entry in entries {
                        let amount = entry.value.clone().unwrap_or_else(|| "0x1".to_string());
                        transfers.push(transfer(TokenId::parse(&entry.token_id).ok(), amount));
                    }
                }
                _ => transfers.push(transfer(None, hex_amount(activity))),
            }
        }

        transfers
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_maps_activity_items() {
        let payload: WebhookPayload = serde_json::from_value(serde_json::json!({
            "event": {
                "network": "BASE_MAINNET",
                "activity": [
                    {
                        "fromAddress": "0x0000000000000000000000000000000000000000",
                        "toAddress": "0x00000000000000000000000000000000000000B0",
                        "rawContract": {"address": "0x00000000000000000000000000000000000000C0"},
                        "erc721TokenId": "0x2a"
                    },
                    {
                        "fromAddress": "0x00000000000000000000000000000000000000B0",
                        "toAddress": "0x00000000000000000000000000000000000000B1",
                        "rawContract": {"address": "0x00000000000000000000000000000000000000C1"},
                        "erc1155Metadata": [
                            {"tokenId": "0x1", "value": "0x3"},
                            {"tokenId": "0x2", "value": "0x1"}
                        ]
                    },
                    {
                        "fromAddress": "0x00000000000000000000000000000000000000B0",
                        "toAddress": "0x00000000000000000000000000000000000000B1",
                        "rawContract": {"address": "0x00000000000000000000000000000000000000C2", "rawValue": "0x0de0b6b3a7640000"},
                        "value": 1.0
                    },
                    {
                        "fromAddress": "not-an-address",
                        "toAddress": "0x00000000000000000000000000000000000000B1"
                    }
                ]
            }
        }))
        .unwrap();

        let transfers = payload.transfers();
        assert_eq!(transfers.len(), 4);
        assert!(transfers.iter().all(|t| t.chain == Chain::Base));
        assert_eq!(transfers[0].token_id.as_ref().unwrap().as_str(), "0x2a");
        assert_eq!(transfers[1].amount, "0x3");
        assert_eq!(transfers[2].token_id.as_ref().unwrap().as_str(), "0x2");
        assert!(transfers[3].token_id.is_none());
        assert_eq!(transfers[3].amount, "0x0de0b6b3a7640000");
    }
}
