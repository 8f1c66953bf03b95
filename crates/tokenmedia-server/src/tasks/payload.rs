//! Task bodies exchanged between the dispatcher and the task handlers

use serde::{Deserialize, Serialize};
use std::fmt;
use tokenmedia_common::{Address, Chain, TokenId, TokenIdentifier};

use crate::pipeline::{Job, JobCause, JobOptionsPayload};

/// Body of `POST /tasks/media`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaTask {
    pub chain: Chain,
    pub contract: Address,
    pub token_id: TokenId,
    pub cause: JobCause,
    #[serde(default)]
    pub options: JobOptionsPayload,
}

impl MediaTask {
    pub fn new(token: TokenIdentifier, cause: JobCause) -> Self {
        Self {
            chain: token.chain,
            contract: token.contract,
            token_id: token.token_id,
            cause,
            options: JobOptionsPayload::default(),
        }
    }

    pub fn token(&self) -> TokenIdentifier {
        TokenIdentifier::new(self.chain, self.contract.clone(), self.token_id.clone())
    }

    pub fn into_job(self) -> Job {
        let token = self.token();
        Job::new(token, self.cause, self.options.into())
    }
}

/// Webhook route a transfer batch came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferEvent {
    TokenTransfer,
    PoolPublish,
    PoolActivate,
    PoolDeactivate,
    PoolRecipientCreate,
    PoolRecipientUpdate,
    PoolRecipientDelete,
    PoolOwnerUpdate,
    PoolOwnerDelete,
}

impl TransferEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferEvent::TokenTransfer => "token_transfer",
            TransferEvent::PoolPublish => "pool_publish",
            TransferEvent::PoolActivate => "pool_activate",
            TransferEvent::PoolDeactivate => "pool_deactivate",
            TransferEvent::PoolRecipientCreate => "pool_recipient_create",
            TransferEvent::PoolRecipientUpdate => "pool_recipient_update",
            TransferEvent::PoolRecipientDelete => "pool_recipient_delete",
            TransferEvent::PoolOwnerUpdate => "pool_owner_update",
            TransferEvent::PoolOwnerDelete => "pool_owner_delete",
        }
    }

    /// Events after which the pool owner's wallet no longer holds its tokens
    pub fn detaches_owner(&self) -> bool {
        matches!(self, TransferEvent::PoolDeactivate | TransferEvent::PoolOwnerDelete)
    }
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One address activity item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransfer {
    pub from: Address,
    pub to: Address,
    pub contract: Address,
    pub chain: Chain,
    /// Hex quantity as reported by the webhook
    pub amount: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<TokenId>,
}

impl TokenTransfer {
    pub fn token(&self) -> Option<TokenIdentifier> {
        self.token_id
            .clone()
            .map(|id| TokenIdentifier::new(self.chain, self.contract.clone(), id))
    }
}

/// Body of `POST /tasks/transfers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransfersTask {
    pub event: TransferEvent,
    pub transfers: Vec<TokenTransfer>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_media_task_into_job() {
        let task: MediaTask = serde_json::from_value(serde_json::json!({
            "chain": "base",
            "contract": "0x00000000000000000000000000000000000000AA",
            "token_id": "10",
            "cause": "transfer",
            "options": {"require_image": true}
        }))
        .unwrap();

        let job = task.into_job();
        assert_eq!(job.token.to_string(), "base-0x00000000000000000000000000000000000000aa-0xa");
        assert_eq!(job.cause, JobCause::Transfer);
        assert!(job.options.require_image);
    }

    #[test]
    fn test_transfer_without_token_id() {
        let transfer: TokenTransfer = serde_json::from_value(serde_json::json!({
            "from": "0x0000000000000000000000000000000000000001",
            "to": "0x0000000000000000000000000000000000000002",
            "contract": "0x0000000000000000000000000000000000000003",
            "chain": "ethereum",
            "amount": "0x1"
        }))
        .unwrap();
        assert!(transfer.token().is_none());
        assert!(TransferEvent::PoolOwnerDelete.detaches_owner());
        assert!(!TransferEvent::PoolOwnerUpdate.detaches_owner());
    }
}
