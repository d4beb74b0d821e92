//! Outbound settlement/minting client

use crate::types::TransferRequest;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

/// Body of one settlement call
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementCall {
    /// Recipient address
    pub recipient_address: String,
    /// Decimal amount string
    pub amount: String,
    /// Request identifier, the endpoint's idempotency key
    pub tx_id: String,
    /// Token symbol
    pub token: String,
    /// Source address (fallback path only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_address: Option<String>,
    /// Source credential (fallback path only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_key: Option<String>,
    /// Originating user reference
    pub user_phone: String,
}

impl SettlementCall {
    /// Settlement of a request the clearing network confirmed
    pub fn confirmed(request: &TransferRequest) -> Self {
        Self {
            recipient_address: request.recipient.clone(),
            amount: request.amount.normalize().to_string(),
            tx_id: request.id.to_string(),
            token: request.token.clone(),
            from_address: None,
            sender_key: None,
            user_phone: request.user_ref.clone(),
        }
    }

    /// Direct settlement bypassing the clearing network
    pub fn fallback(request: &TransferRequest) -> Self {
        let mut call = Self::confirmed(request);
        if let Some(source) = &request.source {
            call.from_address = Some(source.address.clone());
            call.sender_key = Some(source.key.clone());
        }
        call
    }
}

impl std::fmt::Debug for SettlementCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementCall")
            .field("recipient_address", &self.recipient_address)
            .field("amount", &self.amount)
            .field("tx_id", &self.tx_id)
            .field("token", &self.token)
            .field("from_address", &self.from_address)
            .finish_non_exhaustive()
    }
}

/// Endpoint response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementResponse {
    /// Whether the endpoint settled the request
    pub success: bool,
    /// On-chain transaction hash
    pub tx_hash: Option<String>,
    /// Failure description
    pub error: Option<String>,
}

/// Settlement/minting endpoint
#[async_trait]
pub trait SettlementClient: Send + Sync {
    /// Settle one request; returns the transaction hash when the endpoint
    /// reports one
    async fn settle(&self, call: &SettlementCall) -> Result<Option<String>>;
}

/// HTTP settlement client
#[derive(Debug, Clone)]
pub struct HttpSettlementClient {
    endpoint: String,
    client: Client,
}

impl HttpSettlementClient {
    /// Create client with a per-request timeout
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }
}

#[async_trait]
impl SettlementClient for HttpSettlementClient {
    async fn settle(&self, call: &SettlementCall) -> Result<Option<String>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(call)
            .send()
            .await
            .map_err(|e| {
                error!("Settlement request for {} failed: {}", call.tx_id, e);
                Error::Settlement(format!("request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::Settlement(format!(
                "status {}: {}",
                status, error_text
            )));
        }

        let body = response
            .json::<SettlementResponse>()
            .await
            .map_err(|e| Error::Settlement(format!("Failed to parse response: {}", e)))?;

        if !body.success {
            return Err(Error::Settlement(
                body.error
                    .unwrap_or_else(|| "endpoint reported failure".to_string()),
            ));
        }

        info!(
            "Settled {} {} to {} (tx {})",
            call.amount,
            call.token,
            call.recipient_address,
            body.tx_hash.as_deref().unwrap_or("-")
        );

        Ok(body.tx_hash)
    }
}
