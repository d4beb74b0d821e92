//! Core types for batch settlement

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use clearing_protocol::{KeyPair, TransferOrder};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// Transfer request status
///
/// Transitions: pending → processing → {completed, failed}; processing →
/// pending on requeue; completed → failed when settlement fails post-hoc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Waiting in the queue
    Pending,
    /// Claimed by an in-flight batch
    Processing,
    /// Cleared and settled
    Completed,
    /// Rejected by the network or the settlement endpoint
    Failed,
}

impl TransferStatus {
    /// Completed or failed
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }

    /// Whether `self → next` is allowed
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Pending)
                | (Completed, Failed)
        )
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Processing => "processing",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Source address/credential pair, used only by the fallback path
#[derive(Clone, Serialize)]
pub struct SourceCredential {
    /// Source address
    pub address: String,

    /// Signing credential for the source address
    #[serde(skip_serializing)]
    pub key: String,
}

impl std::fmt::Debug for SourceCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceCredential")
            .field("address", &self.address)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Submission input
#[derive(Clone, Default, Deserialize)]
pub struct NewTransfer {
    /// Recipient address
    pub recipient: String,
    /// Decimal amount string
    pub amount: String,
    /// Originating user reference (phone number)
    pub user_ref: String,
    /// Settlement asset code
    pub asset: String,
    /// Token symbol minted on settlement
    pub token: String,
    /// Optional fallback source address
    pub source_address: Option<String>,
    /// Optional fallback source credential
    pub source_key: Option<String>,
}

impl std::fmt::Debug for NewTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewTransfer")
            .field("recipient", &self.recipient)
            .field("amount", &self.amount)
            .field("user_ref", &self.user_ref)
            .field("asset", &self.asset)
            .field("token", &self.token)
            .field("source_address", &self.source_address)
            .finish_non_exhaustive()
    }
}

impl NewTransfer {
    /// Minimal submission
    pub fn new(
        recipient: impl Into<String>,
        amount: impl Into<String>,
        user_ref: impl Into<String>,
        asset: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            amount: amount.into(),
            user_ref: user_ref.into(),
            asset: asset.into(),
            token: token.into(),
            source_address: None,
            source_key: None,
        }
    }

    /// Attach the fallback source pair
    pub fn with_source(mut self, address: impl Into<String>, key: impl Into<String>) -> Self {
        self.source_address = Some(address.into());
        self.source_key = Some(key.into());
        self
    }
}

/// The unit of work
#[derive(Debug, Clone, Serialize)]
pub struct TransferRequest {
    /// Unique identifier, assigned at submission
    pub id: Uuid,

    /// Recipient address
    pub recipient: String,

    /// Amount
    pub amount: Decimal,

    /// Settlement asset code
    pub asset: String,

    /// Originating user reference
    pub user_ref: String,

    /// Token symbol
    pub token: String,

    /// Fallback source pair
    pub source: Option<SourceCredential>,

    /// Submission timestamp
    pub submitted_at: DateTime<Utc>,

    /// Current status
    pub status: TransferStatus,

    /// Number of batches that claimed this request
    pub attempts: u32,

    /// Last failure reason
    pub failure_reason: Option<String>,

    /// Clearing network reference, once confirmed
    pub clearing_reference: Option<String>,

    /// Settlement transaction hash, once settled
    pub settlement_tx: Option<String>,
}

impl TransferRequest {
    /// Move to `next`, enforcing the status state machine
    pub fn transition(&mut self, next: TransferStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::Other(format!(
                "Request {}: invalid transition {} → {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Mark failed with a reason
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(TransferStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Clearing order for this request
    pub fn to_order(&self) -> TransferOrder {
        TransferOrder {
            request_id: self.id,
            destination: self.recipient.clone(),
            asset: self.asset.clone(),
            amount: self.amount,
        }
    }
}

/// One clearing attempt
#[derive(Debug)]
pub struct Batch {
    /// Monotonic sequence number
    pub sequence: u64,

    /// Ephemeral session key; taken by the clearing connection and dropped
    /// with it
    pub session_key: Option<KeyPair>,

    /// Claimed requests, in claim order
    pub requests: Vec<TransferRequest>,

    /// Instructions sent
    pub instructions_sent: usize,

    /// Confirmations and errors received
    pub outcomes_received: usize,

    /// Clearing deadline
    pub deadline: Instant,
}

impl Batch {
    /// Create batch over claimed requests
    pub fn new(
        sequence: u64,
        session_key: KeyPair,
        requests: Vec<TransferRequest>,
        deadline: Instant,
    ) -> Self {
        Self {
            sequence,
            session_key: Some(session_key),
            requests,
            instructions_sent: 0,
            outcomes_received: 0,
            deadline,
        }
    }

    /// Mutable access to a claimed request
    pub fn request_mut(&mut self, id: Uuid) -> Option<&mut TransferRequest> {
        self.requests.iter_mut().find(|r| r.id == id)
    }

    /// Requests currently in `status`
    pub fn count(&self, status: TransferStatus) -> usize {
        self.requests.iter().filter(|r| r.status == status).count()
    }
}

/// What happened to one batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    /// Batch sequence number
    pub sequence: u64,
    /// Requests claimed
    pub claimed: usize,
    /// Instructions sent to the clearing network
    pub instructions_sent: usize,
    /// Confirmations and transfer errors received
    pub outcomes_received: usize,
    /// Requests completed
    pub completed: usize,
    /// Requests failed
    pub failed: usize,
    /// Requests returned to pending
    pub requeued: usize,
    /// Whether the fallback path ran
    pub fallback_used: bool,
    /// Clearing outcome label
    pub clearing_outcome: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use TransferStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Pending));
        assert!(Completed.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_credentials_redacted() {
        let transfer = NewTransfer::new("0xabc", "1", "+15550100", "usdc", "TXTC")
            .with_source("0xsrc", "super-secret");
        assert!(!format!("{:?}", transfer).contains("super-secret"));

        let credential = SourceCredential {
            address: "0xsrc".to_string(),
            key: "super-secret".to_string(),
        };
        assert!(!format!("{:?}", credential).contains("super-secret"));
        assert!(!serde_json::to_string(&credential).unwrap().contains("super-secret"));
    }
}
