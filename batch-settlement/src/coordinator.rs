//! Settlement coordinator
//!
//! Turns clearing outcomes into settlement calls. Each request gets exactly
//! one call per batch attempt and its own independent result; the coordinator
//! never retries.

use crate::notifier::Notifier;
use crate::settlement_client::{SettlementCall, SettlementClient};
use crate::types::{TransferRequest, TransferStatus};
use std::sync::Arc;
use tracing::{info, warn};

/// Per-call results of one settle or fallback pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettlementTally {
    /// Requests settled
    pub settled: usize,
    /// Requests whose settlement call failed
    pub failed: usize,
}

/// Settlement coordinator
pub struct SettlementCoordinator {
    client: Arc<dyn SettlementClient>,
    notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for SettlementCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementCoordinator").finish_non_exhaustive()
    }
}

impl SettlementCoordinator {
    /// Create coordinator
    pub fn new(client: Arc<dyn SettlementClient>, notifier: Arc<dyn Notifier>) -> Self {
        Self { client, notifier }
    }

    /// Settle requests the clearing network confirmed
    ///
    /// Only `completed` requests are settled; a failed call moves that one
    /// request to `failed`.
    pub async fn settle<'a>(
        &self,
        requests: impl IntoIterator<Item = &'a mut TransferRequest>,
    ) -> SettlementTally {
        let mut tally = SettlementTally::default();

        for request in requests {
            if request.status != TransferStatus::Completed {
                continue;
            }

            let call = SettlementCall::confirmed(request);
            match self.client.settle(&call).await {
                Ok(tx_hash) => {
                    request.settlement_tx = tx_hash;
                    tally.settled += 1;
                }
                Err(e) => {
                    warn!("Request {}: settlement failed: {}", request.id, e);
                    if let Err(e) = request.fail(e.to_string()) {
                        warn!("{}", e);
                    }
                    tally.failed += 1;
                }
            }
            self.notify_outcome(request).await;
        }

        tally
    }

    /// Settle requests directly, bypassing the clearing network
    ///
    /// Every `processing` request ends `completed` or `failed` on its own
    /// response.
    pub async fn fallback<'a>(
        &self,
        requests: impl IntoIterator<Item = &'a mut TransferRequest>,
    ) -> SettlementTally {
        let mut tally = SettlementTally::default();

        for request in requests {
            if request.status != TransferStatus::Processing {
                continue;
            }

            let call = SettlementCall::fallback(request);
            let result = match self.client.settle(&call).await {
                Ok(tx_hash) => {
                    request.settlement_tx = tx_hash;
                    tally.settled += 1;
                    request.transition(TransferStatus::Completed)
                }
                Err(e) => {
                    warn!("Request {}: fallback settlement failed: {}", request.id, e);
                    tally.failed += 1;
                    request.fail(e.to_string())
                }
            };
            if let Err(e) = result {
                warn!("{}", e);
            }
            self.notify_outcome(request).await;
        }

        if tally.settled + tally.failed > 0 {
            info!(
                "Fallback settled {} request(s), {} failed",
                tally.settled, tally.failed
            );
        }
        tally
    }

    /// Tell users about requests the clearing network rejected
    pub async fn notify_rejected<'a>(
        &self,
        requests: impl IntoIterator<Item = &'a TransferRequest>,
    ) {
        for request in requests {
            if request.status == TransferStatus::Failed {
                self.notify_outcome(request).await;
            }
        }
    }

    async fn notify_outcome(&self, request: &TransferRequest) {
        if request.user_ref.is_empty() {
            return;
        }

        let body = match request.status {
            TransferStatus::Completed => format!(
                "Sent {} {} to {}. Tx: {}",
                request.amount.normalize(),
                request.token,
                request.recipient,
                request.settlement_tx.as_deref().unwrap_or("pending")
            ),
            TransferStatus::Failed => format!(
                "Transfer of {} {} to {} failed: {}",
                request.amount.normalize(),
                request.token,
                request.recipient,
                request.failure_reason.as_deref().unwrap_or("unknown error")
            ),
            _ => return,
        };

        // Notification failures never change the request's status
        if let Err(e) = self.notifier.notify(&request.user_ref, &body).await {
            warn!("Request {}: notification failed: {}", request.id, e);
        }
    }
}
