//! Read-only status views for external polling

use crate::queue::TransactionQueue;
use crate::scheduler::SingleFlight;
use crate::types::TransferRequest;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Service status snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    /// Whether a batch is in flight
    pub in_flight: bool,
    /// Live pending requests
    pub pending_count: usize,
    /// Completed requests this process lifetime
    pub completed_count: u64,
    /// Failed requests this process lifetime
    pub failed_count: u64,
    /// Batches run
    pub batches_run: u64,
    /// Operating wallet public key (hex)
    pub wallet_identity: String,
}

/// Status reporter
#[derive(Debug, Clone)]
pub struct StatusReporter {
    queue: Arc<TransactionQueue>,
    flight: Arc<SingleFlight>,
    batches_run: Arc<AtomicU64>,
    wallet_identity: String,
}

impl StatusReporter {
    /// Create reporter over shared service state
    pub fn new(
        queue: Arc<TransactionQueue>,
        flight: Arc<SingleFlight>,
        batches_run: Arc<AtomicU64>,
        wallet_identity: String,
    ) -> Self {
        Self {
            queue,
            flight,
            batches_run,
            wallet_identity,
        }
    }

    /// Current status
    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            in_flight: self.flight.is_in_flight(),
            pending_count: self.queue.pending_count(),
            completed_count: self.queue.completed_count(),
            failed_count: self.queue.failed_count(),
            batches_run: self.batches_run.load(Ordering::Acquire),
            wallet_identity: self.wallet_identity.clone(),
        }
    }

    /// Copies of all pending requests
    pub fn list_pending(&self) -> Vec<TransferRequest> {
        self.queue.list_pending()
    }

    /// Copies of recently finished requests
    pub fn recent(&self) -> Vec<TransferRequest> {
        self.queue.recent()
    }
}
