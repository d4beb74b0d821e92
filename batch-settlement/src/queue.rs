//! In-memory transaction queue
//!
//! Holds every request not currently owned by a batch. Requests keep the
//! submission position they were given at `submit`, so a requeued request is
//! claimed again in its original relative order.

use crate::types::{NewTransfer, SourceCredential, TransferRequest, TransferStatus};
use crate::{Error, Result};
use chrono::Utc;
use clearing_protocol::{parse_amount, AssetRegistry};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Default)]
struct QueueState {
    /// Pending requests keyed by submission position
    pending: BTreeMap<u64, TransferRequest>,

    /// Submission position of every live request (pending or in flight)
    positions: HashMap<Uuid, u64>,

    next_position: u64,

    /// Recently finished requests, oldest first
    recent: VecDeque<TransferRequest>,

    completed_total: u64,
    failed_total: u64,
}

/// Transaction queue
pub struct TransactionQueue {
    state: Mutex<QueueState>,
    assets: Arc<AssetRegistry>,
    recent_capacity: usize,
}

impl TransactionQueue {
    /// Create queue validating amounts against `assets`
    pub fn new(assets: Arc<AssetRegistry>, recent_capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            assets,
            recent_capacity,
        }
    }

    /// Validate and enqueue a transfer, returning its identifier
    pub fn submit(&self, transfer: NewTransfer) -> Result<Uuid> {
        let request = self.validate(transfer)?;
        let id = request.id;

        let mut state = self.state.lock();
        let position = state.next_position;
        state.next_position += 1;
        state.positions.insert(id, position);
        state.pending.insert(position, request);

        debug!("Queued request {} at position {}", id, position);
        Ok(id)
    }

    fn validate(&self, transfer: NewTransfer) -> Result<TransferRequest> {
        let recipient = transfer.recipient.trim();
        if recipient.is_empty() {
            return Err(Error::Validation("recipient is required".to_string()));
        }
        if transfer.amount.trim().is_empty() {
            return Err(Error::Validation("amount is required".to_string()));
        }

        let amount = parse_amount(&transfer.amount).map_err(|e| Error::Validation(e.to_string()))?;

        let asset = transfer.asset.trim().to_ascii_lowercase();
        if self.assets.decimals(&asset).is_none() {
            return Err(Error::Validation(format!("unknown asset '{}'", transfer.asset)));
        }
        // Admitted requests always convert at batch time
        self.assets
            .to_minor_units(&asset, amount)
            .map_err(|e| Error::Validation(e.to_string()))?;

        let source = match (transfer.source_address, transfer.source_key) {
            (Some(address), Some(key)) => Some(SourceCredential { address, key }),
            (None, None) => None,
            _ => {
                return Err(Error::Validation(
                    "source address and credential must be given together".to_string(),
                ))
            }
        };

        Ok(TransferRequest {
            id: Uuid::now_v7(),
            recipient: recipient.to_string(),
            amount,
            asset,
            user_ref: transfer.user_ref,
            token: transfer.token,
            source,
            submitted_at: Utc::now(),
            status: TransferStatus::Pending,
            attempts: 0,
            failure_reason: None,
            clearing_reference: None,
            settlement_tx: None,
        })
    }

    /// Atomically take every pending request, in submission order, as processing
    pub fn claim_pending(&self) -> Vec<TransferRequest> {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);

        pending
            .into_values()
            .map(|mut request| {
                request.status = TransferStatus::Processing;
                request.attempts += 1;
                request
            })
            .collect()
    }

    /// Return in-flight requests to pending at their original positions
    pub fn requeue(&self, requests: Vec<TransferRequest>) -> usize {
        let mut state = self.state.lock();
        let mut requeued = 0;

        for mut request in requests {
            if let Err(e) = request.transition(TransferStatus::Pending) {
                warn!("Not requeueing: {}", e);
                continue;
            }

            let position = match state.positions.get(&request.id) {
                Some(position) => *position,
                None => {
                    let position = state.next_position;
                    state.next_position += 1;
                    state.positions.insert(request.id, position);
                    position
                }
            };
            state.pending.insert(position, request);
            requeued += 1;
        }

        requeued
    }

    /// Evict finished requests into the recently-completed view
    pub fn remove(&self, finished: Vec<TransferRequest>) -> usize {
        let mut state = self.state.lock();
        let mut removed = 0;

        for request in finished {
            if !request.status.is_terminal() {
                warn!(
                    "Request {} is {}, not evicting a live request",
                    request.id, request.status
                );
                continue;
            }

            state.positions.remove(&request.id);
            match request.status {
                TransferStatus::Completed => state.completed_total += 1,
                _ => state.failed_total += 1,
            }

            if self.recent_capacity > 0 {
                if state.recent.len() == self.recent_capacity {
                    state.recent.pop_front();
                }
                state.recent.push_back(request);
            }
            removed += 1;
        }

        removed
    }

    /// Fail and evict whichever of `claimed` are still in flight
    ///
    /// Used when a batch ended without reconciling its requests; requests
    /// the batch already requeued or evicted are left alone.
    pub fn abandon(&self, claimed: Vec<TransferRequest>, reason: &str) -> usize {
        let orphaned: Vec<TransferRequest> = {
            let state = self.state.lock();
            claimed
                .into_iter()
                .filter(|r| {
                    state
                        .positions
                        .get(&r.id)
                        .is_some_and(|position| !state.pending.contains_key(position))
                })
                .collect()
        };

        let failed = orphaned
            .into_iter()
            .filter_map(|mut request| match request.fail(reason) {
                Ok(()) => Some(request),
                Err(e) => {
                    warn!("Not abandoning: {}", e);
                    None
                }
            })
            .collect();

        self.remove(failed)
    }

    /// Live pending count
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Requests owned by a batch right now
    pub fn in_flight_count(&self) -> usize {
        let state = self.state.lock();
        state.positions.len() - state.pending.len()
    }

    /// Completed requests observed this process lifetime
    pub fn completed_count(&self) -> u64 {
        self.state.lock().completed_total
    }

    /// Failed requests observed this process lifetime
    pub fn failed_count(&self) -> u64 {
        self.state.lock().failed_total
    }

    /// Snapshot of pending requests in claim order
    pub fn list_pending(&self) -> Vec<TransferRequest> {
        self.state.lock().pending.values().cloned().collect()
    }

    /// Snapshot of recently finished requests, oldest first
    pub fn recent(&self) -> Vec<TransferRequest> {
        self.state.lock().recent.iter().cloned().collect()
    }
}

impl std::fmt::Debug for TransactionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransactionQueue")
            .field("pending", &state.pending.len())
            .field("live", &state.positions.len())
            .field("recent", &state.recent.len())
            .finish()
    }
}
