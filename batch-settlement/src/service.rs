//! Batch settlement service
//!
//! Ties the queue, the clearing client and the settlement coordinator
//! together. One service object per deployment; every collaborator is
//! injected through [`Dependencies`].

use crate::config::Config;
use crate::coordinator::SettlementCoordinator;
use crate::metrics::Metrics;
use crate::notifier::{NoopNotifier, Notifier, TwilioNotifier};
use crate::queue::TransactionQueue;
use crate::scheduler::{SingleFlight, TickOutcome};
use crate::settlement_client::{HttpSettlementClient, SettlementClient};
use crate::status::{ServiceStatus, StatusReporter};
use crate::types::{Batch, BatchSummary, NewTransfer, TransferRequest, TransferStatus};
use crate::{Error, Result};
use clearing_protocol::mock::{MockConnector, MockScript};
use clearing_protocol::{
    ClearingClient, ClearingOutcome, ClearingReport, Connector, KeyPair, KeyProvider,
    RandomKeyProvider, WsConnector,
};
use futures_util::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Collaborators of the service
pub struct Dependencies {
    /// Clearing network connector
    pub connector: Arc<dyn Connector>,

    /// Settlement/minting endpoint
    pub settlement: Arc<dyn SettlementClient>,

    /// Outcome notifier
    pub notifier: Arc<dyn Notifier>,

    /// Session key source
    pub keys: Arc<dyn KeyProvider>,

    /// Long-lived wallet key
    pub wallet: Arc<KeyPair>,
}

impl std::fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependencies")
            .field("wallet", &self.wallet)
            .finish_non_exhaustive()
    }
}

impl Dependencies {
    /// Production wiring from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let wallet = match &config.wallet.seed_hex {
            Some(seed) => KeyPair::from_seed_hex(seed)
                .map_err(|e| Error::Config(format!("wallet seed: {}", e)))?,
            None => {
                warn!("No wallet seed configured, using an ephemeral wallet key");
                KeyPair::generate()
            }
        };

        let connector: Arc<dyn Connector> = if config.clearing.mock_enabled {
            warn!("Clearing network mock enabled, transfers are not cleared for real");
            Arc::new(MockConnector::new(MockScript::default()))
        } else {
            Arc::new(WsConnector::new(config.clearing.endpoint.clone()))
        };

        let settlement = HttpSettlementClient::new(
            config.settlement.endpoint.clone(),
            Duration::from_secs(config.settlement.timeout_seconds),
        )?;

        let notifier: Arc<dyn Notifier> = if config.notifications.enabled {
            Arc::new(TwilioNotifier::new(&config.notifications)?)
        } else {
            Arc::new(NoopNotifier)
        };

        Ok(Self {
            connector,
            settlement: Arc::new(settlement),
            notifier,
            keys: Arc::new(RandomKeyProvider),
            wallet: Arc::new(wallet),
        })
    }
}

/// Batch settlement service
pub struct BatchService {
    config: Config,
    queue: Arc<TransactionQueue>,
    clearing: ClearingClient,
    coordinator: SettlementCoordinator,
    keys: Arc<dyn KeyProvider>,
    flight: Arc<SingleFlight>,
    sequence: AtomicU64,
    batches_run: Arc<AtomicU64>,
    reporter: StatusReporter,
    metrics: Metrics,
}

impl std::fmt::Debug for BatchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchService")
            .field("queue", &self.queue)
            .field("clearing", &self.clearing)
            .field("in_flight", &self.flight.is_in_flight())
            .finish_non_exhaustive()
    }
}

impl BatchService {
    /// Create service with injected collaborators
    pub fn new(config: Config, deps: Dependencies) -> Result<Self> {
        config.validate()?;

        let assets = Arc::new(config.clearing.asset_registry()?);
        let queue = Arc::new(TransactionQueue::new(
            assets.clone(),
            config.queue.recent_capacity,
        ));
        let clearing = ClearingClient::new(
            deps.connector,
            deps.wallet,
            assets,
            config.clearing.session_config(),
        );
        let coordinator = SettlementCoordinator::new(deps.settlement, deps.notifier);

        let flight = Arc::new(SingleFlight::new());
        let batches_run = Arc::new(AtomicU64::new(0));
        let reporter = StatusReporter::new(
            queue.clone(),
            flight.clone(),
            batches_run.clone(),
            clearing.wallet_identity(),
        );

        info!(
            "Batch service ready: wallet {}, window {}s",
            clearing.wallet_identity(),
            config.window.interval_seconds
        );

        Ok(Self {
            config,
            queue,
            clearing,
            coordinator,
            keys: deps.keys,
            flight,
            sequence: AtomicU64::new(0),
            batches_run,
            reporter,
            metrics: Metrics::new()?,
        })
    }

    /// Create service with production wiring
    pub fn from_config(config: Config) -> Result<Self> {
        let deps = Dependencies::from_config(&config)?;
        Self::new(config, deps)
    }

    /// Queue a transfer
    pub fn submit(&self, transfer: NewTransfer) -> Result<Uuid> {
        let id = self.queue.submit(transfer)?;
        self.metrics.submitted_total.inc();
        self.metrics.set_pending(self.queue.pending_count());
        Ok(id)
    }

    /// Start a batch unless one is in flight or nothing is pending
    pub fn tick(self: &Arc<Self>) -> TickOutcome {
        let Some(guard) = self.flight.try_acquire() else {
            return TickOutcome::InFlight;
        };

        let requests = self.queue.claim_pending();
        if requests.is_empty() {
            return TickOutcome::Idle;
        }

        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        self.batches_run.fetch_add(1, Ordering::AcqRel);
        self.metrics.batches_total.inc();
        self.metrics.set_pending(self.queue.pending_count());

        let deadline = Instant::now() + self.config.window.batch_timeout();
        let batch = Batch::new(sequence, self.keys.session_key(sequence), requests, deadline);
        let claimed = batch.requests.len();

        info!("Batch {}: claimed {} request(s)", sequence, claimed);

        let claimed_requests = batch.requests.clone();
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _guard = guard;
            match AssertUnwindSafe(service.run_batch(batch)).catch_unwind().await {
                Ok(summary) => summary,
                Err(_) => service.abort_batch(sequence, claimed_requests),
            }
        });

        TickOutcome::Started {
            sequence,
            claimed,
            handle,
        }
    }

    /// Clear, settle and reconcile one batch
    ///
    /// Never fails: every claimed request ends completed, failed, or back in
    /// the queue as pending.
    pub async fn run_batch(&self, mut batch: Batch) -> BatchSummary {
        let started = Instant::now();
        let sequence = batch.sequence;
        let claimed = batch.requests.len();
        let session_key = batch
            .session_key
            .take()
            .unwrap_or_else(|| self.keys.session_key(sequence));
        let orders = batch.requests.iter().map(TransferRequest::to_order).collect();

        let report = self
            .clearing
            .run(sequence, session_key, orders, batch.deadline)
            .await;
        batch.instructions_sent = report.instructions_sent;
        batch.outcomes_received = report.accounted;

        apply_clearing_results(&mut batch, &report);

        let rejected: HashSet<Uuid> = report.rejected.iter().map(|(id, _)| *id).collect();
        let rejected: Vec<&TransferRequest> = batch
            .requests
            .iter()
            .filter(|r| rejected.contains(&r.id))
            .collect();
        self.coordinator.notify_rejected(rejected).await;

        let settled = self.coordinator.settle(batch.requests.iter_mut()).await;
        if settled.failed > 0 {
            warn!(
                "Batch {}: {} confirmed request(s) failed settlement",
                sequence, settled.failed
            );
        }

        let fallback_ids = self.fallback_set(&report);
        let fallback_used = !fallback_ids.is_empty();
        if fallback_used {
            warn!(
                "Batch {}: {} ({}), settling {} request(s) through fallback",
                sequence,
                report.outcome.label(),
                outcome_detail(&report.outcome),
                fallback_ids.len()
            );
            self.metrics.fallback_total.inc();
            let targets: Vec<&mut TransferRequest> = batch
                .requests
                .iter_mut()
                .filter(|r| fallback_ids.contains(&r.id))
                .collect();
            self.coordinator.fallback(targets).await;
        }

        let completed = batch.count(TransferStatus::Completed);
        let failed = batch.count(TransferStatus::Failed);

        // Whatever is still processing was never resolved
        let (unresolved, finished): (Vec<_>, Vec<_>) = batch
            .requests
            .drain(..)
            .partition(|r| r.status == TransferStatus::Processing);
        let requeued = self.queue.requeue(unresolved);
        self.queue.remove(finished);

        self.metrics.completed_total.inc_by(completed as u64);
        self.metrics.failed_total.inc_by(failed as u64);
        self.metrics.requeued_total.inc_by(requeued as u64);
        self.metrics.set_pending(self.queue.pending_count());
        self.metrics
            .batch_duration
            .observe(started.elapsed().as_secs_f64());

        let summary = BatchSummary {
            sequence,
            claimed,
            instructions_sent: batch.instructions_sent,
            outcomes_received: batch.outcomes_received,
            completed,
            failed,
            requeued,
            fallback_used,
            clearing_outcome: report.outcome.label().to_string(),
        };

        info!(
            "Batch {} closed: {} completed, {} failed, {} requeued{}",
            sequence,
            completed,
            failed,
            requeued,
            if fallback_used { " (fallback)" } else { "" }
        );

        summary
    }

    /// Reconcile a batch whose task panicked
    ///
    /// Requests still owned by the batch are failed rather than requeued: a
    /// settlement call may already have gone out for them.
    fn abort_batch(&self, sequence: u64, claimed: Vec<TransferRequest>) -> BatchSummary {
        let claimed_count = claimed.len();
        let failed = self.queue.abandon(claimed, "batch aborted");

        error!(
            "Batch {} aborted: {} in-flight request(s) failed",
            sequence, failed
        );

        self.metrics.failed_total.inc_by(failed as u64);
        self.metrics.set_pending(self.queue.pending_count());

        BatchSummary {
            sequence,
            claimed: claimed_count,
            instructions_sent: 0,
            outcomes_received: 0,
            completed: 0,
            failed,
            requeued: 0,
            fallback_used: false,
            clearing_outcome: "aborted".to_string(),
        }
    }

    /// Requests to settle directly, bypassing the clearing network
    fn fallback_set(&self, report: &ClearingReport) -> HashSet<Uuid> {
        let no_progress = report.instructions_sent == 0;
        let fallback = match &report.outcome {
            ClearingOutcome::Drained => false,
            ClearingOutcome::Fatal(clearing_protocol::Error::Authentication(_)) => true,
            ClearingOutcome::Fatal(_) => {
                no_progress || self.config.clearing.fallback_on_connection_loss
            }
            ClearingOutcome::TimedOut => no_progress,
        };

        if fallback {
            report.unresolved.iter().copied().collect()
        } else {
            HashSet::new()
        }
    }

    /// Status snapshot
    pub fn status(&self) -> ServiceStatus {
        self.reporter.status()
    }

    /// Copies of all pending requests
    pub fn list_pending(&self) -> Vec<TransferRequest> {
        self.reporter.list_pending()
    }

    /// Copies of recently finished requests
    pub fn recent(&self) -> Vec<TransferRequest> {
        self.reporter.recent()
    }

    /// Service configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Metrics collectors
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

fn apply_clearing_results(batch: &mut Batch, report: &ClearingReport) {
    for (id, reference) in &report.confirmed {
        if let Some(request) = batch.request_mut(*id) {
            request.clearing_reference = reference.clone();
            if let Err(e) = request.transition(TransferStatus::Completed) {
                warn!("{}", e);
            }
        }
    }

    for (id, reason) in &report.rejected {
        if let Some(request) = batch.request_mut(*id) {
            warn!("Request {}: rejected by clearing network: {}", id, reason);
            if let Err(e) = request.fail(reason.clone()) {
                warn!("{}", e);
            }
        }
    }
}

fn outcome_detail(outcome: &ClearingOutcome) -> String {
    match outcome {
        ClearingOutcome::Fatal(e) => e.to_string(),
        ClearingOutcome::TimedOut => "deadline elapsed".to_string(),
        ClearingOutcome::Drained => "drained".to_string(),
    }
}
