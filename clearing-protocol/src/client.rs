//! Per-batch driver for the clearing network
//!
//! `ClearingClient::run` opens a connection, feeds every inbound frame to the
//! batch's `ClearingSession` and writes whatever the session answers, until
//! the session is drained, a batch-fatal error occurs, or the deadline
//! elapses. The connection is closed on every one of those exits.

use crate::amount::AssetRegistry;
use crate::crypto::KeyPair;
use crate::message::ClientMessage;
use crate::session::{ClearingSession, SessionConfig, SessionState, TransferOrder};
use crate::transport::{Connection, Connector};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// Upper bound on the close handshake
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// How a batch's clearing attempt ended
#[derive(Debug)]
pub enum ClearingOutcome {
    /// Every sent instruction was confirmed or rejected
    Drained,
    /// Authentication or connection failure
    Fatal(Error),
    /// Deadline elapsed with outcomes outstanding
    TimedOut,
}

impl ClearingOutcome {
    /// Short label for logs and summaries
    pub fn label(&self) -> &'static str {
        match self {
            ClearingOutcome::Drained => "drained",
            ClearingOutcome::Fatal(Error::Authentication(_)) => "authentication_failed",
            ClearingOutcome::Fatal(_) => "connection_failed",
            ClearingOutcome::TimedOut => "timed_out",
        }
    }
}

/// Result of one batch's clearing attempt
#[derive(Debug)]
pub struct ClearingReport {
    /// Batch sequence number
    pub sequence: u64,
    /// How the attempt ended
    pub outcome: ClearingOutcome,
    /// Instructions written to the connection
    pub instructions_sent: usize,
    /// Confirmations and transfer errors received
    pub accounted: usize,
    /// Confirmed requests with network reference
    pub confirmed: Vec<(Uuid, Option<String>)>,
    /// Rejected requests with reason
    pub rejected: Vec<(Uuid, String)>,
    /// Requests with no outcome, in claim order
    pub unresolved: Vec<Uuid>,
}

impl ClearingReport {
    fn from_session(session: &ClearingSession, outcome: ClearingOutcome) -> Self {
        Self {
            sequence: session.sequence(),
            outcome,
            instructions_sent: session.instructions_sent(),
            accounted: session.accounted(),
            confirmed: session.confirmed(),
            rejected: session.rejected(),
            unresolved: session.unresolved(),
        }
    }
}

/// Clearing network client shared by all batches
pub struct ClearingClient {
    connector: Arc<dyn Connector>,
    wallet: Arc<KeyPair>,
    assets: Arc<AssetRegistry>,
    config: SessionConfig,
}

impl std::fmt::Debug for ClearingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClearingClient")
            .field("wallet", &self.wallet.public_key_hex())
            .field("assets", &self.assets.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ClearingClient {
    /// Create client
    pub fn new(
        connector: Arc<dyn Connector>,
        wallet: Arc<KeyPair>,
        assets: Arc<AssetRegistry>,
        config: SessionConfig,
    ) -> Self {
        Self {
            connector,
            wallet,
            assets,
            config,
        }
    }

    /// Long-lived wallet identity (hex public key)
    pub fn wallet_identity(&self) -> String {
        self.wallet.public_key_hex()
    }

    /// Clear one batch
    ///
    /// Never returns an error: failures are reported through
    /// [`ClearingReport::outcome`] with per-request results alongside.
    pub async fn run(
        &self,
        sequence: u64,
        session_key: KeyPair,
        orders: Vec<TransferOrder>,
        deadline: Instant,
    ) -> ClearingReport {
        let mut session = ClearingSession::new(
            sequence,
            self.wallet.clone(),
            session_key,
            self.config.clone(),
            &self.assets,
            orders,
        );

        info!(
            "Batch {}: connecting with session key {}",
            sequence,
            session.session_public_key()
        );

        let outcome = match timeout_at(deadline, self.connector.connect()).await {
            Err(_) => ClearingOutcome::TimedOut,
            Ok(Err(e)) if e.is_batch_fatal() => ClearingOutcome::Fatal(e),
            Ok(Err(e)) => ClearingOutcome::Fatal(Error::Connection(e.to_string())),
            Ok(Ok(mut connection)) => {
                let result = timeout_at(deadline, drive(&mut session, connection.as_mut())).await;

                if timeout(CLOSE_GRACE, connection.close()).await.is_err() {
                    warn!("Batch {}: close handshake timed out", sequence);
                }

                match result {
                    Ok(Ok(())) => ClearingOutcome::Drained,
                    Ok(Err(e)) => ClearingOutcome::Fatal(e),
                    Err(_) => ClearingOutcome::TimedOut,
                }
            }
        };

        session.close();
        let report = ClearingReport::from_session(&session, outcome);

        match &report.outcome {
            ClearingOutcome::Drained => info!(
                "Batch {}: drained ({} confirmed, {} rejected)",
                sequence,
                report.confirmed.len(),
                report.rejected.len()
            ),
            ClearingOutcome::Fatal(e) => warn!(
                "Batch {}: clearing failed after {} instructions: {}",
                sequence, report.instructions_sent, e
            ),
            ClearingOutcome::TimedOut => warn!(
                "Batch {}: deadline elapsed with {} unresolved",
                sequence,
                report.unresolved.len()
            ),
        }

        report
    }
}

async fn drive(session: &mut ClearingSession, connection: &mut dyn Connection) -> Result<()> {
    let opener = session.on_connected()?;
    connection.send(&opener).await?;

    loop {
        if session.is_drained() {
            return Ok(());
        }

        let message = connection
            .recv()
            .await?
            .ok_or_else(|| Error::Connection("connection closed by peer".to_string()))?;

        for outbound in session.handle(message)? {
            connection.send(&outbound).await?;
            if let ClientMessage::Transfer(instruction) = &outbound {
                session.mark_sent(instruction.nonce);
            }
        }

        if session.state() == SessionState::Transferring {
            session.begin_draining();
        }
    }
}
