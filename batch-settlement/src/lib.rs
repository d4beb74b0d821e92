//! Batch Settlement
//!
//! Accumulates transfer requests, clears them in batches through the
//! off-chain clearing network and settles the results, with a direct
//! settlement fallback when the network cannot be used.
//!
//! # Architecture
//!
//! ```text
//! submit() ──▶ TransactionQueue ◀── StatusReporter (status, list_pending)
//!                    │
//!      tick ──▶ BatchService::tick   (single flight)
//!                    │ claim_pending
//!                    ▼
//!              ClearingClient::run ──▶ clearing network
//!                    │ ClearingReport
//!                    ▼
//!          SettlementCoordinator ──▶ settlement endpoint, SMS
//!                    │
//!          requeue / remove ──▶ TransactionQueue
//! ```
//!
//! # Outcome policy
//!
//! - Transfer-level rejections fail only their request
//! - Authentication failure settles every claimed request through fallback
//! - Connection loss settles confirmed requests and sends the rest to
//!   fallback (or back to the queue, per configuration)
//! - A deadline with instructions outstanding requeues the unresolved ones
//!
//! # Example
//!
//! ```no_run
//! use batch_settlement::{BatchService, Config, IntervalTicks, NewTransfer, Scheduler};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> batch_settlement::Result<()> {
//!     let config = Config::from_env()?;
//!     let interval = config.window.interval();
//!     let service = Arc::new(BatchService::from_config(config)?);
//!
//!     service.submit(NewTransfer::new("0xabc", "5", "+15550100", "usdc", "TXTC"))?;
//!
//!     let scheduler = Scheduler::start(service.clone(), IntervalTicks::new(interval));
//!     tokio::signal::ctrl_c().await?;
//!     scheduler.stop().await
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod notifier;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod settlement_client;
pub mod status;
pub mod types;

// Re-exports
pub use config::Config;
pub use coordinator::{SettlementCoordinator, SettlementTally};
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use notifier::{NoopNotifier, Notifier, TwilioNotifier};
pub use queue::TransactionQueue;
pub use scheduler::{
    IntervalTicks, ManualTicker, ManualTicks, Scheduler, SingleFlight, TickOutcome, TickSource,
};
pub use service::{BatchService, Dependencies};
pub use settlement_client::{HttpSettlementClient, SettlementCall, SettlementClient};
pub use status::{ServiceStatus, StatusReporter};
pub use types::*;
