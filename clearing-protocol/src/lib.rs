//! Clearing Protocol
//!
//! Client side of the off-chain clearing network: one short-lived duplex
//! connection per batch, a challenge-response handshake that authorizes an
//! ephemeral session key, then one signed transfer instruction per order.
//!
//! # Architecture
//!
//! ```text
//! ClearingClient::run(batch)
//!        │
//!        │ Connector::connect()           (scoped: closed on every exit)
//!        ▼
//! ┌──────────────────────────────────────────────────────┐
//! │ ClearingSession (one per batch)                      │
//! │ connecting → authenticating → authenticated          │
//! │           → transferring → draining → closed         │
//! │                                                      │
//! │ handle(ServerMessage) -> Vec<ClientMessage>          │
//! └──────────────────────────────────────────────────────┘
//!        │
//!        ▼
//! ClearingReport { confirmed, rejected, unresolved, outcome }
//! ```
//!
//! # Invariants
//!
//! - Instructions are sent in claim order, each carrying a unique nonce
//! - Confirmations are correlated by nonce, never by arrival order
//! - Informational and unknown message kinds never count as confirmations
//! - Amounts are converted to integer minor units with exact decimal arithmetic

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod amount;
pub mod client;
pub mod crypto;
pub mod error;
pub mod message;
pub mod mock;
pub mod session;
pub mod transport;

// Re-exports
pub use amount::{from_minor_units, parse_amount, to_minor_units, AssetRegistry};
pub use client::{ClearingClient, ClearingOutcome, ClearingReport};
pub use crypto::{KeyPair, KeyProvider, RandomKeyProvider, SeededKeyProvider};
pub use error::{Error, Result};
pub use message::{ClientMessage, ServerMessage};
pub use session::{ClearingSession, SessionConfig, SessionState, TransferOrder};
pub use transport::{Connection, Connector, WsConnector};
