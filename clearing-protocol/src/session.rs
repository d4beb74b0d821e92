//! Per-batch protocol state machine
//!
//! A `ClearingSession` owns the instructions of one batch and advances through
//!
//! ```text
//! connecting → authenticating → authenticated → transferring → draining → closed
//! ```
//!
//! All inbound traffic enters through [`ClearingSession::handle`], which
//! returns the frames to send next. The session performs no I/O, so every
//! transition can be exercised without a network.

use crate::amount::AssetRegistry;
use crate::crypto::KeyPair;
use crate::message::{Allowance, AuthRequest, AuthVerify, ClientMessage, ServerMessage, TransferInstruction};
use crate::{Error, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the duplex connection to open
    Connecting,
    /// Auth request sent, waiting for challenge / verification
    Authenticating,
    /// Handshake accepted
    Authenticated,
    /// Instructions being sent
    Transferring,
    /// All instructions sent, waiting for outcomes
    Draining,
    /// Connection released
    Closed,
}

/// Handshake parameters shared by every session of a client
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Application name registered with the network
    pub application: String,

    /// Scope requested for the session key
    pub scope: String,

    /// Session key lifetime
    pub session_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            application: "batch-settlement".to_string(),
            scope: "transfer".to_string(),
            session_ttl: Duration::from_secs(3600),
        }
    }
}

/// A transfer to be cleared, in the caller's terms
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOrder {
    /// Originating request
    pub request_id: Uuid,
    /// Recipient address
    pub destination: String,
    /// Asset code
    pub asset: String,
    /// Human amount
    pub amount: Decimal,
}

/// Per-instruction accounting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstructionStatus {
    /// Not yet written to the connection
    Unsent,
    /// Written, outcome pending
    Sent,
    /// Confirmed by the network
    Confirmed {
        /// Network reference, when provided
        reference: Option<String>,
    },
    /// Rejected by the network, or never sendable
    Rejected {
        /// Reason
        reason: String,
    },
}

#[derive(Debug)]
struct Instruction {
    nonce: u64,
    order: TransferOrder,
    minor_units: Option<u128>,
    status: InstructionStatus,
}

/// State machine for one batch on one connection
pub struct ClearingSession {
    sequence: u64,
    state: SessionState,
    wallet: Arc<KeyPair>,
    session_key: KeyPair,
    config: SessionConfig,
    instructions: Vec<Instruction>,
    by_nonce: HashMap<u64, usize>,
    sent: usize,
    accounted: usize,
}

impl std::fmt::Debug for ClearingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClearingSession")
            .field("sequence", &self.sequence)
            .field("state", &self.state)
            .field("instructions", &self.instructions.len())
            .field("sent", &self.sent)
            .field("accounted", &self.accounted)
            .finish_non_exhaustive()
    }
}

impl ClearingSession {
    /// Create a session for `orders`, kept in claim order
    ///
    /// Orders whose amount cannot be expressed in the asset's minor units are
    /// rejected up front and never sent.
    pub fn new(
        sequence: u64,
        wallet: Arc<KeyPair>,
        session_key: KeyPair,
        config: SessionConfig,
        assets: &AssetRegistry,
        orders: Vec<TransferOrder>,
    ) -> Self {
        let mut instructions = Vec::with_capacity(orders.len());
        let mut by_nonce = HashMap::with_capacity(orders.len());

        for (index, order) in orders.into_iter().enumerate() {
            let nonce = index as u64 + 1;
            let (minor_units, status) = match assets.to_minor_units(&order.asset, order.amount) {
                Ok(units) => (Some(units), InstructionStatus::Unsent),
                Err(e) => {
                    warn!(
                        "Batch {}: request {} cannot be instructed: {}",
                        sequence, order.request_id, e
                    );
                    (
                        None,
                        InstructionStatus::Rejected {
                            reason: e.to_string(),
                        },
                    )
                }
            };
            by_nonce.insert(nonce, index);
            instructions.push(Instruction {
                nonce,
                order,
                minor_units,
                status,
            });
        }

        Self {
            sequence,
            state: SessionState::Connecting,
            wallet,
            session_key,
            config,
            instructions,
            by_nonce,
            sent: 0,
            accounted: 0,
        }
    }

    /// Batch sequence number
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Session public key (hex)
    pub fn session_public_key(&self) -> String {
        self.session_key.public_key_hex()
    }

    /// Connection opened: produce the auth request
    pub fn on_connected(&mut self) -> Result<ClientMessage> {
        if self.state != SessionState::Connecting {
            return Err(Error::InvalidState(format!(
                "connected while {:?}",
                self.state
            )));
        }

        // Allowance per asset is the batch total in minor units
        let mut totals: BTreeMap<String, u128> = BTreeMap::new();
        for instruction in &self.instructions {
            if let Some(units) = instruction.minor_units {
                *totals
                    .entry(instruction.order.asset.to_ascii_lowercase())
                    .or_default() += units;
            }
        }

        let ttl = chrono::Duration::from_std(self.config.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(1));

        let request = AuthRequest {
            address: self.wallet.public_key_hex(),
            session_key: self.session_key.public_key_hex(),
            application: self.config.application.clone(),
            scope: self.config.scope.clone(),
            allowances: totals
                .into_iter()
                .map(|(asset, amount)| Allowance {
                    asset,
                    amount: amount.to_string(),
                })
                .collect(),
            expires_at: (Utc::now() + ttl).timestamp(),
        };

        self.state = SessionState::Authenticating;
        debug!("Batch {}: authenticating", self.sequence);

        Ok(ClientMessage::AuthRequest(request))
    }

    /// Single dispatch entry point for inbound frames
    ///
    /// Returns the frames to send in response. An `Err` is batch-fatal.
    pub fn handle(&mut self, message: ServerMessage) -> Result<Vec<ClientMessage>> {
        if message.is_informational() {
            debug!(
                "Batch {}: ignoring informational {} message",
                self.sequence,
                message.kind()
            );
            return Ok(Vec::new());
        }

        match (self.state, message) {
            (SessionState::Closed, message) => Err(Error::InvalidState(format!(
                "{} received after close",
                message.kind()
            ))),

            (SessionState::Authenticating, ServerMessage::AuthChallenge { challenge }) => {
                let signature = self.wallet.sign_hex(challenge.as_bytes());
                Ok(vec![ClientMessage::AuthVerify(AuthVerify {
                    challenge,
                    signature,
                })])
            }

            (SessionState::Authenticating, ServerMessage::AuthVerified { .. }) => {
                self.state = SessionState::Authenticated;
                info!(
                    "Batch {}: session key {} authenticated",
                    self.sequence,
                    self.session_key.public_key_hex()
                );
                self.begin_transfers()
            }

            (
                SessionState::Connecting | SessionState::Authenticating,
                ServerMessage::Error { message },
            ) => Err(Error::Authentication(message)),

            (
                SessionState::Transferring | SessionState::Draining,
                ServerMessage::TransferConfirmed { nonce, reference },
            ) => {
                self.resolve(nonce, InstructionStatus::Confirmed { reference });
                Ok(Vec::new())
            }

            (
                SessionState::Transferring | SessionState::Draining,
                ServerMessage::TransferError { nonce, reason },
            ) => {
                warn!(
                    "Batch {}: instruction {} rejected: {}",
                    self.sequence, nonce, reason
                );
                self.resolve(nonce, InstructionStatus::Rejected { reason });
                Ok(Vec::new())
            }

            (_, ServerMessage::Error { message }) => Err(Error::Connection(message)),

            (state, message) => {
                warn!(
                    "Batch {}: unexpected {} while {:?}, ignoring",
                    self.sequence,
                    message.kind(),
                    state
                );
                Ok(Vec::new())
            }
        }
    }

    /// Build one signed instruction per sendable order, in claim order
    fn begin_transfers(&mut self) -> Result<Vec<ClientMessage>> {
        self.state = SessionState::Transferring;

        let mut outbound = Vec::with_capacity(self.instructions.len());
        for instruction in &self.instructions {
            let (InstructionStatus::Unsent, Some(units)) =
                (&instruction.status, instruction.minor_units)
            else {
                continue;
            };

            let amount = units.to_string();
            let payload = TransferInstruction::signing_bytes(
                instruction.nonce,
                &instruction.order.destination,
                &instruction.order.asset,
                &amount,
            )?;

            outbound.push(ClientMessage::Transfer(TransferInstruction {
                nonce: instruction.nonce,
                destination: instruction.order.destination.clone(),
                asset: instruction.order.asset.clone(),
                amount,
                signature: self.session_key.sign_hex(&payload),
            }));
        }

        Ok(outbound)
    }

    fn resolve(&mut self, nonce: u64, outcome: InstructionStatus) {
        let Some(&index) = self.by_nonce.get(&nonce) else {
            warn!("Batch {}: outcome for unknown nonce {}", self.sequence, nonce);
            return;
        };

        let instruction = &mut self.instructions[index];
        match instruction.status {
            InstructionStatus::Sent => {
                instruction.status = outcome;
                self.accounted += 1;
            }
            InstructionStatus::Unsent => {
                warn!(
                    "Batch {}: outcome for unsent instruction {}, ignoring",
                    self.sequence, nonce
                );
            }
            _ => {
                debug!("Batch {}: duplicate outcome for {}", self.sequence, nonce);
            }
        }
    }

    /// Record that the instruction with `nonce` was written to the connection
    pub fn mark_sent(&mut self, nonce: u64) {
        if let Some(&index) = self.by_nonce.get(&nonce) {
            let instruction = &mut self.instructions[index];
            if instruction.status == InstructionStatus::Unsent {
                instruction.status = InstructionStatus::Sent;
                self.sent += 1;
            }
        }
    }

    /// Every instruction has been sent; only outcomes remain
    pub fn begin_draining(&mut self) {
        if self.state == SessionState::Transferring {
            self.state = SessionState::Draining;
            debug!(
                "Batch {}: draining {} outstanding",
                self.sequence,
                self.sent - self.accounted
            );
        }
    }

    /// All sent instructions are accounted for
    pub fn is_drained(&self) -> bool {
        self.state == SessionState::Draining && self.accounted == self.sent
    }

    /// Release the session
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Instructions written to the connection
    pub fn instructions_sent(&self) -> usize {
        self.sent
    }

    /// Confirmations and transfer errors received
    pub fn accounted(&self) -> usize {
        self.accounted
    }

    /// Confirmed requests with their network reference
    pub fn confirmed(&self) -> Vec<(Uuid, Option<String>)> {
        self.instructions
            .iter()
            .filter_map(|i| match &i.status {
                InstructionStatus::Confirmed { reference } => {
                    Some((i.order.request_id, reference.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Rejected requests with reason
    pub fn rejected(&self) -> Vec<(Uuid, String)> {
        self.instructions
            .iter()
            .filter_map(|i| match &i.status {
                InstructionStatus::Rejected { reason } => Some((i.order.request_id, reason.clone())),
                _ => None,
            })
            .collect()
    }

    /// Requests with no outcome (unsent or awaiting confirmation), in claim order
    pub fn unresolved(&self) -> Vec<Uuid> {
        self.instructions
            .iter()
            .filter(|i| {
                matches!(
                    i.status,
                    InstructionStatus::Unsent | InstructionStatus::Sent
                )
            })
            .map(|i| i.order.request_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::verify_signature;
    use rust_decimal_macros::dec;

    fn registry() -> AssetRegistry {
        AssetRegistry::new().with_asset("usdc", 6).unwrap()
    }

    fn order(destination: &str, amount: Decimal) -> TransferOrder {
        TransferOrder {
            request_id: Uuid::new_v4(),
            destination: destination.to_string(),
            asset: "usdc".to_string(),
            amount,
        }
    }

    fn session(orders: Vec<TransferOrder>) -> ClearingSession {
        ClearingSession::new(
            1,
            Arc::new(KeyPair::from_seed(&[1u8; 32])),
            KeyPair::from_seed(&[2u8; 32]),
            SessionConfig::default(),
            &registry(),
            orders,
        )
    }

    fn authenticate(session: &mut ClearingSession) -> Vec<ClientMessage> {
        session.on_connected().unwrap();
        session
            .handle(ServerMessage::AuthChallenge {
                challenge: "c-1".to_string(),
            })
            .unwrap();
        let transfers = session
            .handle(ServerMessage::AuthVerified { session_key: None })
            .unwrap();
        for msg in &transfers {
            if let ClientMessage::Transfer(t) = msg {
                session.mark_sent(t.nonce);
            }
        }
        session.begin_draining();
        transfers
    }

    #[test]
    fn test_auth_request_declares_allowance() {
        let mut s = session(vec![order("a", dec!(5)), order("b", dec!(0.5))]);
        let ClientMessage::AuthRequest(request) = s.on_connected().unwrap() else {
            panic!("expected auth request");
        };
        assert_eq!(s.state(), SessionState::Authenticating);
        assert_eq!(request.allowances.len(), 1);
        assert_eq!(request.allowances[0].amount, "5500000");
        assert_eq!(request.session_key, s.session_public_key());
    }

    #[test]
    fn test_challenge_signed_by_wallet() {
        let mut s = session(vec![order("a", dec!(1))]);
        s.on_connected().unwrap();
        let out = s
            .handle(ServerMessage::AuthChallenge {
                challenge: "nonce-xyz".to_string(),
            })
            .unwrap();
        let ClientMessage::AuthVerify(verify) = &out[0] else {
            panic!("expected auth verify");
        };
        let wallet = KeyPair::from_seed(&[1u8; 32]);
        verify_signature(b"nonce-xyz", &verify.signature, &wallet.public_key_hex()).unwrap();
    }

    #[test]
    fn test_instructions_in_claim_order_with_scaled_amounts() {
        let mut s = session(vec![order("a", dec!(5)), order("b", dec!(1.25))]);
        let transfers = authenticate(&mut s);

        let instructions: Vec<_> = transfers
            .iter()
            .map(|m| match m {
                ClientMessage::Transfer(t) => t.clone(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();

        assert_eq!(instructions[0].nonce, 1);
        assert_eq!(instructions[0].destination, "a");
        assert_eq!(instructions[0].amount, "5000000");
        assert_eq!(instructions[1].nonce, 2);
        assert_eq!(instructions[1].amount, "1250000");

        let session_key = KeyPair::from_seed(&[2u8; 32]);
        for instruction in &instructions {
            let payload = instruction.payload_bytes().unwrap();
            verify_signature(&payload, &instruction.signature, &session_key.public_key_hex())
                .unwrap();
        }
        assert_eq!(s.state(), SessionState::Draining);
        assert_eq!(s.instructions_sent(), 2);
    }

    #[test]
    fn test_out_of_order_confirmations_correlate_by_nonce() {
        let first = order("a", dec!(1));
        let second = order("b", dec!(2));
        let (first_id, second_id) = (first.request_id, second.request_id);
        let mut s = session(vec![first, second]);
        authenticate(&mut s);

        s.handle(ServerMessage::TransferError {
            nonce: 2,
            reason: "insufficient balance".to_string(),
        })
        .unwrap();
        assert!(!s.is_drained());
        s.handle(ServerMessage::TransferConfirmed {
            nonce: 1,
            reference: None,
        })
        .unwrap();

        assert!(s.is_drained());
        assert_eq!(s.confirmed(), vec![(first_id, None)]);
        assert_eq!(s.rejected()[0].0, second_id);
    }

    #[test]
    fn test_informational_and_duplicates_do_not_count() {
        let mut s = session(vec![order("a", dec!(1)), order("b", dec!(1))]);
        authenticate(&mut s);

        s.handle(ServerMessage::BalanceUpdate {
            balances: serde_json::Value::Null,
        })
        .unwrap();
        s.handle(ServerMessage::Unknown).unwrap();
        s.handle(ServerMessage::TransferConfirmed {
            nonce: 1,
            reference: None,
        })
        .unwrap();
        s.handle(ServerMessage::TransferConfirmed {
            nonce: 1,
            reference: None,
        })
        .unwrap();
        s.handle(ServerMessage::TransferConfirmed {
            nonce: 99,
            reference: None,
        })
        .unwrap();

        assert_eq!(s.accounted(), 1);
        assert!(!s.is_drained());
    }

    #[test]
    fn test_error_during_handshake_is_authentication_failure() {
        let mut s = session(vec![order("a", dec!(1))]);
        s.on_connected().unwrap();
        let err = s
            .handle(ServerMessage::Error {
                message: "bad signature".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
        assert_eq!(s.instructions_sent(), 0);
    }

    #[test]
    fn test_error_after_handshake_is_connection_failure() {
        let mut s = session(vec![order("a", dec!(1))]);
        authenticate(&mut s);
        let err = s
            .handle(ServerMessage::Error {
                message: "channel closed".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(s.unresolved().len(), 1);
    }

    #[test]
    fn test_unconvertible_order_rejected_up_front() {
        let bad = order("a", dec!(0.0000001));
        let bad_id = bad.request_id;
        let mut s = session(vec![bad, order("b", dec!(1))]);
        let transfers = authenticate(&mut s);

        assert_eq!(transfers.len(), 1);
        assert_eq!(s.rejected()[0].0, bad_id);
        assert!(s.unresolved().len() == 1);
    }

    #[test]
    fn test_closed_session_rejects_messages() {
        let mut s = session(vec![order("a", dec!(1))]);
        s.close();
        assert!(s.handle(ServerMessage::AuthVerified { session_key: None }).is_err());
    }
}
