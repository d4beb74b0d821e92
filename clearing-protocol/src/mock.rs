//! In-process clearing network for dry runs and tests
//!
//! `MockConnector` plays the network side of the protocol from a
//! `MockScript`: it issues a challenge, checks the wallet and session-key
//! signatures, and answers each instruction per destination.

use crate::crypto::verify_signature;
use crate::message::{ClientMessage, ServerMessage, TransferInstruction};
use crate::transport::{Connection, Connector};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// How the mock answers the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthBehavior {
    /// Issue a challenge and accept a valid signature
    Accept,
    /// Answer the auth request with an error
    RejectRequest(String),
    /// Issue a challenge, then reject the verification
    RejectChallenge(String),
    /// Never answer
    Silent,
}

/// How the mock answers a transfer instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferBehavior {
    /// Confirm it
    Confirm,
    /// Reject it with a reason
    Reject(String),
    /// Never answer
    Silent,
}

/// Scripted network behaviour
#[derive(Debug, Clone)]
pub struct MockScript {
    /// Handshake behaviour
    pub auth: AuthBehavior,
    /// Behaviour for destinations without an override
    pub default_transfer: TransferBehavior,
    /// Per-destination overrides
    pub per_destination: HashMap<String, TransferBehavior>,
    /// Deliver outcomes in reverse order once the client starts waiting
    pub reverse_confirmations: bool,
    /// Drop the connection after this many instructions
    pub drop_after: Option<usize>,
    /// Interleave balance notifications with outcomes
    pub notifications: bool,
    /// Refuse to connect with this reason
    pub refuse_connection: Option<String>,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            auth: AuthBehavior::Accept,
            default_transfer: TransferBehavior::Confirm,
            per_destination: HashMap::new(),
            reverse_confirmations: false,
            drop_after: None,
            notifications: false,
            refuse_connection: None,
        }
    }
}

impl MockScript {
    /// Override the behaviour for one destination
    pub fn with_destination(mut self, destination: impl Into<String>, behavior: TransferBehavior) -> Self {
        self.per_destination.insert(destination.into(), behavior);
        self
    }

    fn transfer_behavior(&self, destination: &str) -> &TransferBehavior {
        self.per_destination
            .get(destination)
            .unwrap_or(&self.default_transfer)
    }
}

/// What the mock observed
#[derive(Debug, Clone, Default)]
pub struct MockLog {
    /// Connections opened
    pub connections: usize,
    /// Connections closed by the client
    pub closes: usize,
    /// Every frame received, in order
    pub received: Vec<ClientMessage>,
}

impl MockLog {
    /// Transfer instructions received, in order
    pub fn transfers(&self) -> Vec<TransferInstruction> {
        self.received
            .iter()
            .filter_map(|m| match m {
                ClientMessage::Transfer(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Connector for the scripted network
#[derive(Debug)]
pub struct MockConnector {
    script: Mutex<MockScript>,
    log: Arc<Mutex<MockLog>>,
}

impl MockConnector {
    /// Create connector
    pub fn new(script: MockScript) -> Self {
        Self {
            script: Mutex::new(script),
            log: Arc::new(Mutex::new(MockLog::default())),
        }
    }

    /// Replace the script for subsequent connections
    pub fn set_script(&self, script: MockScript) {
        *self.script.lock() = script;
    }

    /// Snapshot of observed traffic
    pub fn log(&self) -> MockLog {
        self.log.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let script = self.script.lock().clone();
        if let Some(reason) = &script.refuse_connection {
            return Err(Error::Connection(reason.clone()));
        }

        self.log.lock().connections += 1;
        debug!("Mock clearing network: connection opened");

        Ok(Box::new(MockConnection {
            script,
            log: self.log.clone(),
            inbox: VecDeque::new(),
            held: Vec::new(),
            wallet: None,
            session_key: None,
            challenge: None,
            authenticated: false,
            transfers_seen: 0,
            dropped: false,
            closed: false,
        }))
    }
}

#[derive(Debug)]
struct MockConnection {
    script: MockScript,
    log: Arc<Mutex<MockLog>>,
    inbox: VecDeque<ServerMessage>,
    held: Vec<ServerMessage>,
    wallet: Option<String>,
    session_key: Option<String>,
    challenge: Option<String>,
    authenticated: bool,
    transfers_seen: usize,
    dropped: bool,
    closed: bool,
}

impl MockConnection {
    fn respond(&mut self, message: ServerMessage) {
        if self.script.reverse_confirmations
            && matches!(
                message,
                ServerMessage::TransferConfirmed { .. } | ServerMessage::TransferError { .. }
            )
        {
            self.held.push(message);
        } else {
            self.inbox.push_back(message);
        }
    }

    fn on_transfer(&mut self, instruction: &TransferInstruction) {
        if !self.authenticated {
            self.respond(ServerMessage::Error {
                message: "session not authenticated".to_string(),
            });
            return;
        }

        self.transfers_seen += 1;
        if let Some(limit) = self.script.drop_after {
            if self.transfers_seen >= limit {
                info!("Mock clearing network: dropping connection");
                self.dropped = true;
                return;
            }
        }

        let signed = match (&self.session_key, instruction.payload_bytes()) {
            (Some(key), Ok(payload)) => verify_signature(&payload, &instruction.signature, key).is_ok(),
            _ => false,
        };
        if !signed {
            self.respond(ServerMessage::TransferError {
                nonce: instruction.nonce,
                reason: "invalid session signature".to_string(),
            });
            return;
        }

        if self.script.notifications {
            self.respond(ServerMessage::BalanceUpdate {
                balances: serde_json::json!([{ "asset": instruction.asset }]),
            });
        }

        match self.script.transfer_behavior(&instruction.destination).clone() {
            TransferBehavior::Confirm => self.respond(ServerMessage::TransferConfirmed {
                nonce: instruction.nonce,
                reference: Some(format!("mock-{}", Uuid::new_v4())),
            }),
            TransferBehavior::Reject(reason) => self.respond(ServerMessage::TransferError {
                nonce: instruction.nonce,
                reason,
            }),
            TransferBehavior::Silent => {}
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        if self.dropped || self.closed {
            return Err(Error::Connection("connection reset by peer".to_string()));
        }
        self.log.lock().received.push(message.clone());

        match message {
            ClientMessage::AuthRequest(request) => match self.script.auth.clone() {
                AuthBehavior::RejectRequest(reason) => {
                    self.respond(ServerMessage::Error { message: reason })
                }
                AuthBehavior::Silent => {}
                AuthBehavior::Accept | AuthBehavior::RejectChallenge(_) => {
                    let challenge = Uuid::new_v4().to_string();
                    self.wallet = Some(request.address.clone());
                    self.session_key = Some(request.session_key.clone());
                    self.challenge = Some(challenge.clone());
                    self.respond(ServerMessage::AuthChallenge { challenge });
                }
            },
            ClientMessage::AuthVerify(verify) => {
                if let AuthBehavior::RejectChallenge(reason) = self.script.auth.clone() {
                    self.respond(ServerMessage::Error { message: reason });
                    return Ok(());
                }

                let valid = match (&self.wallet, &self.challenge) {
                    (Some(wallet), Some(challenge)) => {
                        *challenge == verify.challenge
                            && verify_signature(challenge.as_bytes(), &verify.signature, wallet)
                                .is_ok()
                    }
                    _ => false,
                };

                if valid {
                    self.authenticated = true;
                    let session_key = self.session_key.clone();
                    self.respond(ServerMessage::AuthVerified { session_key });
                } else {
                    self.respond(ServerMessage::Error {
                        message: "invalid challenge signature".to_string(),
                    });
                }
            }
            ClientMessage::Transfer(instruction) => self.on_transfer(instruction),
        }

        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<ServerMessage>> {
        if self.inbox.is_empty() && !self.held.is_empty() {
            // Client is waiting: release held outcomes newest first
            while let Some(message) = self.held.pop() {
                self.inbox.push_back(message);
            }
        }

        if let Some(message) = self.inbox.pop_front() {
            return Ok(Some(message));
        }

        if self.dropped {
            return Err(Error::Connection("connection reset by peer".to_string()));
        }

        // Silent network: wait for the caller's deadline
        std::future::pending::<()>().await;
        Ok(None)
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.lock().closes += 1;
        }
    }
}
