//! Wire messages exchanged with the clearing network
//!
//! Every frame is a JSON object with a `type` discriminator. Minor-unit
//! amounts travel as decimal strings so 128-bit values survive JSON parsers.

use crate::Result;
use serde::{Deserialize, Serialize};

/// Per-asset spending cap declared for a session key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allowance {
    /// Asset code
    pub asset: String,
    /// Cap in minor units
    pub amount: String,
}

/// Opens the handshake for a session key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// Long-lived wallet identity (hex public key)
    pub address: String,
    /// Ephemeral session public key (hex)
    pub session_key: String,
    /// Application name registered with the network
    pub application: String,
    /// Scope granted to the session key
    pub scope: String,
    /// Spending caps for the session
    pub allowances: Vec<Allowance>,
    /// Session expiry (unix seconds)
    pub expires_at: i64,
}

/// Answers the challenge with a wallet signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthVerify {
    /// Challenge being answered
    pub challenge: String,
    /// Wallet signature over the challenge (hex)
    pub signature: String,
}

/// One off-chain transfer, signed with the session key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInstruction {
    /// Correlation nonce, unique within the session
    pub nonce: u64,
    /// Recipient address
    pub destination: String,
    /// Asset code
    pub asset: String,
    /// Amount in minor units
    pub amount: String,
    /// Session key signature over the payload (hex)
    pub signature: String,
}

#[derive(Serialize)]
struct TransferPayload<'a> {
    nonce: u64,
    destination: &'a str,
    asset: &'a str,
    amount: &'a str,
}

impl TransferInstruction {
    /// Canonical bytes covered by the signature
    pub fn signing_bytes(nonce: u64, destination: &str, asset: &str, amount: &str) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&TransferPayload {
            nonce,
            destination,
            asset,
            amount,
        })?)
    }

    /// Bytes this instruction's signature should cover
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        Self::signing_bytes(self.nonce, &self.destination, &self.asset, &self.amount)
    }
}

/// Outbound message kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake opener
    AuthRequest(AuthRequest),
    /// Challenge response
    AuthVerify(AuthVerify),
    /// Transfer instruction
    Transfer(TransferInstruction),
}

impl ClientMessage {
    /// Encode as a JSON text frame
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Message kind for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::AuthRequest(_) => "auth_request",
            ClientMessage::AuthVerify(_) => "auth_verify",
            ClientMessage::Transfer(_) => "transfer",
        }
    }
}

/// Inbound message kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Challenge to be signed by the wallet
    AuthChallenge {
        /// Opaque challenge string
        challenge: String,
    },

    /// Handshake accepted
    AuthVerified {
        /// Session key the network authorized
        #[serde(default)]
        session_key: Option<String>,
    },

    /// Instruction executed
    TransferConfirmed {
        /// Nonce of the confirmed instruction
        nonce: u64,
        /// Network reference for the transfer
        #[serde(default)]
        reference: Option<String>,
    },

    /// Instruction rejected
    TransferError {
        /// Nonce of the rejected instruction
        nonce: u64,
        /// Rejection reason
        reason: String,
    },

    /// Error not tied to one instruction
    Error {
        /// Error description
        message: String,
    },

    /// Unified balance notification (informational)
    BalanceUpdate {
        /// Raw balance payload
        #[serde(default)]
        balances: serde_json::Value,
    },

    /// Ledger entry notification (informational)
    LedgerUpdate {
        /// Raw entries payload
        #[serde(default)]
        entries: serde_json::Value,
    },

    /// Any kind this client does not know
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Decode a JSON text frame
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Encode as a JSON text frame
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Non-authoritative kinds that never affect batch accounting
    pub fn is_informational(&self) -> bool {
        matches!(
            self,
            ServerMessage::BalanceUpdate { .. }
                | ServerMessage::LedgerUpdate { .. }
                | ServerMessage::Unknown
        )
    }

    /// Message kind for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::AuthChallenge { .. } => "auth_challenge",
            ServerMessage::AuthVerified { .. } => "auth_verified",
            ServerMessage::TransferConfirmed { .. } => "transfer_confirmed",
            ServerMessage::TransferError { .. } => "transfer_error",
            ServerMessage::Error { .. } => "error",
            ServerMessage::BalanceUpdate { .. } => "balance_update",
            ServerMessage::LedgerUpdate { .. } => "ledger_update",
            ServerMessage::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_wire_format() {
        let msg = ClientMessage::Transfer(TransferInstruction {
            nonce: 3,
            destination: "0xabc".to_string(),
            asset: "usdc".to_string(),
            amount: "5000000".to_string(),
            signature: "00".to_string(),
        });

        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "transfer");
        assert_eq!(value["nonce"], 3);
        assert_eq!(value["amount"], "5000000");
    }

    #[test]
    fn test_decode_confirmation() {
        let msg = ServerMessage::from_json(r#"{"type":"transfer_confirmed","nonce":7}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::TransferConfirmed {
                nonce: 7,
                reference: None
            }
        );
        assert!(!msg.is_informational());
    }

    #[test]
    fn test_unknown_kind_is_informational() {
        let msg = ServerMessage::from_json(r#"{"type":"channel_update","channel":"x"}"#).unwrap();
        assert_eq!(msg, ServerMessage::Unknown);
        assert!(msg.is_informational());

        let balance =
            ServerMessage::from_json(r#"{"type":"balance_update","balances":[{"asset":"usdc"}]}"#)
                .unwrap();
        assert!(balance.is_informational());
    }

    #[test]
    fn test_signing_bytes_exclude_signature() {
        let mut instruction = TransferInstruction {
            nonce: 1,
            destination: "0xabc".to_string(),
            asset: "usdc".to_string(),
            amount: "1".to_string(),
            signature: "aa".to_string(),
        };
        let before = instruction.payload_bytes().unwrap();
        instruction.signature = "bb".to_string();
        assert_eq!(before, instruction.payload_bytes().unwrap());
    }
}
