//! Shared harness: a service wired to the mock clearing network, a recording
//! settlement endpoint and a recording notifier

#![allow(dead_code)]

use async_trait::async_trait;
use batch_settlement::{
    BatchService, BatchSummary, Config, Dependencies, Error, NewTransfer, Notifier, Result,
    SettlementCall, SettlementClient, TickOutcome,
};
use clearing_protocol::mock::{MockConnector, MockScript};
use clearing_protocol::{KeyPair, SeededKeyProvider};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Settlement endpoint that records every call
#[derive(Default)]
pub struct RecordingSettlement {
    calls: Mutex<Vec<SettlementCall>>,
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
}

impl RecordingSettlement {
    /// Make calls for `recipient` fail
    pub fn fail_for(&self, recipient: &str) {
        self.failing.lock().insert(recipient.to_string());
    }

    /// Make calls for `recipient` panic inside the batch task
    pub fn panic_for(&self, recipient: &str) {
        self.panicking.lock().insert(recipient.to_string());
    }

    pub fn calls(&self) -> Vec<SettlementCall> {
        self.calls.lock().clone()
    }

    pub fn recipients(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|c| c.recipient_address.clone())
            .collect()
    }
}

#[async_trait]
impl SettlementClient for RecordingSettlement {
    async fn settle(&self, call: &SettlementCall) -> Result<Option<String>> {
        self.calls.lock().push(call.clone());
        if self.panicking.lock().contains(&call.recipient_address) {
            panic!("settlement client crashed on {}", call.recipient_address);
        }
        if self.failing.lock().contains(&call.recipient_address) {
            return Err(Error::Settlement("execution reverted".to_string()));
        }
        Ok(Some(format!("0xtx-{}", call.tx_id)))
    }
}

/// Notifier that records every message
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, to: &str, body: &str) -> Result<()> {
        self.sent.lock().push((to.to_string(), body.to_string()));
        Ok(())
    }
}

pub struct Harness {
    pub service: Arc<BatchService>,
    pub network: Arc<MockConnector>,
    pub settlement: Arc<RecordingSettlement>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.window.interval_seconds = 180;
    config.window.batch_timeout_seconds = 60;
    config
}

pub fn harness(script: MockScript) -> Harness {
    harness_with(test_config(), script)
}

pub fn harness_with(config: Config, script: MockScript) -> Harness {
    let network = Arc::new(MockConnector::new(script));
    let settlement = Arc::new(RecordingSettlement::default());
    let notifier = Arc::new(RecordingNotifier::default());

    let deps = Dependencies {
        connector: network.clone(),
        settlement: settlement.clone(),
        notifier: notifier.clone(),
        keys: Arc::new(SeededKeyProvider::new([7u8; 32])),
        wallet: Arc::new(KeyPair::from_seed(&[1u8; 32])),
    };

    Harness {
        service: Arc::new(BatchService::new(config, deps).unwrap()),
        network,
        settlement,
        notifier,
    }
}

pub fn transfer(recipient: &str, amount: &str) -> NewTransfer {
    NewTransfer::new(recipient, amount, "+15550100", "usdc", "TXTC")
        .with_source("0xtreasury", "treasury-key")
}

/// Tick once and wait for the batch to close
pub async fn run_tick(service: &Arc<BatchService>) -> BatchSummary {
    match service.tick() {
        TickOutcome::Started { handle, .. } => handle.await.unwrap(),
        other => panic!("expected a batch to start, got {:?}", other),
    }
}
