//! Batch lifecycle scenarios against the mock clearing network

mod common;

use batch_settlement::{TickOutcome, TransferStatus};
use clearing_protocol::mock::{AuthBehavior, MockScript, TransferBehavior};
use common::{harness, harness_with, run_tick, test_config, transfer};

#[tokio::test]
async fn submit_is_visible_before_any_batch() {
    let h = harness(MockScript::default());

    let id = h.service.submit(transfer("0xaaa", "5")).unwrap();

    let status = h.service.status();
    assert_eq!(status.pending_count, 1);
    assert!(!status.in_flight);
    assert_eq!(status.batches_run, 0);

    let pending = h.service.list_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].status, TransferStatus::Pending);
}

#[tokio::test]
async fn wire_amount_is_minor_units() {
    let h = harness(MockScript::default());
    h.service.submit(transfer("0xaaa", "5")).unwrap();

    run_tick(&h.service).await;

    let transfers = h.network.log().transfers();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].amount, "5000000");
    assert_eq!(transfers[0].asset, "usdc");
}

#[tokio::test]
async fn transfer_error_fails_only_its_request() {
    let script = MockScript::default()
        .with_destination("0xbbb", TransferBehavior::Reject("insufficient balance".to_string()));
    let h = harness(script);
    for recipient in ["0xaaa", "0xbbb", "0xccc"] {
        h.service.submit(transfer(recipient, "1.5")).unwrap();
    }

    let summary = run_tick(&h.service).await;

    assert_eq!(summary.claimed, 3);
    assert_eq!(summary.instructions_sent, 3);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.requeued, 0);
    assert!(!summary.fallback_used);

    // Only the confirmed two are settled, without source credentials
    assert_eq!(h.settlement.recipients(), vec!["0xaaa", "0xccc"]);
    assert!(h.settlement.calls().iter().all(|c| c.from_address.is_none()));

    let recent = h.service.recent();
    let failed: Vec<_> = recent
        .iter()
        .filter(|r| r.status == TransferStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].recipient, "0xbbb");
    assert_eq!(failed[0].failure_reason.as_deref(), Some("insufficient balance"));

    let status = h.service.status();
    assert_eq!(status.completed_count, 2);
    assert_eq!(status.pending_count, 0);
    assert_eq!(status.batches_run, 1);
}

#[tokio::test]
async fn reordered_confirmations_correlate_by_nonce() {
    let script = MockScript {
        reverse_confirmations: true,
        ..MockScript::default()
    }
    .with_destination("0xaaa", TransferBehavior::Reject("frozen".to_string()));
    let h = harness(script);
    for recipient in ["0xaaa", "0xbbb", "0xccc"] {
        h.service.submit(transfer(recipient, "2")).unwrap();
    }

    let summary = run_tick(&h.service).await;

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
    let failed: Vec<_> = h
        .service
        .recent()
        .into_iter()
        .filter(|r| r.status == TransferStatus::Failed)
        .map(|r| r.recipient)
        .collect();
    assert_eq!(failed, vec!["0xaaa"]);
}

#[tokio::test]
async fn authentication_failure_falls_back_for_every_request() {
    let script = MockScript {
        auth: AuthBehavior::RejectChallenge("wallet not registered".to_string()),
        ..MockScript::default()
    };
    let h = harness(script);
    for recipient in ["0xaaa", "0xbbb", "0xccc"] {
        h.service.submit(transfer(recipient, "1")).unwrap();
    }

    let summary = run_tick(&h.service).await;

    assert_eq!(summary.instructions_sent, 0);
    assert!(h.network.log().transfers().is_empty());
    assert!(summary.fallback_used);
    assert_eq!(summary.clearing_outcome, "authentication_failed");
    assert_eq!(summary.completed, 3);

    let calls = h.settlement.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls
        .iter()
        .all(|c| c.from_address.as_deref() == Some("0xtreasury")
            && c.sender_key.as_deref() == Some("treasury-key")));
    assert_eq!(h.network.log().closes, 1);
}

#[tokio::test]
async fn fallback_settlement_failures_are_independent() {
    let script = MockScript {
        refuse_connection: Some("connection refused".to_string()),
        ..MockScript::default()
    };
    let h = harness(script);
    h.settlement.fail_for("0xbbb");
    for recipient in ["0xaaa", "0xbbb", "0xccc"] {
        h.service.submit(transfer(recipient, "1")).unwrap();
    }

    let summary = run_tick(&h.service).await;

    assert!(summary.fallback_used);
    assert_eq!(summary.clearing_outcome, "connection_failed");
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(h.service.metrics().fallback_total.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_requeues_unconfirmed_request() {
    let script = MockScript::default().with_destination("0xccc", TransferBehavior::Silent);
    let h = harness(script);
    let ids: Vec<_> = ["0xaaa", "0xbbb", "0xccc"]
        .iter()
        .map(|r| h.service.submit(transfer(r, "1")).unwrap())
        .collect();

    let summary = run_tick(&h.service).await;

    assert_eq!(summary.clearing_outcome, "timed_out");
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.requeued, 1);
    assert!(!summary.fallback_used);

    let pending = h.service.list_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, ids[2]);
    assert_eq!(pending[0].status, TransferStatus::Pending);
    assert_eq!(pending[0].attempts, 1);

    assert_eq!(h.settlement.recipients(), vec!["0xaaa", "0xbbb"]);
    assert_eq!(h.network.log().closes, 1);
    assert!(!h.service.status().in_flight);
}

#[tokio::test(start_paused = true)]
async fn requeued_request_is_retried_next_window() {
    let script = MockScript::default().with_destination("0xccc", TransferBehavior::Silent);
    let h = harness(script);
    for recipient in ["0xaaa", "0xccc"] {
        h.service.submit(transfer(recipient, "1")).unwrap();
    }
    run_tick(&h.service).await;

    h.network.set_script(MockScript::default());
    let later = h.service.submit(transfer("0xddd", "1")).unwrap();
    let summary = run_tick(&h.service).await;

    assert_eq!(summary.sequence, 2);
    assert_eq!(summary.claimed, 2);
    assert_eq!(summary.completed, 2);
    // Requeued request keeps its place ahead of newer submissions
    let transfers = h.network.log().transfers();
    let second_batch: Vec<_> = transfers[2..].iter().map(|t| t.destination.clone()).collect();
    assert_eq!(second_batch, vec!["0xccc", "0xddd"]);
    assert!(h.service.recent().iter().any(|r| r.id == later));
}

#[tokio::test(start_paused = true)]
async fn silent_handshake_times_out_into_fallback() {
    let script = MockScript {
        auth: AuthBehavior::Silent,
        ..MockScript::default()
    };
    let h = harness(script);
    h.service.submit(transfer("0xaaa", "1")).unwrap();

    let summary = run_tick(&h.service).await;

    assert_eq!(summary.clearing_outcome, "timed_out");
    assert_eq!(summary.instructions_sent, 0);
    assert!(summary.fallback_used);
    assert_eq!(summary.completed, 1);
}

#[tokio::test]
async fn connection_loss_settles_confirmed_and_falls_back_for_rest() {
    let script = MockScript {
        drop_after: Some(3),
        ..MockScript::default()
    };
    let h = harness(script);
    for recipient in ["0xaaa", "0xbbb", "0xccc"] {
        h.service.submit(transfer(recipient, "1")).unwrap();
    }

    let summary = run_tick(&h.service).await;

    assert_eq!(summary.clearing_outcome, "connection_failed");
    assert!(summary.fallback_used);
    assert_eq!(summary.completed, 3);

    let calls = h.settlement.calls();
    assert_eq!(calls.len(), 3);
    let fallback: Vec<_> = calls
        .iter()
        .filter(|c| c.from_address.is_some())
        .map(|c| c.recipient_address.clone())
        .collect();
    assert_eq!(fallback, vec!["0xccc"]);
}

#[tokio::test]
async fn connection_loss_can_requeue_instead() {
    let mut config = test_config();
    config.clearing.fallback_on_connection_loss = false;
    let script = MockScript {
        drop_after: Some(3),
        ..MockScript::default()
    };
    let h = harness_with(config, script);
    for recipient in ["0xaaa", "0xbbb", "0xccc"] {
        h.service.submit(transfer(recipient, "1")).unwrap();
    }

    let summary = run_tick(&h.service).await;

    assert!(!summary.fallback_used);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.requeued, 1);
    assert_eq!(h.service.list_pending()[0].recipient, "0xccc");
}

#[tokio::test]
async fn settlement_is_called_once_per_request() {
    let h = harness(MockScript::default());
    h.settlement.fail_for("0xbbb");
    for recipient in ["0xaaa", "0xbbb"] {
        h.service.submit(transfer(recipient, "1")).unwrap();
    }

    let summary = run_tick(&h.service).await;

    // Settlement failure is post-hoc and never triggers fallback
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);
    assert!(!summary.fallback_used);
    assert_eq!(h.settlement.recipients(), vec!["0xaaa", "0xbbb"]);

    // Finished requests are evicted; nothing is left to settle again
    assert!(matches!(h.service.tick(), TickOutcome::Idle));
    assert_eq!(h.settlement.calls().len(), 2);
}

#[tokio::test]
async fn panicking_batch_fails_its_requests_and_releases_flight() {
    let h = harness(MockScript::default());
    h.settlement.panic_for("0xbbb");
    for recipient in ["0xaaa", "0xbbb", "0xccc"] {
        h.service.submit(transfer(recipient, "1")).unwrap();
    }

    let summary = run_tick(&h.service).await;

    assert_eq!(summary.clearing_outcome, "aborted");
    assert_eq!(summary.claimed, 3);
    assert_eq!(summary.failed, 3);

    let status = h.service.status();
    assert!(!status.in_flight);
    assert_eq!(status.pending_count, 0);
    assert_eq!(status.failed_count, 3);
    assert!(h
        .service
        .recent()
        .iter()
        .all(|r| r.failure_reason.as_deref() == Some("batch aborted")));

    // Nothing is stranded in flight; the next window is free to run
    assert!(matches!(h.service.tick(), TickOutcome::Idle));
    h.service.submit(transfer("0xddd", "1")).unwrap();
    assert_eq!(run_tick(&h.service).await.completed, 1);
}

#[tokio::test]
async fn summary_counts_received_outcomes() {
    let script = MockScript::default()
        .with_destination("0xbbb", TransferBehavior::Reject("frozen".to_string()));
    let h = harness(script);
    for recipient in ["0xaaa", "0xbbb"] {
        h.service.submit(transfer(recipient, "1")).unwrap();
    }

    let summary = run_tick(&h.service).await;

    assert_eq!(summary.instructions_sent, 2);
    assert_eq!(summary.outcomes_received, 2);
}

#[tokio::test]
async fn outcomes_are_sent_to_the_user() {
    let script = MockScript::default()
        .with_destination("0xbbb", TransferBehavior::Reject("limit exceeded".to_string()));
    let h = harness(script);
    for recipient in ["0xaaa", "0xbbb"] {
        h.service.submit(transfer(recipient, "5")).unwrap();
    }

    run_tick(&h.service).await;

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|(to, _)| to == "+15550100"));
    assert!(sent
        .iter()
        .any(|(_, body)| body == "Transfer of 5 TXTC to 0xbbb failed: limit exceeded"));
    assert!(sent
        .iter()
        .any(|(_, body)| body.starts_with("Sent 5 TXTC to 0xaaa. Tx: 0xtx-")));
}

#[tokio::test]
async fn idle_tick_starts_nothing() {
    let h = harness(MockScript::default());

    assert!(matches!(h.service.tick(), TickOutcome::Idle));
    assert_eq!(h.service.status().batches_run, 0);
    assert!(!h.service.status().in_flight);
    assert_eq!(h.network.log().connections, 0);
}

#[tokio::test]
async fn validation_errors_never_enter_the_queue() {
    let h = harness(MockScript::default());

    assert!(h.service.submit(transfer("", "5")).is_err());
    assert!(h.service.submit(transfer("0xaaa", "abc")).is_err());
    assert!(h.service.submit(transfer("0xaaa", "-3")).is_err());

    assert_eq!(h.service.status().pending_count, 0);
    assert_eq!(h.service.metrics().submitted_total.get(), 0);
}
