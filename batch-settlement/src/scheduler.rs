//! Batch window scheduling
//!
//! A `Scheduler` owns one loop that waits on a `TickSource` and asks the
//! service to start a batch on every tick. `SingleFlight` is the only
//! concurrency guard: a tick while a batch is in flight is a no-op.

use crate::service::BatchService;
use crate::types::BatchSummary;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// In-flight flag shared by the scheduler and the running batch
#[derive(Debug, Default)]
pub struct SingleFlight {
    in_flight: AtomicBool,
}

impl SingleFlight {
    /// Create idle flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the flight; `None` when a batch already holds it
    pub fn try_acquire(self: &Arc<Self>) -> Option<FlightGuard> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard {
                flight: self.clone(),
            })
    }

    /// Whether a batch is in flight
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Holds the flight; released on drop, including when the batch task panics
#[derive(Debug)]
pub struct FlightGuard {
    flight: Arc<SingleFlight>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.flight.in_flight.store(false, Ordering::Release);
    }
}

/// What one tick did
#[derive(Debug)]
pub enum TickOutcome {
    /// A batch was started
    Started {
        /// Batch sequence number
        sequence: u64,
        /// Requests claimed
        claimed: usize,
        /// Batch task
        handle: JoinHandle<BatchSummary>,
    },
    /// A batch is already in flight
    InFlight,
    /// Nothing pending
    Idle,
}

/// Cancellable source of scheduler ticks
#[async_trait]
pub trait TickSource: Send {
    /// Wait for the next tick; `false` once the source is exhausted
    async fn next_tick(&mut self) -> bool;

    /// Called after the scheduler handled the last tick
    fn tick_handled(&mut self) {}
}

/// Wall-clock ticks at a fixed interval, first tick one interval from now
#[derive(Debug)]
pub struct IntervalTicks {
    interval: Interval,
}

impl IntervalTicks {
    /// Create ticks every `period`
    pub fn new(period: Duration) -> Self {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }
}

#[async_trait]
impl TickSource for IntervalTicks {
    async fn next_tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Ticks driven by a [`ManualTicker`]
#[derive(Debug)]
pub struct ManualTicks {
    rx: mpsc::Receiver<oneshot::Sender<()>>,
    ack: Option<oneshot::Sender<()>>,
}

/// Handle that fires ticks into [`ManualTicks`]
#[derive(Debug, Clone)]
pub struct ManualTicker {
    tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl ManualTicks {
    /// Create a tick source and its handle
    pub fn channel() -> (ManualTicker, ManualTicks) {
        let (tx, rx) = mpsc::channel(1);
        (ManualTicker { tx }, ManualTicks { rx, ack: None })
    }
}

impl ManualTicker {
    /// Fire one tick and wait until the scheduler handled it
    pub async fn tick(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(ack_tx)
            .await
            .map_err(|_| Error::Other("scheduler stopped".to_string()))?;
        ack_rx
            .await
            .map_err(|_| Error::Other("scheduler stopped".to_string()))
    }
}

#[async_trait]
impl TickSource for ManualTicks {
    async fn next_tick(&mut self) -> bool {
        match self.rx.recv().await {
            Some(ack) => {
                self.ack = Some(ack);
                true
            }
            None => false,
        }
    }

    fn tick_handled(&mut self) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(());
        }
    }
}

/// Running scheduler loop
#[derive(Debug)]
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Scheduler {
    /// Start ticking `service` from `ticks`
    pub fn start<T>(service: Arc<BatchService>, ticks: T) -> Self
    where
        T: TickSource + 'static,
    {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(service, ticks, shutdown_rx));

        info!("Batch scheduler started");
        Self { shutdown, task }
    }

    /// Stop ticking and wait for the in-flight batch, if any
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| Error::Other(format!("scheduler task failed: {}", e)))?;

        info!("Batch scheduler stopped");
        Ok(())
    }
}

async fn run_loop<T: TickSource>(
    service: Arc<BatchService>,
    mut ticks: T,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_batch: Option<JoinHandle<BatchSummary>> = None;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            more = ticks.next_tick() => {
                if !more {
                    break;
                }

                match service.tick() {
                    TickOutcome::Started { sequence, claimed, handle } => {
                        debug!("Tick started batch {} with {} request(s)", sequence, claimed);
                        last_batch = Some(handle);
                    }
                    TickOutcome::InFlight => debug!("Tick skipped: batch in flight"),
                    TickOutcome::Idle => debug!("Tick skipped: nothing pending"),
                }
                ticks.tick_handled();
            }
        }
    }

    if let Some(handle) = last_batch {
        match handle.await {
            Ok(summary) => debug!("Last batch {} finished before shutdown", summary.sequence),
            Err(e) => error!("Batch task failed: {}", e),
        }
    }
}
