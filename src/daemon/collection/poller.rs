use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    daemon::permissions::{FailureClass, GrantedAdapter, PermissionGate, classify_failure},
    signal_api::{Reading, SignalAdapter, SignalKind},
    utils::clock::Clock,
};

use super::{ActivitySample, ReadingInterpreter};

pub enum PollOutcome {
    Sample(ActivitySample),
    /// Read failed, timed out or overlapped a hung read. The next tick retries.
    Dropped,
    /// Adapter hit a permission error and is gone for the session.
    Revoked,
}

/// Polls one adapter on its own cadence and forwards samples to fusion. Pollers never share a
/// timer, so a slow adapter only delays its own signal.
pub struct SignalPoller {
    kind: SignalKind,
    adapter: Arc<Mutex<Box<dyn SignalAdapter>>>,
    interpreter: ReadingInterpreter,
    next: mpsc::Sender<ActivitySample>,
    shutdown: CancellationToken,
    frequency: Duration,
    time_provider: Arc<dyn Clock>,
    gate: Arc<tokio::sync::Mutex<PermissionGate>>,
}

impl SignalPoller {
    pub fn new(
        GrantedAdapter { adapter, baseline }: GrantedAdapter,
        next: mpsc::Sender<ActivitySample>,
        shutdown: CancellationToken,
        frequency: Duration,
        time_provider: Arc<dyn Clock>,
        gate: Arc<tokio::sync::Mutex<PermissionGate>>,
    ) -> Self {
        Self {
            kind: adapter.kind(),
            adapter: Arc::new(Mutex::new(adapter)),
            interpreter: ReadingInterpreter::with_baseline(Some(baseline)),
            next,
            shutdown,
            frequency,
            time_provider,
            gate,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    /// Platform calls may block, so they run on the blocking pool. A read still running when the
    /// next one starts makes the next one fail instead of queueing behind it.
    async fn read_with_timeout(&self) -> Result<Reading> {
        let adapter = self.adapter.clone();
        let read = tokio::task::spawn_blocking(move || {
            let mut adapter = adapter
                .try_lock()
                .ok_or_else(|| anyhow!("Previous read is still running"))?;
            adapter.read()
        });

        match tokio::time::timeout(self.frequency, read).await {
            Ok(Ok(reading)) => reading,
            Ok(Err(e)) => Err(anyhow!("Adapter read did not complete {e}")),
            Err(_) => Err(anyhow!("Adapter read took longer than {:?}", self.frequency)),
        }
    }

    pub async fn poll_once(&mut self) -> PollOutcome {
        match self.read_with_timeout().await {
            Ok(reading) => PollOutcome::Sample(ActivitySample {
                source: self.kind,
                timestamp: self.time_provider.time(),
                value: self.interpreter.interpret(reading),
            }),
            Err(e) if classify_failure(&e) == FailureClass::Permission => {
                self.gate.lock().await.revoke(self.kind, format!("{e:#}"));
                PollOutcome::Revoked
            }
            Err(e) => {
                warn!("Dropping {} sample {e:?}", self.kind);
                PollOutcome::Dropped
            }
        }
    }

    /// Executes the polling loop until shutdown or revocation.
    pub async fn run(mut self) -> Result<()> {
        info!("Polling {} every {:?}", self.kind, self.frequency);
        let mut collection_point = self.time_provider.instant();
        loop {
            collection_point += self.frequency;

            match self.poll_once().await {
                PollOutcome::Sample(sample) => {
                    debug!("Sending sample {:?}", sample);
                    self.next
                        .send(sample)
                        .await
                        .inspect_err(|e| error!("Unexpected error during sending {e:?}"))?;
                }
                PollOutcome::Dropped => {}
                PollOutcome::Revoked => {
                    info!("Stopped polling {}", self.kind);
                    return Ok(());
                }
            }

            // After a suspend or a slow read, skip the missed ticks instead of bursting through them.
            collection_point = collection_point.max(self.time_provider.instant());

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Ok(())
                }
                _ = self.time_provider.sleep_until(collection_point) => ()
            }
        }
    }
}
