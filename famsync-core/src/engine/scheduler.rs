//! Background scheduling loop.
//!
//! A single task owns every automatic trigger. It sleeps until the earliest of
//! the periodic deadline, the reconciliation deadline and the next time a
//! backed-off mutation becomes eligible, and also wakes on connectivity
//! transitions and new enqueues.

use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use super::SyncEngine;
use crate::connectivity::ConnectivityState;

/// Lower bound between consecutive wake-ups caused by queue eligibility.
const MIN_WAKE: Duration = Duration::from_millis(100);

/// Handle to a running scheduling loop.
#[derive(Debug)]
pub struct EngineHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl EngineHandle {
    /// Stops the loop after any active run finishes.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            tracing::warn!(error = %e, "Sync scheduler task ended abnormally");
        }
    }
}

impl SyncEngine {
    /// Starts the scheduling loop on the current runtime.
    ///
    /// The connectivity monitor's own polling loop is started separately with
    /// [`ConnectivityMonitor::spawn`](crate::connectivity::ConnectivityMonitor::spawn).
    pub fn spawn(&self) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = self.clone();
        let join = tokio::spawn(async move { engine.run(shutdown_rx).await });
        EngineHandle { shutdown_tx, join }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let config = self.inner.config.clone();
        let mut connectivity = self.inner.monitor.subscribe();
        let mut online = connectivity.borrow_and_update().allows_sync();

        let started = Instant::now();
        let mut disconnected_since = (!online).then_some(started);
        let mut next_periodic = started + config.periodic_sync_interval;
        let mut next_reconcile = started + config.reconcile_interval;

        tracing::info!(online, "Sync scheduler started");
        if online {
            self.sync_all().await;
        }

        loop {
            let deadline = self
                .next_deadline(online, next_periodic, next_reconcile)
                .await;
            let mut transitioned = false;

            tokio::select! {
                _ = sleep_until(deadline) => {}
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    transitioned = true;
                }
                _ = self.inner.wake.notified() => {}
                _ = shutdown.changed() => break,
            }

            let state: ConnectivityState = *connectivity.borrow_and_update();
            let now = Instant::now();
            let was_online = online;
            online = state.allows_sync();

            if now >= next_periodic {
                next_periodic = now + config.periodic_sync_interval;
            }

            if !online {
                if was_online || disconnected_since.is_none() {
                    disconnected_since = Some(now);
                }
                if now >= next_reconcile {
                    next_reconcile = now + config.reconcile_interval;
                }
                continue;
            }

            let mut reconcile_due = now >= next_reconcile;
            if let Some(since) = disconnected_since.take() {
                let outage = now.duration_since(since);
                if outage >= config.long_disconnect {
                    tracing::info!(outage_secs = outage.as_secs(), "Long outage ended");
                    reconcile_due = true;
                }
            }

            if transitioned {
                tracing::debug!(state = %state, "Connectivity available, draining");
            }
            self.sync_all().await;

            if reconcile_due {
                next_reconcile = Instant::now() + config.reconcile_interval;
                if let Err(e) = self.reconcile_now().await {
                    tracing::warn!(error = %e, "Scheduled reconciliation failed");
                }
            }
        }

        tracing::info!("Sync scheduler stopped");
    }

    async fn next_deadline(&self, online: bool, periodic: Instant, reconcile: Instant) -> Instant {
        let mut deadline = periodic;
        if self.inner.reconciler.is_some() {
            deadline = deadline.min(reconcile);
        }
        if !online {
            return deadline;
        }

        if let Some(at) = self.inner.queue.next_eligible_at().await {
            let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            deadline = deadline.min(Instant::now() + delay.max(MIN_WAKE));
        }
        deadline
    }
}
