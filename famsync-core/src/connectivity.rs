//! Network reachability tracking.
//!
//! The monitor publishes a single latest-wins [`ConnectivityState`] on a
//! `watch` channel. Subscribers only wake on real transitions; a poll tick
//! that observes the same state publishes nothing.
//!
//! A state is `Connected` only after a real round trip through the
//! [`ReachabilityProbe`]. An interface that is up but cannot complete the
//! round trip (captive portal, DNS-only) counts as `Disconnected`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};

/// Classified network state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Unknown,
    Connected,
    /// Round trip succeeded but slowly. Does not block sync.
    Slow,
    Disconnected,
}

impl ConnectivityState {
    /// Whether the queue may be drained in this state.
    pub fn allows_sync(&self) -> bool {
        matches!(self, ConnectivityState::Connected | ConnectivityState::Slow)
    }

    /// Classifies the outcome of one probe. `None` means no round trip.
    pub fn classify(round_trip: Option<Duration>, slow_threshold: Duration) -> Self {
        match round_trip {
            Some(rtt) if rtt > slow_threshold => ConnectivityState::Slow,
            Some(_) => ConnectivityState::Connected,
            None => ConnectivityState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectivityState::Unknown => "unknown",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Slow => "slow",
            ConnectivityState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("probe failed: {0}")]
pub struct ProbeError(pub String);

/// Platform reachability primitive.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Cheap OS-level check that a network interface is up.
    async fn interface_available(&self) -> bool {
        true
    }

    /// Completes one real round trip to an external host.
    async fn round_trip(&self) -> Result<(), ProbeError>;
}

/// Polling and classification settings.
#[derive(Debug, Clone)]
pub struct ConnectivityConfig {
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub slow_threshold: Duration,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(8),
            slow_threshold: Duration::from_millis(2000),
        }
    }
}

/// Observes reachability and publishes state transitions.
pub struct ConnectivityMonitor {
    probe: Option<Arc<dyn ReachabilityProbe>>,
    config: ConnectivityConfig,
    state_tx: watch::Sender<ConnectivityState>,
    network_changed: Notify,
}

impl fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("state", &self.current_state())
            .field("config", &self.config)
            .finish()
    }
}

impl ConnectivityMonitor {
    pub fn new(probe: Arc<dyn ReachabilityProbe>, config: ConnectivityConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectivityState::Unknown);
        Self {
            probe: Some(probe),
            config,
            state_tx,
            network_changed: Notify::new(),
        }
    }

    /// Monitor without a probe, for hosts that push platform state via
    /// [`set_state`](Self::set_state).
    pub fn manual() -> Self {
        let (state_tx, _) = watch::channel(ConnectivityState::Unknown);
        Self {
            probe: None,
            config: ConnectivityConfig::default(),
            state_tx,
            network_changed: Notify::new(),
        }
    }

    pub fn current_state(&self) -> ConnectivityState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state_tx.subscribe()
    }

    /// Publishes `state` if it differs from the current one. Returns whether
    /// a transition happened.
    pub fn set_state(&self, state: ConnectivityState) -> bool {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::info!(state = %state, "Connectivity changed");
        }
        changed
    }

    /// OS-level network change hook. Wakes the polling loop for an immediate check.
    pub fn notify_network_change(&self) {
        self.network_changed.notify_one();
    }

    /// Probes once and publishes the result on transition.
    pub async fn check_now(&self) -> ConnectivityState {
        let Some(probe) = &self.probe else {
            return self.current_state();
        };

        let round_trip = if probe.interface_available().await {
            let started = Instant::now();
            match timeout(self.config.probe_timeout, probe.round_trip()).await {
                Ok(Ok(())) => Some(started.elapsed()),
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Reachability probe failed");
                    None
                }
                Err(_) => {
                    tracing::debug!("Reachability probe timed out");
                    None
                }
            }
        } else {
            None
        };

        let state = ConnectivityState::classify(round_trip, self.config.slow_threshold);
        self.set_state(state);
        state
    }

    /// Starts the polling loop on the current runtime.
    pub fn spawn(self: &Arc<Self>) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = Arc::clone(self);
        let join = tokio::spawn(async move { monitor.run(shutdown_rx).await });
        MonitorHandle { shutdown_tx, join }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.network_changed.notified() => {
                    tracing::debug!("Network change notification");
                }
                _ = shutdown.changed() => break,
            }
            self.check_now().await;
        }
        tracing::debug!("Connectivity monitor stopped");
    }
}

/// Handle to a running monitor loop.
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Probe that replays a script of outcomes; `None` entries fail.
    struct ScriptedProbe {
        outcomes: Mutex<Vec<Option<Duration>>>,
        interface_up: bool,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(outcomes: Vec<Option<Duration>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                interface_up: true,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ReachabilityProbe for ScriptedProbe {
        async fn interface_available(&self) -> bool {
            self.interface_up
        }

        async fn round_trip(&self) -> Result<(), ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut outcomes = self.outcomes.lock().unwrap();
                if outcomes.is_empty() {
                    None
                } else {
                    outcomes.remove(0)
                }
            };
            match next {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(())
                }
                None => Err(ProbeError("unreachable".to_string())),
            }
        }
    }

    fn config() -> ConnectivityConfig {
        ConnectivityConfig {
            poll_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            slow_threshold: Duration::from_millis(2000),
        }
    }

    #[test]
    fn test_classify() {
        let threshold = Duration::from_millis(2000);
        assert_eq!(
            ConnectivityState::classify(Some(Duration::from_millis(50)), threshold),
            ConnectivityState::Connected
        );
        assert_eq!(
            ConnectivityState::classify(Some(Duration::from_millis(2500)), threshold),
            ConnectivityState::Slow
        );
        assert_eq!(
            ConnectivityState::classify(None, threshold),
            ConnectivityState::Disconnected
        );
        assert!(ConnectivityState::Slow.allows_sync());
        assert!(!ConnectivityState::Unknown.allows_sync());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_now_classifies_round_trips() {
        let probe = Arc::new(ScriptedProbe::new(vec![
            Some(Duration::from_millis(10)),
            Some(Duration::from_millis(3000)),
            None,
            Some(Duration::from_secs(60)),
        ]));
        let monitor = ConnectivityMonitor::new(probe, config());

        assert_eq!(monitor.current_state(), ConnectivityState::Unknown);
        assert_eq!(monitor.check_now().await, ConnectivityState::Connected);
        assert_eq!(monitor.check_now().await, ConnectivityState::Slow);
        assert_eq!(monitor.check_now().await, ConnectivityState::Disconnected);
        // Exceeds the probe timeout
        assert_eq!(monitor.check_now().await, ConnectivityState::Disconnected);
    }

    #[tokio::test]
    async fn test_interface_up_without_round_trip_is_disconnected() {
        let mut probe = ScriptedProbe::new(vec![]);
        probe.interface_up = false;
        let probe = Arc::new(probe);
        let monitor = ConnectivityMonitor::new(probe.clone(), config());

        assert_eq!(monitor.check_now().await, ConnectivityState::Disconnected);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_only_transitions_are_published() {
        let monitor = ConnectivityMonitor::manual();
        let mut rx = monitor.subscribe();

        assert!(monitor.set_state(ConnectivityState::Connected));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        assert!(!monitor.set_state(ConnectivityState::Connected));
        assert!(!rx.has_changed().unwrap());

        assert!(monitor.set_state(ConnectivityState::Disconnected));
        assert_eq!(*rx.borrow_and_update(), ConnectivityState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_change_triggers_immediate_check() {
        let probe = Arc::new(ScriptedProbe::new(vec![
            Some(Duration::from_millis(1)),
            None,
        ]));
        let monitor = Arc::new(ConnectivityMonitor::new(probe.clone(), config()));
        let mut rx = monitor.subscribe();
        let handle = monitor.spawn();

        // First interval tick fires immediately
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectivityState::Connected);

        monitor.notify_network_change();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectivityState::Disconnected);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);

        handle.shutdown().await;
    }
}
