use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BreakerError, BreakerResult};
use crate::models::{Breaker, MonitorConfig};
use crate::modbus_frame::FunctionCode;
use crate::recovery::RecoveryManager;
use crate::status::{self, input};
use crate::store::BreakerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollResult {
    Changed,
    Unchanged,
    Unreachable,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub polled: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub unreachable: usize,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CycleSummary {
    fn record(&mut self, result: PollResult) {
        self.polled += 1;
        match result {
            PollResult::Changed => self.changed += 1,
            PollResult::Unchanged => self.unchanged += 1,
            PollResult::Unreachable => self.unreachable += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub running: bool,
    pub interval_secs: u64,
    pub max_retries: u32,
    pub last_cycle: Option<CycleSummary>,
}

struct MonitorState {
    running: bool,
    config: Option<MonitorConfig>,
    cancel: CancellationToken,
    interval_tx: Option<watch::Sender<Duration>>,
    handle: Option<JoinHandle<()>>,
}

/// Keeps the stored status mirror in sync with the fleet. Polling is
/// read-only: it never writes a coil and never resets a device.
pub struct FleetMonitor {
    store: Arc<dyn BreakerStore>,
    recovery: Arc<RecoveryManager>,
    state: RwLock<MonitorState>,
    last_cycle: Arc<RwLock<Option<CycleSummary>>>,
    /// Held for the whole of a cycle, ticker-driven or manual.
    cycle_guard: Arc<Mutex<()>>,
}

impl FleetMonitor {
    pub fn new(store: Arc<dyn BreakerStore>, recovery: Arc<RecoveryManager>) -> Self {
        Self {
            store,
            recovery,
            state: RwLock::new(MonitorState {
                running: false,
                config: None,
                cancel: CancellationToken::new(),
                interval_tx: None,
                handle: None,
            }),
            last_cycle: Arc::new(RwLock::new(None)),
            cycle_guard: Arc::new(Mutex::new(())),
        }
    }

    /// Stored config, falling back to the defaults once.
    async fn config(&self, state: &mut MonitorState) -> MonitorConfig {
        if let Some(config) = &state.config {
            return config.clone();
        }
        let config = match self.store.load_monitor_config().await {
            Ok(Some(config)) => config,
            Ok(None) => MonitorConfig::default(),
            Err(e) => {
                warn!("Monitor config unavailable, using defaults: {}", e);
                MonitorConfig::default()
            }
        };
        state.config = Some(config.clone());
        config
    }

    /// Seed the config used when nothing is stored yet.
    pub async fn with_default_config(self, config: MonitorConfig) -> Self {
        if let Ok(None) = self.store.load_monitor_config().await {
            self.state.write().await.config = Some(config);
        }
        self
    }

    /// Returns `false` if the monitor was already running.
    pub async fn start(&self) -> bool {
        let mut state = self.state.write().await;
        if state.running {
            debug!("Monitor already running");
            return false;
        }
        let config = self.config(&mut state).await;
        self.recovery.set_max_retries(config.max_retries);

        let cancel = CancellationToken::new();
        let (interval_tx, interval_rx) = watch::channel(config.interval());
        let handle = tokio::spawn(run_loop(
            self.store.clone(),
            self.recovery.clone(),
            self.last_cycle.clone(),
            self.cycle_guard.clone(),
            cancel.clone(),
            interval_rx,
        ));

        state.running = true;
        state.cancel = cancel;
        state.interval_tx = Some(interval_tx);
        state.handle = Some(handle);
        info!("🛰️  Fleet monitor started, polling every {}s", config.interval_secs);
        true
    }

    /// No poll starts after this returns. Returns `false` if not running.
    pub async fn stop(&self) -> bool {
        let handle = {
            let mut state = self.state.write().await;
            if !state.running {
                return false;
            }
            state.running = false;
            state.cancel.cancel();
            state.interval_tx = None;
            state.handle.take()
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Monitor task ended abnormally: {}", e);
            }
        }
        info!("Fleet monitor stopped");
        true
    }

    /// Persist a new poll interval. A running ticker is recreated and the
    /// in-flight cycle, if any, finishes first.
    pub async fn set_interval(&self, interval_secs: u64) -> BreakerResult<MonitorConfig> {
        if interval_secs == 0 {
            return Err(BreakerError::InvalidConfig("interval must be at least 1 second".into()));
        }
        let mut state = self.state.write().await;
        let mut config = self.config(&mut state).await;
        config.interval_secs = interval_secs;
        self.store.save_monitor_config(&config).await?;
        state.config = Some(config.clone());
        if let Some(tx) = &state.interval_tx {
            let _ = tx.send(config.interval());
        }
        info!("Monitor interval set to {}s", interval_secs);
        Ok(config)
    }

    pub async fn snapshot(&self) -> MonitorSnapshot {
        let mut state = self.state.write().await;
        let config = self.config(&mut state).await;
        MonitorSnapshot {
            running: state.running,
            interval_secs: config.interval_secs,
            max_retries: config.max_retries,
            last_cycle: self.last_cycle.read().await.clone(),
        }
    }

    /// Run a single poll cycle outside the ticker. Waits for a running
    /// cycle to finish instead of overlapping it.
    pub async fn poll_once(&self) -> CycleSummary {
        let _cycle = self.cycle_guard.lock().await;
        let summary = poll_cycle(self.store.clone(), self.recovery.clone()).await;
        *self.last_cycle.write().await = Some(summary.clone());
        summary
    }
}

async fn run_loop(
    store: Arc<dyn BreakerStore>,
    recovery: Arc<RecoveryManager>,
    last_cycle: Arc<RwLock<Option<CycleSummary>>>,
    cycle_guard: Arc<Mutex<()>>,
    cancel: CancellationToken,
    mut interval_rx: watch::Receiver<Duration>,
) {
    // first cycle right away, later ones one full period apart
    let mut ticker = new_ticker(Instant::now(), *interval_rx.borrow());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = interval_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let period = *interval_rx.borrow();
                debug!("Ticker recreated with period {:?}", period);
                ticker = new_ticker(Instant::now() + period, period);
            }
            _ = ticker.tick() => {
                let _cycle = cycle_guard.lock().await;
                let summary = poll_cycle(store.clone(), recovery.clone()).await;
                debug!(
                    "Poll cycle: {} polled, {} changed, {} unreachable",
                    summary.polled,
                    summary.changed,
                    summary.unreachable
                );
                *last_cycle.write().await = Some(summary);
            }
        }
    }
}

fn new_ticker(start: Instant, period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Poll every enabled breaker concurrently and wait for all of them.
pub async fn poll_cycle(store: Arc<dyn BreakerStore>, recovery: Arc<RecoveryManager>) -> CycleSummary {
    let mut summary = CycleSummary::default();
    let breakers = match store.list_enabled().await {
        Ok(breakers) => breakers,
        Err(e) => {
            error!("Cannot list breakers for polling: {}", e);
            summary.finished_at = Some(Utc::now());
            return summary;
        }
    };

    let mut workers = JoinSet::new();
    for breaker in breakers {
        let store = store.clone();
        let recovery = recovery.clone();
        workers.spawn(async move { poll_breaker(store.as_ref(), &recovery, &breaker).await });
    }
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(result) => summary.record(result),
            Err(e) => error!("Poll worker panicked: {}", e),
        }
    }
    summary.finished_at = Some(Utc::now());
    summary
}

async fn poll_breaker(store: &dyn BreakerStore, recovery: &RecoveryManager, breaker: &Breaker) -> PollResult {
    let now = Utc::now();
    let read = recovery
        .read_with_retry(&breaker.endpoint, FunctionCode::ReadInputRegisters, input::STATUS, 1)
        .await;

    let word = match read.as_deref() {
        Ok([word, ..]) => *word,
        Ok([]) => {
            warn!(breaker_id = breaker.id, "Empty status response");
            return mark_unreachable(store, breaker, now).await;
        }
        Err(e) => {
            warn!(breaker_id = breaker.id, "{} unreachable, keeping last known state: {}", breaker.name, e);
            return mark_unreachable(store, breaker, now).await;
        }
    };

    let decoded = status::decode(word);
    let mut result = PollResult::Unchanged;
    if decoded.closed().is_some()
        && (decoded.status() != breaker.status || decoded.locally_locked != breaker.local_lock)
    {
        info!(
            breaker_id = breaker.id,
            "{} changed: {:?} -> {:?} (local lock {})",
            breaker.name,
            breaker.status,
            decoded.status(),
            decoded.locally_locked
        );
        match store.record_state(breaker.id, decoded.status(), decoded.locally_locked, now).await {
            Ok(()) => result = PollResult::Changed,
            Err(e) => error!(breaker_id = breaker.id, "Failed to store state change: {}", e),
        }
    }
    if let Err(e) = store.touch(breaker.id, now, true).await {
        error!(breaker_id = breaker.id, "Failed to refresh liveness: {}", e);
    }
    result
}

async fn mark_unreachable(store: &dyn BreakerStore, breaker: &Breaker, now: DateTime<Utc>) -> PollResult {
    if let Err(e) = store.touch(breaker.id, now, false).await {
        error!(breaker_id = breaker.id, "Failed to refresh liveness: {}", e);
    }
    PollResult::Unreachable
}
