//! Periodic status checks for every enabled service.
//!
//! Each check runs on a blocking worker under its own deadline. A check that
//! fails, panics or overruns is recorded in that service's snapshot slot; the
//! cycle still completes and publishes. On timeout the worker is abandoned:
//! the module call keeps running on its thread until it returns, and the
//! service is not checked again until it has.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{panic_message, CheckError};
use crate::plugin::registry::{LifecycleRegistry, ModuleHandle};
use crate::redact::redact_credentials;
use crate::settings::config::DeckConfig;

use super::snapshot::{StatusEntry, StatusSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub interval: Duration,
    pub check_timeout: Duration,
    pub max_backoff: Duration,
}

impl From<&DeckConfig> for PollerConfig {
    fn from(config: &DeckConfig) -> Self {
        Self {
            interval: config.refresh_interval(),
            check_timeout: config.check_timeout(),
            max_backoff: config.max_backoff(),
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self::from(&DeckConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckPhase {
    Idle,
    Checking,
}

#[derive(Debug, Default)]
struct CheckState {
    /// Set while a worker for this id is running, including abandoned ones.
    in_flight: Arc<AtomicBool>,
    failures: u32,
    /// Cycles to skip before the next scheduled check.
    skip_cycles: u32,
}

impl CheckState {
    fn phase(&self) -> CheckPhase {
        if self.in_flight.load(Ordering::SeqCst) {
            CheckPhase::Checking
        } else {
            CheckPhase::Idle
        }
    }
}

/// Clears the in-flight flag when the worker finishes.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct StatusPoller {
    registry: Arc<LifecycleRegistry>,
    config: PollerConfig,
    states: Mutex<HashMap<String, CheckState>>,
    tx: watch::Sender<Arc<StatusSnapshot>>,
}

impl StatusPoller {
    pub fn new(registry: Arc<LifecycleRegistry>, config: PollerConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(StatusSnapshot::empty()));
        Self {
            registry,
            config,
            states: Mutex::new(HashMap::new()),
            tx,
        }
    }

    pub fn config(&self) -> PollerConfig {
        self.config
    }

    /// Latest published snapshot. Never waits for a cycle in progress.
    pub fn latest(&self) -> Arc<StatusSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<StatusSnapshot>> {
        self.tx.subscribe()
    }

    pub fn phase(&self, id: &str) -> CheckPhase {
        self.states()
            .get(id)
            .map(CheckState::phase)
            .unwrap_or(CheckPhase::Idle)
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, CheckState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Checks every enabled service once and publishes the result.
    ///
    /// Services that are backing off, or whose previous worker has not
    /// returned yet, keep their previous entry.
    pub async fn run_cycle(&self) -> Arc<StatusSnapshot> {
        let handles = self.registry.enabled_handles();
        let mut tasks = JoinSet::new();
        let mut skipped = 0usize;

        for handle in handles {
            let Some(flag) = self.claim(&handle.id, true) else {
                skipped += 1;
                continue;
            };
            let timeout = self.config.check_timeout;
            tasks.spawn(async move {
                let entry = check(&handle, flag, timeout).await;
                (handle, entry)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                // check() never panics; its module call is isolated on a blocking thread
                Err(e) => warn!(error = %e, "Status check task failed"),
            }
        }

        let checked = results.len();
        let updates = self.settle(results);
        let snapshot = self.publish(updates, &[]);
        debug!(
            sequence = snapshot.sequence,
            checked, skipped, "Published status snapshot"
        );
        snapshot
    }

    /// Out-of-cycle check of one service. Returns the entry now in the
    /// snapshot, which is the previous one if a worker is still in flight.
    pub async fn refresh(&self, id: &str) -> Option<StatusEntry> {
        let handle = self.registry.handle(id).ok()?;
        let Some(flag) = self.claim(&handle.id, false) else {
            return self.latest().get(id).cloned();
        };

        let entry = check(&handle, flag, self.config.check_timeout).await;
        let updates = self.settle(vec![(handle, entry)]);
        self.publish(updates, &[]).get(id).cloned()
    }

    /// Drops snapshot entries and check state for services that no longer exist.
    pub fn forget(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        {
            let mut states = self.states();
            for id in ids {
                states.remove(id);
            }
        }
        self.publish(Vec::new(), ids);
    }

    /// Runs cycles on the configured interval until `shutdown` flips to true
    /// or its sender is dropped.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval = ?self.config.interval, "Status poller started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_cycle().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Status poller stopped");
        })
    }

    /// Marks `id` as checking unless a worker is already in flight or, for
    /// scheduled checks, the id is backing off.
    fn claim(&self, id: &str, scheduled: bool) -> Option<InFlight> {
        let mut states = self.states();
        let state = states.entry(id.to_string()).or_default();

        if state.in_flight.load(Ordering::SeqCst) {
            debug!(service = %id, "Previous check still running, keeping last entry");
            return None;
        }
        if scheduled && state.skip_cycles > 0 {
            state.skip_cycles -= 1;
            debug!(service = %id, failures = state.failures, "Backing off");
            return None;
        }

        state.in_flight.store(true, Ordering::SeqCst);
        Some(InFlight(state.in_flight.clone()))
    }

    /// Updates backoff state and keeps only results for handles that are
    /// still current, so a service disabled mid-cycle gets no new entry.
    fn settle(&self, results: Vec<(ModuleHandle, StatusEntry)>) -> Vec<(String, StatusEntry)> {
        let mut updates = Vec::with_capacity(results.len());
        let mut states = self.states();

        for (handle, entry) in results {
            let state = states.entry(handle.id.clone()).or_default();
            match &entry.check_error {
                None => {
                    state.failures = 0;
                    state.skip_cycles = 0;
                }
                Some(error) => {
                    state.failures = state.failures.saturating_add(1);
                    state.skip_cycles = backoff_cycles(&self.config, state.failures);
                    warn!(
                        service = %handle.id,
                        failures = state.failures,
                        error = %error,
                        "Status check failed"
                    );
                }
            }

            if self.registry.is_current(&handle) {
                self.registry.record_status(&handle, &entry);
                updates.push((handle.id, entry));
            }
        }

        updates
    }

    fn publish(&self, updates: Vec<(String, StatusEntry)>, removed: &[String]) -> Arc<StatusSnapshot> {
        let mut published = None;
        self.tx.send_modify(|current| {
            let next = Arc::new(current.next(updates, removed));
            published = Some(next.clone());
            *current = next;
        });
        published.unwrap_or_else(|| self.latest())
    }
}

/// Backoff is `interval * 2^(failures-1)` capped at `max_backoff`,
/// expressed as whole cycles to skip.
fn backoff_cycles(config: &PollerConfig, failures: u32) -> u32 {
    let interval = config.interval.max(Duration::from_millis(1));
    let exponent = failures.saturating_sub(1).min(16);
    let backoff = interval
        .saturating_mul(1 << exponent)
        .min(config.max_backoff.max(interval));
    let cycles = (backoff.as_millis() / interval.as_millis()) as u32;
    cycles.saturating_sub(1)
}

/// Runs `is_running` then `details` on a blocking worker under `timeout`.
async fn check(handle: &ModuleHandle, flag: InFlight, timeout: Duration) -> StatusEntry {
    let module = handle.module();
    let task = tokio::task::spawn_blocking(move || {
        let _flag = flag;
        let running = module.is_running()?;
        let details = module.details();
        Ok::<_, anyhow::Error>((running, details))
    });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok((running, details)))) => StatusEntry::checked(running, details),
        Ok(Ok(Err(e))) => StatusEntry::failed(CheckError::Failed {
            message: redact_credentials(&format!("{e:#}")),
        }),
        Ok(Err(e)) if e.is_panic() => StatusEntry::failed(CheckError::Panicked {
            message: redact_credentials(&panic_message(e.into_panic().as_ref())),
        }),
        Ok(Err(e)) => StatusEntry::failed(CheckError::Failed {
            message: e.to_string(),
        }),
        Err(_) => {
            warn!(
                service = %handle.id,
                timeout = ?timeout,
                "Status check timed out; abandoning worker"
            );
            StatusEntry::failed(CheckError::timed_out(timeout))
        }
    }
}
