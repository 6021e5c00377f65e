//! In-memory correlator for out-of-band workflow answers.
//!
//! A prompt is registered under a fresh [`RequestId`] before it is forwarded
//! to the workflow engine. The engine later calls back with that id and an
//! answer (or an error) on a separate HTTP request; [`Correlator::fulfill`]
//! and [`Correlator::fail`] route it to whoever is suspended in
//! [`Correlator::await_result`].
//!
//! Each entry owns a `watch` channel carrying its [`RequestState`], so any
//! number of waiters (up to `max_waiters`) observe the same terminal state.
//! The registry lock is only held to look up or mutate an entry, never while
//! a waiter is suspended.

mod state;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

pub use state::{Outcome, PendingRequest, RequestId, RequestState};

/// Failure reason given to requests still pending at shutdown.
pub const SHUTDOWN_REASON: &str = "relay shutting down";

/// Shortest period accepted by [`Correlator::spawn_sweeper`].
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for the correlator.
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// How long any entry may stay in the registry.
    pub retention: Duration,
    /// Age at which a still-pending entry is expired. Clamped to `retention`.
    pub max_pending_age: Duration,
    /// Concurrent waiters allowed per request id.
    pub max_waiters: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(600),
            max_pending_age: Duration::from_secs(300),
            max_waiters: 4,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CorrelatorError {
    #[error("Unknown request: {0}")]
    NotFound(String),

    #[error("Duplicate delivery for request {id} (already {state})")]
    DuplicateDelivery { id: String, state: &'static str },

    #[error("Too many waiters for request {id} (limit {limit})")]
    TooManyWaiters { id: String, limit: usize },
}

/// What a single [`Correlator::sweep`] pass removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Pending entries that hit the maximum pending age.
    pub expired: Vec<RequestId>,
    /// Terminal entries that were delivered or outlived the retention window.
    pub reaped: usize,
}

impl SweepReport {
    pub fn total_removed(&self) -> usize {
        self.expired.len() + self.reaped
    }
}

struct Entry {
    created_at: Instant,
    state_tx: watch::Sender<RequestState>,
    delivered: bool,
}

impl Entry {
    fn new() -> Self {
        let (state_tx, _) = watch::channel(RequestState::Pending);
        Self {
            created_at: Instant::now(),
            state_tx,
            delivered: false,
        }
    }
}

/// Registry of in-flight prompts keyed by request id.
///
/// Owned by the process entry point and shared as `Arc<Correlator>`.
pub struct Correlator {
    entries: RwLock<HashMap<RequestId, Entry>>,
    config: CorrelatorConfig,
}

impl Correlator {
    pub fn new(mut config: CorrelatorConfig) -> Self {
        if config.max_pending_age > config.retention {
            warn!(
                max_pending_age = ?config.max_pending_age,
                retention = ?config.retention,
                "max_pending_age exceeds retention, clamping"
            );
            config.max_pending_age = config.retention;
        }
        config.max_waiters = config.max_waiters.max(1);
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CorrelatorConfig::default())
    }

    pub const fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Create a pending entry and return its freshly generated id.
    pub async fn register(&self) -> RequestId {
        let mut entries = self.entries.write().await;
        let id = loop {
            let candidate = RequestId::generate();
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        entries.insert(id.clone(), Entry::new());
        debug!(request_id = %id, "Registered pending request");
        id
    }

    /// Suspend until the request reaches a terminal state or `wait` elapses.
    ///
    /// Observing a terminal state marks the entry delivered so the next sweep
    /// can drop it. Dropping the returned future releases the waiter slot.
    pub async fn await_result(&self, id: &str, wait: Duration) -> Result<Outcome, CorrelatorError> {
        let mut state_rx = {
            let entries = self.entries.write().await;
            let entry = entries
                .get(id)
                .ok_or_else(|| CorrelatorError::NotFound(id.to_string()))?;
            if entry.state_tx.receiver_count() >= self.config.max_waiters {
                warn!(request_id = %id, limit = self.config.max_waiters, "Waiter limit reached");
                return Err(CorrelatorError::TooManyWaiters {
                    id: id.to_string(),
                    limit: self.config.max_waiters,
                });
            }
            entry.state_tx.subscribe()
        };

        let waited = timeout(wait, async {
            state_rx
                .wait_for(RequestState::is_terminal)
                .await
                .map(|state| RequestState::clone(&state))
        })
        .await;

        let outcome = match waited {
            Ok(Ok(state)) => Outcome::from(state),
            // Sender dropped without a terminal value: the entry was reaped.
            Ok(Err(_)) => Outcome::Expired,
            Err(_) => {
                debug!(request_id = %id, ?wait, "Wait timed out");
                return Ok(Outcome::TimedOut);
            }
        };

        if let Some(entry) = self.entries.write().await.get_mut(id) {
            entry.delivered = true;
        }
        Ok(outcome)
    }

    /// Record the workflow's answer for `id`.
    pub async fn fulfill(&self, id: &str, text: impl Into<String>) -> Result<(), CorrelatorError> {
        self.resolve(id, RequestState::Fulfilled(text.into())).await
    }

    /// Record a failure for `id`.
    pub async fn fail(&self, id: &str, reason: impl Into<String>) -> Result<(), CorrelatorError> {
        self.resolve(id, RequestState::Failed(reason.into())).await
    }

    async fn resolve(&self, id: &str, next: RequestState) -> Result<(), CorrelatorError> {
        let entries = self.entries.write().await;
        let entry = entries
            .get(id)
            .ok_or_else(|| CorrelatorError::NotFound(id.to_string()))?;

        let terminal = {
            let state = entry.state_tx.borrow();
            state.is_terminal().then(|| state.label())
        };
        if let Some(current) = terminal {
            warn!(
                request_id = %id,
                state = current,
                attempted = next.label(),
                "Ignoring duplicate delivery"
            );
            return Err(CorrelatorError::DuplicateDelivery {
                id: id.to_string(),
                state: current,
            });
        }

        let label = next.label();
        entry.state_tx.send_replace(next);
        info!(request_id = %id, state = label, "Request resolved");
        Ok(())
    }

    /// Mark `id` as handed to its caller so the next sweep drops it.
    ///
    /// For callers that report a terminal state without going through
    /// [`Correlator::await_result`]. Returns `false` for unknown ids.
    pub async fn mark_delivered(&self, id: &str) -> bool {
        self.entries
            .write()
            .await
            .get_mut(id)
            .map(|entry| entry.delivered = true)
            .is_some()
    }

    /// Non-blocking snapshot of an entry.
    pub async fn status(&self, id: &str) -> Result<PendingRequest, CorrelatorError> {
        let entries = self.entries.read().await;
        let (key, entry) = entries
            .get_key_value(id)
            .ok_or_else(|| CorrelatorError::NotFound(id.to_string()))?;
        Ok(PendingRequest {
            id: key.clone(),
            state: entry.state_tx.borrow().clone(),
            created_at: entry.created_at,
            delivered: entry.delivered,
            waiters: entry.state_tx.receiver_count(),
        })
    }

    /// Expire stale pending entries and drop finished ones.
    ///
    /// A pending entry older than `max_pending_age` moves to `Expired` (waking
    /// its waiters) and is removed. A terminal entry is removed once delivered
    /// or once older than `retention`.
    pub async fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let mut entries = self.entries.write().await;

        entries.retain(|id, entry| {
            let age = now.saturating_duration_since(entry.created_at);
            let terminal = entry.state_tx.borrow().is_terminal();
            if !terminal {
                if age < self.config.max_pending_age {
                    return true;
                }
                entry.state_tx.send_replace(RequestState::Expired);
                report.expired.push(id.clone());
                return false;
            }
            if entry.delivered || age >= self.config.retention {
                report.reaped += 1;
                return false;
            }
            true
        });
        drop(entries);

        for id in &report.expired {
            warn!(request_id = %id, "Pending request expired without a callback");
        }
        if report.total_removed() > 0 {
            debug!(
                expired = report.expired.len(),
                reaped = report.reaped,
                "Sweep completed"
            );
        }
        report
    }

    /// Spawn a task that sweeps every `every`, independent of request traffic.
    ///
    /// `every` is raised to [`MIN_SWEEP_INTERVAL`] if shorter.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let correlator = Arc::clone(self);
        let every = every.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await; // Skip first immediate tick
            loop {
                interval.tick().await;
                let report = correlator.sweep(Instant::now()).await;
                if report.total_removed() > 0 {
                    info!(
                        expired = report.expired.len(),
                        reaped = report.reaped,
                        "Background sweep completed"
                    );
                }
            }
        })
    }

    /// Fail every pending request and empty the registry.
    ///
    /// Returns the number of requests that were still pending.
    pub async fn shutdown(&self) -> usize {
        let mut entries = self.entries.write().await;
        let mut failed = 0;
        for entry in entries.values() {
            let changed = entry.state_tx.send_if_modified(|state| {
                if state.is_terminal() {
                    return false;
                }
                *state = RequestState::Failed(SHUTDOWN_REASON.to_string());
                true
            });
            if changed {
                failed += 1;
            }
        }
        entries.clear();
        info!(failed, "Correlator shut down");
        failed
    }

    /// Count of entries still waiting for a callback.
    pub async fn pending_count(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| !entry.state_tx.borrow().is_terminal())
            .count()
    }

    /// Count of live entries, terminal ones included until swept.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::with_defaults()
    }
}
