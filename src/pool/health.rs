//! Liveness probing and auto-recovery of pooled connections.
//!
//! Every entry gets a [`HealthChecker`]. The [`PoolHealthMonitor`] keeps the
//! checkers of a pool, runs their periodic loops and fans out forced checks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::HealthConfig;
use crate::connection::{Connection, ConnectionConfig, ConnectionFactory};
use crate::context::Context;
use crate::error::{PoolError, PoolResult};
use crate::pool::dial;
use crate::pool::entry::{EntryId, PoolEntry};
use crate::pool::manager::{EvictionListener, EvictionReason};
use crate::pool::task::{ticker, BackgroundTask};
use crate::telemetry::{TraceEvent, Tracer};

// ============================================================================
// Results
// ============================================================================

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthResult {
    pub key: String,
    pub entry_id: EntryId,
    pub healthy: bool,
    pub response_time: Duration,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HealthResult {
    fn success(entry: &PoolEntry, response_time: Duration) -> Self {
        Self {
            key: entry.key().to_string(),
            entry_id: entry.id(),
            healthy: true,
            response_time,
            error: None,
            timestamp: Utc::now(),
        }
    }

    fn failure(entry: &PoolEntry, response_time: Duration, error: impl Into<String>) -> Self {
        Self {
            key: entry.key().to_string(),
            entry_id: entry.id(),
            healthy: false,
            response_time,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Aggregate of many probes. A derived snapshot, never authoritative.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub average_response_time: Duration,
    pub results: Vec<HealthResult>,
}

impl HealthReport {
    pub fn from_results(results: Vec<HealthResult>) -> Self {
        let total = results.len();
        let healthy = results.iter().filter(|r| r.healthy).count();
        let average_response_time = if total == 0 {
            Duration::ZERO
        } else {
            results.iter().map(|r| r.response_time).sum::<Duration>() / total as u32
        };

        Self {
            timestamp: Utc::now(),
            total,
            healthy,
            unhealthy: total - healthy,
            average_response_time,
            results,
        }
    }

    /// Keys with at least one unhealthy result, sorted and deduplicated.
    pub fn unhealthy_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .results
            .iter()
            .filter(|r| !r.healthy)
            .map(|r| r.key.clone())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn is_healthy(&self) -> bool {
        self.unhealthy == 0
    }
}

/// Run the probe command on `connection`. Returns the latency, or the latency and an error.
pub(crate) async fn probe(
    ctx: &Context,
    connection: &dyn Connection,
    config: &HealthConfig,
) -> Result<Duration, (Duration, String)> {
    let start = Instant::now();
    let outcome = ctx
        .run(tokio::time::timeout(
            config.timeout,
            connection.execute(ctx, &config.probe_command),
        ))
        .await;
    let latency = start.elapsed();

    match outcome {
        Ok(Ok(Ok(result))) if result.success => Ok(latency),
        Ok(Ok(Ok(result))) => Err((
            latency,
            format!("Command failed with exit code {}", result.exit_code),
        )),
        Ok(Ok(Err(e))) => Err((latency, e.to_string())),
        Ok(Err(_)) => Err((latency, format!("Timeout after {:?}", config.timeout))),
        Err(e) => Err((latency, e.to_string())),
    }
}

// ============================================================================
// Per-connection checker
// ============================================================================

/// Where a checker re-dials from when recovering.
#[derive(Clone)]
pub struct RecoveryTarget {
    pub factory: Arc<dyn ConnectionFactory>,
    pub config: ConnectionConfig,
}

impl std::fmt::Debug for RecoveryTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryTarget")
            .field("key", &self.config.pool_key())
            .finish_non_exhaustive()
    }
}

/// Probes one entry and recovers it after repeated failures.
pub struct HealthChecker {
    entry: Arc<PoolEntry>,
    interval: Duration,
    config: HealthConfig,
    recovery: Option<RecoveryTarget>,
    tracer: Arc<dyn Tracer>,
    last_result: RwLock<Option<(Instant, HealthResult)>>,
    consecutive_fails: AtomicU32,
    recoveries: AtomicU32,
    task: BackgroundTask,
}

impl HealthChecker {
    pub fn new(
        entry: Arc<PoolEntry>,
        interval: Duration,
        config: HealthConfig,
        recovery: Option<RecoveryTarget>,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        Self {
            entry,
            interval,
            config,
            recovery,
            tracer,
            last_result: RwLock::new(None),
            consecutive_fails: AtomicU32::new(0),
            recoveries: AtomicU32::new(0),
            task: BackgroundTask::new("health-check"),
        }
    }

    pub fn entry(&self) -> &Arc<PoolEntry> {
        &self.entry
    }

    pub fn key(&self) -> &str {
        self.entry.key()
    }

    pub fn consecutive_fails(&self) -> u32 {
        self.consecutive_fails.load(Ordering::SeqCst)
    }

    /// Completed recovery sequences.
    pub fn recoveries(&self) -> u32 {
        self.recoveries.load(Ordering::SeqCst)
    }

    pub fn last_result(&self) -> Option<HealthResult> {
        self.last_result.read().as_ref().map(|(_, r)| r.clone())
    }

    /// Probe now and update the entry.
    pub async fn check_health(&self, ctx: &Context) -> HealthResult {
        let result = match self.entry.connection() {
            Some(connection) => match probe(ctx, connection.as_ref(), &self.config).await {
                Ok(latency) => HealthResult::success(&self.entry, latency),
                Err((latency, error)) => HealthResult::failure(&self.entry, latency, error),
            },
            None => HealthResult::failure(&self.entry, Duration::ZERO, "no connection"),
        };

        if result.healthy {
            self.entry.mark_healthy();
            self.consecutive_fails.store(0, Ordering::SeqCst);
            trace!(key = %result.key, entry = %result.entry_id, latency = ?result.response_time, "Health check passed");
        } else {
            let error = result.error.clone().unwrap_or_default();
            let failures = self.entry.mark_unhealthy(error.clone());
            let consecutive = self.consecutive_fails.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(
                key = %result.key,
                entry = %result.entry_id,
                failures,
                consecutive,
                error = %error,
                "Health check failed"
            );
            self.tracer.event(&TraceEvent::HealthCheckFailed {
                key: result.key.clone(),
                entry: result.entry_id,
                error,
            });
        }

        *self.last_result.write() = Some((Instant::now(), result.clone()));
        result
    }

    /// Cached verdict while it is younger than the interval, a fresh probe otherwise.
    pub async fn is_healthy(&self, ctx: &Context) -> bool {
        let cached = self
            .last_result
            .read()
            .as_ref()
            .filter(|(at, _)| at.elapsed() < self.interval)
            .map(|(_, result)| result.healthy);

        match cached {
            Some(healthy) => healthy,
            None => self.check_health(ctx).await.healthy,
        }
    }

    /// Close the old connection and dial a replacement, with linear backoff.
    ///
    /// Refused with [`PoolError::HealthCheck`] while the entry is borrowed.
    pub async fn recover(&self, ctx: &Context) -> PoolResult<()> {
        let key = self.key().to_string();
        let Some(target) = self.recovery.as_ref() else {
            return Err(PoolError::RecoveryExhausted {
                key,
                attempts: 0,
                last_error: None,
            });
        };

        let old = self.entry.take_connection()?;
        self.tracer
            .event(&TraceEvent::RecoveryStarted { key: key.clone() });
        info!(key = %key, entry = %self.entry.id(), "Recovering connection");

        if let Some(old) = old {
            self.close_quietly(old.as_ref(), "failed").await;
        }

        let mut last_error = None;
        for attempt in 1..=self.config.recovery_retries {
            ctx.sleep(self.config.recovery_backoff * attempt)
                .await
                .map_err(|_| PoolError::Cancelled { key: key.clone() })?;

            match self.replace(ctx, target).await {
                Ok(()) => {
                    self.consecutive_fails.store(0, Ordering::SeqCst);
                    self.recoveries.fetch_add(1, Ordering::SeqCst);
                    info!(key = %key, attempt, "Connection recovered");
                    self.tracer.event(&TraceEvent::RecoverySucceeded {
                        key,
                        attempts: attempt,
                    });
                    return Ok(());
                }
                Err(e) => {
                    warn!(key = %key, attempt, error = %e, "Recovery attempt failed");
                    last_error = Some(Box::new(e));
                }
            }
        }

        let attempts = self.config.recovery_retries;
        self.tracer.event(&TraceEvent::RecoveryExhausted {
            key: key.clone(),
            attempts,
        });
        Err(PoolError::RecoveryExhausted {
            key,
            attempts,
            last_error,
        })
    }

    async fn replace(&self, ctx: &Context, target: &RecoveryTarget) -> PoolResult<()> {
        let connection = dial(target.factory.as_ref(), &target.config, ctx).await?;

        if let Err((_, error)) = probe(ctx, connection.as_ref(), &self.config).await {
            self.close_quietly(connection.as_ref(), "unverified replacement")
                .await;
            return Err(PoolError::HealthCheck {
                key: self.key().to_string(),
                message: error,
            });
        }

        match self.entry.replace_connection(connection) {
            Ok(displaced) => {
                if let Some(displaced) = displaced {
                    self.close_quietly(displaced.as_ref(), "displaced").await;
                }
                *self.last_result.write() = None;
                Ok(())
            }
            Err(connection) => {
                self.close_quietly(connection.as_ref(), "unused replacement")
                    .await;
                Err(PoolError::NotConnected {
                    key: self.key().to_string(),
                })
            }
        }
    }

    async fn close_quietly(&self, connection: &dyn Connection, which: &str) {
        if let Err(e) = connection.close().await {
            debug!(
                key = %self.key(),
                entry = %self.entry.id(),
                connection = which,
                error = %e,
                "Closing connection returned an error"
            );
        }
    }

    /// One monitoring tick. Returns `false` once the entry is closed.
    ///
    /// Borrowed entries are neither probed nor recovered until released.
    async fn tick(&self, ctx: &Context) -> bool {
        if self.entry.is_closed() {
            return false;
        }
        if self.entry.is_borrowed() {
            return true;
        }

        self.check_health(ctx).await;

        if self.config.auto_recovery
            && self.consecutive_fails() >= self.config.max_consecutive_fails
            && !self.entry.is_borrowed()
        {
            match self.recover(ctx).await {
                Ok(()) => {}
                // borrowed between the check and the take; retried after release
                Err(PoolError::HealthCheck { .. }) => return true,
                Err(e) => warn!(key = %self.key(), error = %e, "Recovery failed"),
            }
            self.consecutive_fails.store(0, Ordering::SeqCst);
        }
        true
    }

    /// Start the periodic loop. No-op when already running.
    pub fn start_monitoring(self: &Arc<Self>, parent: Option<&CancellationToken>) -> bool {
        let checker: Weak<Self> = Arc::downgrade(self);
        let interval = self.interval;
        self.task.start(parent, move |token| async move {
            let mut tick = ticker(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let Some(checker) = checker.upgrade() else {
                    break;
                };
                let ctx = Context::from_token(token.child_token());
                if !checker.tick(&ctx).await {
                    break;
                }
            }
        })
    }

    /// Stop the periodic loop and wait for it.
    pub async fn stop_monitoring(&self) {
        self.task.stop().await;
    }

    pub fn is_monitoring(&self) -> bool {
        self.task.is_running()
    }
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("entry", &self.entry.id())
            .field("key", &self.entry.key())
            .field("consecutive_fails", &self.consecutive_fails())
            .field("monitoring", &self.is_monitoring())
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// All checkers of a pool.
#[derive(Debug)]
pub struct PoolHealthMonitor {
    checkers: DashMap<EntryId, Arc<HealthChecker>>,
    monitoring: Mutex<Option<CancellationToken>>,
    loops_enabled: bool,
}

impl PoolHealthMonitor {
    /// `loops_enabled = false` keeps checkers registered without periodic loops.
    pub fn new(loops_enabled: bool) -> Self {
        Self {
            checkers: DashMap::new(),
            monitoring: Mutex::new(None),
            loops_enabled,
        }
    }

    /// Add a checker. It starts right away when monitoring is active.
    pub fn register(&self, checker: Arc<HealthChecker>) {
        let id = checker.entry().id();
        let monitoring = self.monitoring.lock().clone();
        if let (Some(token), true) = (monitoring, self.loops_enabled) {
            checker.start_monitoring(Some(&token));
        }
        self.checkers.insert(id, checker);
    }

    /// Remove a checker and stop its loop.
    pub async fn unregister(&self, id: EntryId) -> Option<Arc<HealthChecker>> {
        let (_, checker) = self.checkers.remove(&id)?;
        checker.stop_monitoring().await;
        Some(checker)
    }

    /// Remove every checker of `key`, returning them.
    pub async fn unregister_key(&self, key: &str) -> Vec<Arc<HealthChecker>> {
        let ids: Vec<EntryId> = self
            .checkers
            .iter()
            .filter(|c| c.value().key() == key)
            .map(|c| *c.key())
            .collect();

        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(checker) = self.unregister(id).await {
                removed.push(checker);
            }
        }
        removed
    }

    pub fn checker(&self, id: EntryId) -> Option<Arc<HealthChecker>> {
        self.checkers.get(&id).map(|c| Arc::clone(c.value()))
    }

    pub fn checkers_for(&self, key: &str) -> Vec<Arc<HealthChecker>> {
        self.checkers
            .iter()
            .filter(|c| c.value().key() == key)
            .map(|c| Arc::clone(c.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.checkers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkers.is_empty()
    }

    fn all(&self) -> Vec<Arc<HealthChecker>> {
        self.checkers.iter().map(|c| Arc::clone(c.value())).collect()
    }

    /// Force a probe of every registered connection, concurrently.
    pub async fn check_all_health(&self, ctx: &Context) -> HealthReport {
        let checkers = self.all();
        let results = join_all(checkers.iter().map(|c| c.check_health(ctx))).await;
        HealthReport::from_results(results)
    }

    /// Keys whose cached result is unhealthy. Never probes.
    pub fn get_unhealthy_connections(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .checkers
            .iter()
            .filter(|c| c.value().last_result().is_some_and(|r| !r.healthy))
            .map(|c| c.value().key().to_string())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Start every loop. Checkers registered later start automatically.
    pub fn start_monitoring(&self, parent: &CancellationToken) {
        let token = {
            let mut monitoring = self.monitoring.lock();
            if monitoring.as_ref().is_some_and(|t| !t.is_cancelled()) {
                return;
            }
            let token = parent.child_token();
            *monitoring = Some(token.clone());
            token
        };

        if !self.loops_enabled {
            return;
        }
        for checker in self.all() {
            checker.start_monitoring(Some(&token));
        }
        debug!(checkers = self.len(), "Health monitoring started");
    }

    /// Stop every loop and wait for them.
    pub async fn stop_monitoring(&self) {
        if let Some(token) = self.monitoring.lock().take() {
            token.cancel();
        }
        for checker in self.all() {
            checker.stop_monitoring().await;
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }
}

#[async_trait]
impl EvictionListener for PoolHealthMonitor {
    async fn on_evicted(&self, id: EntryId, _key: &str, _reason: EvictionReason) {
        self.unregister(id).await;
    }
}
