//! Connection pool for remote-shell sessions
//!
//! This module provides a thread-safe, async connection pool that:
//! - Reuses connections across callers, keyed by `ssh://user@host:port`
//! - Bounds live connections plus in-flight dials by `max_connections`
//! - Blocks or fails fast at capacity, per [`ExhaustionPolicy`]
//! - Probes connections and recovers failing ones
//! - Evicts idle, expired and unhealthy connections in the background
//! - Flags connections that outlive their expected lifetime
//!
//! # Example
//!
//! ```rust,ignore
//! use rustible_pool::prelude::*;
//!
//! let pool = ConnectionPool::builder(factory)
//!     .pool_config(PoolConfig::new().max_connections(10))
//!     .build()?;
//! pool.start()?;
//!
//! let ctx = Context::with_timeout(Duration::from_secs(5));
//! let key = pool.register(ConnectionConfig::new("web1").user("deploy"))?;
//! let conn = pool.get(&ctx, &key).await?;
//! conn.execute(&ctx, "uptime").await?;
//! pool.release(&key, &conn).await?;
//! pool.close().await?;
//! ```

pub mod cleanup;
pub mod entry;
pub mod health;
pub mod integration;
pub mod leak;
pub mod manager;
pub mod strategy;
pub mod task;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn, Instrument};

use crate::config::{AdvancedPoolConfig, ExhaustionPolicy, PoolConfig};
use crate::connection::{Connection, ConnectionConfig, ConnectionError, ConnectionFactory};
use crate::context::{Context, ContextError};
use crate::error::{PoolError, PoolResult};
use crate::telemetry::{NoopTracer, TraceEvent, Tracer};

use cleanup::{CleanupConfig, CleanupManager, CleanupResult, CleanupStats};
use entry::{EntryMetadata, EntryOrigin, EntrySnapshot, EntryState, PoolEntry};
use health::{HealthChecker, HealthReport, PoolHealthMonitor, RecoveryTarget};
use integration::PoolHealthIntegration;
use leak::{ConnectionLeakDetector, LeakCallback};
use manager::{EntryManager, EvictionListener, EvictionReason, SlotReservation};
use strategy::{CustomStrategy, EvictionStrategy, StrategyManager};

/// Fallback poll while blocked on a full pool.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Capability surface
// ============================================================================

/// Shutdown handle of a pool: its cancellation token and the tracker its
/// auxiliary tasks are spawned on.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    pub token: CancellationToken,
    pub tracker: TaskTracker,
}

/// What the rest of the system may do with a pool.
#[async_trait]
pub trait Pool: Send + Sync {
    /// Hand out a connection for `key`.
    async fn get(&self, ctx: &Context, key: &str) -> PoolResult<Arc<dyn Connection>>;

    /// Return a connection obtained from [`get`](Pool::get).
    async fn release(&self, key: &str, connection: &Arc<dyn Connection>) -> PoolResult<()>;

    /// Shut the pool down. Idempotent.
    async fn close(&self) -> PoolResult<()>;

    /// Probe every connection now.
    async fn health_check(&self, ctx: &Context) -> HealthReport;

    fn shutdown_signal(&self) -> ShutdownSignal;
}

/// Create and connect a transport for `config` under `ctx` and the connect timeout.
pub(crate) async fn dial(
    factory: &dyn ConnectionFactory,
    config: &ConnectionConfig,
    ctx: &Context,
) -> PoolResult<Arc<dyn Connection>> {
    let key = config.pool_key();
    let connection = match ctx.run(factory.create(config)).await {
        Ok(Ok(connection)) => connection,
        Ok(Err(e)) => return Err(PoolError::connection(key, e)),
        Err(_) => return Err(PoolError::Cancelled { key }),
    };

    let timeout = config.connect_timeout;
    let error = match ctx
        .run(tokio::time::timeout(timeout, connection.connect(ctx)))
        .await
    {
        Ok(Ok(Ok(()))) => return Ok(connection),
        Ok(Ok(Err(e))) => PoolError::connection(&key, e),
        Ok(Err(_)) | Err(ContextError::DeadlineExceeded) => {
            PoolError::connection(&key, ConnectionError::Timeout(timeout))
        }
        Err(ContextError::Cancelled) => PoolError::Cancelled { key: key.clone() },
    };

    if let Err(e) = connection.close().await {
        trace!(key = %key, error = %e, "Closing failed dial returned an error");
    }
    Err(error)
}

// ============================================================================
// Statistics
// ============================================================================

/// Result of a pre-warming operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrewarmResult {
    /// Connections created
    pub created: usize,
    /// Connections that failed after all retries
    pub failed: usize,
    /// Connections not attempted because the pool is full
    pub skipped: usize,
}

/// Statistics about the connection pool
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    /// Entries in the pool
    pub total_connections: usize,
    /// Entries handed out
    pub active_connections: usize,
    /// Entries available for reuse
    pub idle_connections: usize,
    /// Entries that failed their last health check
    pub unhealthy_connections: usize,
    /// Dials in progress
    pub pending_dials: usize,
    /// Connections reused
    pub hits: u64,
    /// Connections dialed on demand
    pub misses: u64,
    /// Failed dials
    pub failures: u64,
    /// Connections evicted by `get` to make room
    pub capacity_evictions: u64,
    /// `get` calls that had to wait for a slot
    pub waits: u64,
    /// `get` calls that ended in `PoolExhausted`
    pub exhaustions: u64,
    /// Connections created by pre-warming
    pub prewarmed: u64,
    /// Average acquire time over the sample window
    pub average_acquire_time: Option<Duration>,
    /// 95th percentile acquire time over the sample window
    pub p95_acquire_time: Option<Duration>,
    /// Cleanup counters
    pub cleanup: CleanupStats,
}

impl PoolStats {
    /// Fraction of `get` calls served from the pool.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
    capacity_evictions: AtomicU64,
    waits: AtomicU64,
    exhaustions: AtomicU64,
    prewarmed: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ============================================================================
// Pool
// ============================================================================

/// The connection pool.
pub struct ConnectionPool {
    config: AdvancedPoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    tracer: Arc<dyn Tracer>,
    entries: Arc<EntryManager>,
    strategies: Arc<StrategyManager>,
    destinations: Arc<DashMap<String, ConnectionConfig>>,
    monitor: Arc<PoolHealthMonitor>,
    cleanup: Arc<CleanupManager>,
    leaks: Arc<ConnectionLeakDetector>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
    counters: PoolCounters,
    acquire_times: Mutex<VecDeque<Duration>>,
}

impl ConnectionPool {
    /// Start building a pool around `factory`.
    pub fn builder(factory: Arc<dyn ConnectionFactory>) -> ConnectionPoolBuilder {
        ConnectionPoolBuilder::new(factory)
    }

    /// A pool with `config` and the default tracer.
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        config: AdvancedPoolConfig,
    ) -> PoolResult<Arc<Self>> {
        Self::builder(factory).config(config).build()
    }

    pub fn config(&self) -> &AdvancedPoolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> PoolResult<()> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }
        Ok(())
    }

    /// Launch health monitoring, cleanup and leak detection.
    pub fn start(&self) -> PoolResult<()> {
        self.ensure_open()?;
        if self.config.health.enabled {
            self.monitor.start_monitoring(&self.shutdown);
        }
        self.cleanup.start(&self.shutdown);
        self.leaks.start(&self.shutdown);
        info!(
            max_connections = self.config.pool.max_connections,
            strategy = self.strategies.eviction().name(),
            "Connection pool started"
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Destinations
    // ------------------------------------------------------------------------

    /// Record a destination. Returns its pool key.
    ///
    /// Registering the same config again is a no-op; a different config under
    /// an existing key is rejected.
    pub fn register(&self, config: ConnectionConfig) -> PoolResult<String> {
        self.ensure_open()?;
        config.validate()?;
        let key = config.pool_key();

        match self.destinations.entry(key.clone()) {
            MapEntry::Occupied(existing) if existing.get() != &config => {
                Err(PoolError::Configuration(format!(
                    "conflicting connection configuration for '{}'",
                    key
                )))
            }
            MapEntry::Occupied(_) => Ok(key),
            MapEntry::Vacant(slot) => {
                debug!(key = %key, "Destination registered");
                slot.insert(config);
                Ok(key)
            }
        }
    }

    pub fn destination(&self, key: &str) -> Option<ConnectionConfig> {
        self.destinations.get(key).map(|c| c.value().clone())
    }

    /// Register `config` if new, then [`get`](Self::get) its key.
    pub async fn get_with_config(
        &self,
        ctx: &Context,
        config: &ConnectionConfig,
    ) -> PoolResult<Arc<dyn Connection>> {
        let key = self.register(config.clone())?;
        self.get(ctx, &key).await
    }

    // ------------------------------------------------------------------------
    // Acquire / release
    // ------------------------------------------------------------------------

    /// Hand out a connection for `key`, reusing an idle one when possible.
    pub async fn get(&self, ctx: &Context, key: &str) -> PoolResult<Arc<dyn Connection>> {
        let span = self.tracer.span("pool.get", key);
        self.acquire(ctx, key).instrument(span).await
    }

    async fn acquire(&self, ctx: &Context, key: &str) -> PoolResult<Arc<dyn Connection>> {
        self.ensure_open()?;
        let config = self
            .destination(key)
            .ok_or_else(|| PoolError::UnknownKey(key.to_string()))?;

        let started = Instant::now();
        let max_connections = self.config.pool.max_connections;
        let wait_ctx = ctx.child_with_timeout(self.config.pool.acquire_timeout);
        let mut waiting = false;

        loop {
            self.ensure_open()?;

            // Registered before the checks so a release in between is not missed.
            let notified = self.entries.slot_freed().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(connection) = self.try_reuse(key) {
                bump(&self.counters.hits);
                self.record_acquire_time(started.elapsed());
                return Ok(connection);
            }

            if let Some(reservation) = self.entries.try_reserve(max_connections)? {
                bump(&self.counters.misses);
                let connection = self
                    .dial_and_install(ctx, key, &config, reservation, EntryOrigin::OnDemand)
                    .await?;
                self.record_acquire_time(started.elapsed());
                return Ok(connection);
            }

            if self.evict_for_capacity(key).await {
                continue;
            }

            let waited = started.elapsed();
            if self.config.pool.exhaustion_policy == ExhaustionPolicy::FailFast {
                return Err(self.exhausted(key, waited));
            }

            if !waiting {
                waiting = true;
                bump(&self.counters.waits);
                debug!(key = %key, max_connections, "Pool at capacity, waiting for a slot");
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
                _ = self.shutdown.cancelled() => return Err(PoolError::PoolClosed),
                reason = wait_ctx.done() => {
                    return Err(match reason {
                        ContextError::Cancelled => PoolError::Cancelled { key: key.to_string() },
                        ContextError::DeadlineExceeded => self.exhausted(key, started.elapsed()),
                    });
                }
            }
        }
    }

    fn exhausted(&self, key: &str, waited: Duration) -> PoolError {
        bump(&self.counters.exhaustions);
        warn!(key = %key, waited = ?waited, "Connection pool exhausted");
        self.tracer.event(&TraceEvent::PoolExhausted {
            key: key.to_string(),
            waited,
        });
        PoolError::PoolExhausted {
            key: key.to_string(),
            max_connections: self.config.pool.max_connections,
            waited,
        }
    }

    /// Acquire an idle entry of `key` chosen by the strategy manager.
    fn try_reuse(&self, key: &str) -> Option<Arc<dyn Connection>> {
        let mut candidates: Vec<EntrySnapshot> = self
            .entries
            .available(key)
            .iter()
            .map(|entry| entry.snapshot())
            .collect();

        while !candidates.is_empty() {
            let id = self.strategies.select_available(key, &candidates)?;
            if let Some(entry) = self.entries.get(id) {
                if let Some(connection) = entry.try_acquire() {
                    self.leaks.update_connection_activity(id);
                    self.tracer.event(&TraceEvent::ConnectionReused {
                        key: key.to_string(),
                        entry: id,
                    });
                    trace!(key = %key, entry = %id, "Reusing pooled connection");
                    return Some(connection);
                }
            }
            candidates.retain(|c| c.id != id);
        }
        None
    }

    /// Evict one entry to make room. Returns whether the caller should retry.
    ///
    /// Entries no caller can use (Unhealthy or Closed, not borrowed) go first,
    /// whatever their key. Otherwise the eviction strategy picks an idle entry
    /// of another key.
    async fn evict_for_capacity(&self, key: &str) -> bool {
        let snapshots = self.entries.snapshots();

        // An entry of this key went idle since the reuse attempt.
        if snapshots
            .iter()
            .any(|s| s.key == key && s.state == EntryState::Idle)
        {
            return true;
        }

        let unusable = snapshots
            .iter()
            .find(|s| !s.borrowed && s.state != EntryState::Idle)
            .map(|s| (s.id, s.key.clone(), EvictionReason::Unhealthy));

        let (victim, victim_key, reason) = match unusable {
            Some(victim) => victim,
            None => {
                let others: Vec<EntrySnapshot> =
                    snapshots.into_iter().filter(|s| s.key != key).collect();
                let Some(id) = self.strategies.eviction().select_for_eviction(&others) else {
                    return false;
                };
                let victim_key = others
                    .iter()
                    .find(|s| s.id == id)
                    .map(|s| s.key.clone())
                    .unwrap_or_default();
                (id, victim_key, EvictionReason::Capacity)
            }
        };

        let freed = match self.entries.evict(victim, reason).await {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!(key = %victim_key, entry = %victim, error = %e, "Closing evicted connection failed");
                true
            }
        };

        if freed {
            bump(&self.counters.capacity_evictions);
            debug!(key = %victim_key, entry = %victim, %reason, "Evicted connection to make room");
            self.tracer.event(&TraceEvent::ConnectionEvicted {
                key: victim_key,
                entry: victim,
                reason,
            });
        }
        freed
    }

    async fn dial_and_install(
        &self,
        ctx: &Context,
        key: &str,
        config: &ConnectionConfig,
        reservation: SlotReservation<'_>,
        origin: EntryOrigin,
    ) -> PoolResult<Arc<dyn Connection>> {
        let connection = match dial(self.factory.as_ref(), config, ctx).await {
            Ok(connection) => connection,
            Err(e) => {
                bump(&self.counters.failures);
                self.tracer.event(&TraceEvent::ConnectionFailed {
                    key: key.to_string(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let (entry, handed_out) = self
            .install(key, config, connection, reservation, origin, true)
            .await?;
        handed_out.ok_or_else(|| PoolError::NotConnected {
            key: entry.key().to_string(),
        })
    }

    /// Wrap a connected transport in an entry and commit it into `reservation`.
    ///
    /// With `hand_out` the entry is acquired before it becomes visible to
    /// other callers.
    async fn install(
        &self,
        key: &str,
        config: &ConnectionConfig,
        connection: Arc<dyn Connection>,
        reservation: SlotReservation<'_>,
        origin: EntryOrigin,
        hand_out: bool,
    ) -> PoolResult<(Arc<PoolEntry>, Option<Arc<dyn Connection>>)> {
        let entry = Arc::new(PoolEntry::new(
            self.entries.next_id(),
            key,
            connection,
            EntryMetadata::from_config(config, origin),
        ));

        let handed_out = if hand_out {
            match entry.try_acquire() {
                Some(connection) => Some(connection),
                None => {
                    if let Err(e) = entry.close().await {
                        trace!(key = %key, entry = %entry.id(), error = %e, "Closing unusable dial returned an error");
                    }
                    return Err(PoolError::NotConnected {
                        key: key.to_string(),
                    });
                }
            }
        } else {
            None
        };

        if let Err(e) = reservation.commit(Arc::clone(&entry)) {
            if let Err(close_error) = entry.close().await {
                trace!(key = %key, entry = %entry.id(), error = %close_error, "Closing uncommitted connection returned an error");
            }
            return Err(e);
        }

        let checker = HealthChecker::new(
            Arc::clone(&entry),
            self.config.pool.health_interval,
            self.config.health.clone(),
            Some(RecoveryTarget {
                factory: Arc::clone(&self.factory),
                config: config.clone(),
            }),
            Arc::clone(&self.tracer),
        );
        self.monitor.register(Arc::new(checker));
        self.leaks.track_connection(entry.id(), key);
        if handed_out.is_some() {
            self.leaks.update_connection_activity(entry.id());
        }

        debug!(key = %key, entry = %entry.id(), ?origin, "New pooled connection");
        self.tracer.event(&TraceEvent::ConnectionCreated {
            key: key.to_string(),
            entry: entry.id(),
        });
        Ok((entry, handed_out))
    }

    /// Return a connection to the pool.
    ///
    /// The entry is found by connection identity within `key`. Unknown
    /// connections are ignored.
    pub async fn release(&self, key: &str, connection: &Arc<dyn Connection>) -> PoolResult<()> {
        self.ensure_open()?;

        let Some(entry) = self.entries.find_by_connection(key, connection) else {
            trace!(key = %key, "Release of unknown connection ignored");
            return Ok(());
        };

        if entry.release() {
            self.leaks.update_connection_activity(entry.id());
            self.tracer.event(&TraceEvent::ConnectionReleased {
                key: key.to_string(),
                entry: entry.id(),
            });
        }
        self.entries.notify_slot_freed();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Create up to `count` idle connections for `key` within capacity.
    ///
    /// Each connection is attempted up to `max_retries` times.
    pub async fn prewarm(
        &self,
        ctx: &Context,
        key: &str,
        count: usize,
    ) -> PoolResult<PrewarmResult> {
        self.ensure_open()?;
        let config = self
            .destination(key)
            .ok_or_else(|| PoolError::UnknownKey(key.to_string()))?;

        info!(key = %key, count, "Pre-warming connections");
        let outcomes = join_all((0..count).map(|_| self.prewarm_one(ctx, key, &config))).await;

        let mut result = PrewarmResult::default();
        for outcome in outcomes {
            match outcome {
                Ok(true) => result.created += 1,
                Ok(false) => result.skipped += 1,
                Err(PoolError::PoolClosed) => return Err(PoolError::PoolClosed),
                Err(e) => {
                    warn!(key = %key, error = %e, "Pre-warm connection failed");
                    result.failed += 1;
                }
            }
        }

        info!(
            key = %key,
            created = result.created,
            failed = result.failed,
            skipped = result.skipped,
            "Pre-warming complete"
        );
        Ok(result)
    }

    /// `Ok(false)` when the pool is full.
    async fn prewarm_one(
        &self,
        ctx: &Context,
        key: &str,
        config: &ConnectionConfig,
    ) -> PoolResult<bool> {
        let max_connections = self.config.pool.max_connections;
        let Some(reservation) = self.entries.try_reserve(max_connections)? else {
            return Ok(false);
        };

        let mut last_error = None;
        for attempt in 1..=self.config.pool.max_retries {
            match dial(self.factory.as_ref(), config, ctx).await {
                Ok(connection) => {
                    self.install(
                        key,
                        config,
                        connection,
                        reservation,
                        EntryOrigin::Prewarm,
                        false,
                    )
                    .await?;
                    bump(&self.counters.prewarmed);
                    return Ok(true);
                }
                Err(e @ PoolError::Cancelled { .. }) => return Err(e),
                Err(e) => {
                    bump(&self.counters.failures);
                    debug!(key = %key, attempt, error = %e, "Pre-warm attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| PoolError::NotConnected {
            key: key.to_string(),
        }))
    }

    /// Run a cleanup cycle now and pre-warm every key it reports as short.
    pub async fn maintain(&self, ctx: &Context) -> PoolResult<CleanupResult> {
        self.ensure_open()?;
        let result = self.cleanup.run_cleanup().await;
        for request in &result.warmup_requests {
            self.prewarm(ctx, &request.key, request.missing).await?;
        }
        Ok(result)
    }

    /// Probe every registered connection now.
    pub async fn health_check(&self, ctx: &Context) -> HealthReport {
        let span = self.tracer.span("pool.health_check", "*");
        self.monitor.check_all_health(ctx).instrument(span).await
    }

    /// A health integration loop bound to this pool. The pool keeps no reference to it.
    pub fn health_integration(self: &Arc<Self>) -> Arc<PoolHealthIntegration> {
        let pool: Arc<dyn Pool> = Arc::clone(self) as Arc<dyn Pool>;
        Arc::new(PoolHealthIntegration::new(
            &pool,
            Arc::clone(&self.monitor),
            self.config.health.clone(),
            self.config.alerts.clone(),
            Arc::clone(&self.tracer),
        ))
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Stop every background task and close every connection.
    ///
    /// A second call returns `Ok(())`. Per-connection close failures are
    /// collected into [`PoolError::Close`].
    pub async fn close(&self) -> PoolResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let span = self.tracer.span("pool.close", "*");
        self.shutdown_inner().instrument(span).await
    }

    async fn shutdown_inner(&self) -> PoolResult<()> {
        info!("Closing connection pool");
        self.shutdown.cancel();

        self.cleanup.stop().await;
        self.monitor.stop_monitoring().await;
        self.leaks.stop().await;
        self.tracker.close();
        self.tracker.wait().await;

        let entries = self.entries.drain();
        let outcomes = join_all(entries.iter().map(|entry| entry.close())).await;

        let mut errors = Vec::new();
        for (entry, outcome) in entries.iter().zip(outcomes) {
            self.monitor.unregister(entry.id()).await;
            self.leaks.untrack_connection(entry.id());
            self.strategies.forget(entry.id());
            if let Err(e) = outcome {
                warn!(
                    key = %entry.key(),
                    entry = %entry.id(),
                    error = %e,
                    "Failed to close connection"
                );
                errors.push(PoolError::connection(entry.key(), e));
            }
        }

        self.tracer.event(&TraceEvent::PoolClosed {
            errors: errors.len(),
        });
        info!(closed = entries.len(), errors = errors.len(), "Connection pool closed");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PoolError::Close(errors))
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            token: self.shutdown.clone(),
            tracker: self.tracker.clone(),
        }
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn connections_for(&self, key: &str) -> usize {
        self.entries.count_for(key)
    }

    pub fn snapshots(&self) -> Vec<EntrySnapshot> {
        self.entries.snapshots()
    }

    pub fn health_monitor(&self) -> &Arc<PoolHealthMonitor> {
        &self.monitor
    }

    pub fn cleanup_manager(&self) -> &Arc<CleanupManager> {
        &self.cleanup
    }

    pub fn leak_detector(&self) -> &Arc<ConnectionLeakDetector> {
        &self.leaks
    }

    pub fn strategies(&self) -> &Arc<StrategyManager> {
        &self.strategies
    }

    fn record_acquire_time(&self, elapsed: Duration) {
        if !self.config.metrics.enabled {
            return;
        }
        let mut samples = self.acquire_times.lock();
        if samples.len() >= self.config.metrics.sample_size {
            samples.pop_front();
        }
        samples.push_back(elapsed);
    }

    fn acquire_time_summary(&self) -> (Option<Duration>, Option<Duration>) {
        let mut samples: Vec<Duration> = self.acquire_times.lock().iter().copied().collect();
        if samples.is_empty() {
            return (None, None);
        }
        samples.sort_unstable();
        let average = samples.iter().sum::<Duration>() / samples.len() as u32;
        let index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        (Some(average), samples.get(index).copied())
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> PoolStats {
        let snapshots = self.entries.snapshots();
        let count = |state: EntryState| snapshots.iter().filter(|s| s.state == state).count();
        let (average_acquire_time, p95_acquire_time) = self.acquire_time_summary();

        PoolStats {
            total_connections: snapshots.len(),
            active_connections: count(EntryState::Active),
            idle_connections: count(EntryState::Idle),
            unhealthy_connections: count(EntryState::Unhealthy),
            pending_dials: self.entries.live().saturating_sub(self.entries.len()),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            capacity_evictions: self.counters.capacity_evictions.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
            exhaustions: self.counters.exhaustions.load(Ordering::Relaxed),
            prewarmed: self.counters.prewarmed.load(Ordering::Relaxed),
            average_acquire_time,
            p95_acquire_time,
            cleanup: self.cleanup.stats(),
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("entries", &self.entries)
            .field("destinations", &self.destinations.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Pool for ConnectionPool {
    async fn get(&self, ctx: &Context, key: &str) -> PoolResult<Arc<dyn Connection>> {
        ConnectionPool::get(self, ctx, key).await
    }

    async fn release(&self, key: &str, connection: &Arc<dyn Connection>) -> PoolResult<()> {
        ConnectionPool::release(self, key, connection).await
    }

    async fn close(&self) -> PoolResult<()> {
        ConnectionPool::close(self).await
    }

    async fn health_check(&self, ctx: &Context) -> HealthReport {
        ConnectionPool::health_check(self, ctx).await
    }

    fn shutdown_signal(&self) -> ShutdownSignal {
        ConnectionPool::shutdown_signal(self)
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`ConnectionPool`]
pub struct ConnectionPoolBuilder {
    factory: Arc<dyn ConnectionFactory>,
    config: AdvancedPoolConfig,
    tracer: Option<Arc<dyn Tracer>>,
    custom_strategy: Option<CustomStrategy>,
    leak_callback: Option<LeakCallback>,
    destinations: Vec<ConnectionConfig>,
}

impl ConnectionPoolBuilder {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            config: AdvancedPoolConfig::default(),
            tracer: None,
            custom_strategy: None,
            leak_callback: None,
            destinations: Vec::new(),
        }
    }

    /// Set the full configuration
    pub fn config(mut self, config: AdvancedPoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set only the basic pool settings
    pub fn pool_config(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    /// Set the tracer (defaults to [`NoopTracer`])
    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Use a custom eviction strategy
    pub fn eviction_strategy(mut self, strategy: CustomStrategy) -> Self {
        self.config.eviction_strategy = "custom".to_string();
        self.custom_strategy = Some(strategy);
        self
    }

    /// Call `callback` for every suspected leak
    pub fn on_leak<F>(mut self, callback: F) -> Self
    where
        F: Fn(leak::ConnectionLifecycle) + Send + Sync + 'static,
    {
        self.leak_callback = Some(Arc::new(callback));
        self
    }

    /// Register a destination up front
    pub fn destination(mut self, config: ConnectionConfig) -> Self {
        self.destinations.push(config);
        self
    }

    /// Validate the configuration and wire the pool. Background tasks are
    /// launched by [`ConnectionPool::start`].
    pub fn build(self) -> PoolResult<Arc<ConnectionPool>> {
        self.config.validate()?;

        let tracer = self.tracer.unwrap_or_else(|| Arc::new(NoopTracer));
        let eviction =
            EvictionStrategy::from_name(&self.config.eviction_strategy, self.custom_strategy)?;
        let strategies = Arc::new(StrategyManager::new(
            eviction,
            self.config.load_balancing,
            self.config.affinity,
        ));

        let entries = Arc::new(EntryManager::new());
        let destinations = Arc::new(DashMap::new());
        let monitor = Arc::new(PoolHealthMonitor::new(self.config.health.enabled));
        let cleanup = Arc::new(CleanupManager::new(
            Arc::clone(&entries),
            Arc::clone(&strategies),
            Arc::clone(&destinations),
            CleanupConfig::resolve(&self.config.pool, &self.config.cleanup),
            self.config.pool.clone(),
            Arc::clone(&tracer),
        ));
        let leaks = Arc::new(ConnectionLeakDetector::new(
            self.config.leak_detection.clone(),
            self.leak_callback,
            Arc::clone(&tracer),
        ));

        entries.add_listener(Arc::clone(&monitor) as Arc<dyn EvictionListener>);
        entries.add_listener(Arc::clone(&leaks) as Arc<dyn EvictionListener>);
        entries.add_listener(Arc::clone(&strategies) as Arc<dyn EvictionListener>);

        let pool = Arc::new(ConnectionPool {
            acquire_times: Mutex::new(VecDeque::with_capacity(self.config.metrics.sample_size)),
            config: self.config,
            factory: self.factory,
            tracer,
            entries,
            strategies,
            destinations,
            monitor,
            cleanup,
            leaks,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
            counters: PoolCounters::default(),
        });

        for destination in self.destinations {
            pool.register(destination)?;
        }
        Ok(pool)
    }
}
