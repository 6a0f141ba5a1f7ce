//! Periodic pool maintenance.
//!
//! Each cleanup cycle runs these phases in order:
//! 1. idle entries past the idle timeout
//! 2. non-Active entries past the maximum connection age
//! 3. Unhealthy entries and entries over the failure threshold
//! 4. Idle entries the eviction strategy judges evictable
//! 5. capacity enforcement with strategy-selected victims
//! 6. warmup requests for keys below their minimum
//!
//! Cycles are serialized. A failed eviction is recorded and never aborts the cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CleanupSettings, PoolConfig};
use crate::connection::ConnectionConfig;
use crate::pool::entry::{EntryId, EntrySnapshot, EntryState};
use crate::pool::manager::{EntryManager, EvictionReason};
use crate::pool::strategy::StrategyManager;
use crate::pool::task::{ticker, BackgroundTask};
use crate::telemetry::{TraceEvent, Tracer};

/// Smoothing factor of the cycle duration average.
const EMA_ALPHA: f64 = 0.1;

/// Runtime cleanup settings, resolved from [`PoolConfig`] and [`CleanupSettings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub idle_timeout: Duration,
    pub max_connection_age: Duration,
    pub max_connections: usize,
    pub min_connections: usize,
}

impl CleanupConfig {
    pub fn resolve(pool: &PoolConfig, settings: &CleanupSettings) -> Self {
        Self {
            enabled: settings.enabled,
            interval: pool.cleanup_interval,
            idle_timeout: pool.max_idle_time,
            max_connection_age: settings.max_connection_age,
            max_connections: pool.max_connections,
            min_connections: settings.min_connections,
        }
    }
}

/// A key that needs more connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupRequest {
    pub key: String,
    pub missing: usize,
}

/// Outcome of one cleanup cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupResult {
    pub idle_connections_cleaned: usize,
    pub expired_connections_cleaned: usize,
    pub unhealthy_connections_cleaned: usize,
    pub policy_connections_cleaned: usize,
    pub capacity_connections_cleaned: usize,
    pub warmup_requests: Vec<WarmupRequest>,
    pub errors: Vec<String>,
    pub duration: Duration,
}

impl CleanupResult {
    pub fn total_cleaned(&self) -> usize {
        self.idle_connections_cleaned
            + self.expired_connections_cleaned
            + self.unhealthy_connections_cleaned
            + self.policy_connections_cleaned
            + self.capacity_connections_cleaned
    }

    fn record(&mut self, reason: EvictionReason) {
        match reason {
            EvictionReason::Idle => self.idle_connections_cleaned += 1,
            EvictionReason::Expired => self.expired_connections_cleaned += 1,
            EvictionReason::Unhealthy => self.unhealthy_connections_cleaned += 1,
            EvictionReason::Policy => self.policy_connections_cleaned += 1,
            EvictionReason::Capacity | EvictionReason::Shutdown => {
                self.capacity_connections_cleaned += 1
            }
        }
    }
}

/// Cumulative cleanup statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupStats {
    pub cycles: u64,
    pub total_cleaned: u64,
    pub idle_cleaned: u64,
    pub expired_cleaned: u64,
    pub unhealthy_cleaned: u64,
    pub policy_cleaned: u64,
    pub capacity_cleaned: u64,
    pub warmup_requests: u64,
    pub errors: u64,
    /// Exponential moving average of the cycle duration.
    pub average_duration: Duration,
    pub last_cycle: Option<DateTime<Utc>>,
}

impl CleanupStats {
    fn absorb(&mut self, result: &CleanupResult) {
        self.average_duration = if self.cycles == 0 {
            result.duration
        } else {
            self.average_duration.mul_f64(1.0 - EMA_ALPHA) + result.duration.mul_f64(EMA_ALPHA)
        };
        self.cycles += 1;
        self.total_cleaned += result.total_cleaned() as u64;
        self.idle_cleaned += result.idle_connections_cleaned as u64;
        self.expired_cleaned += result.expired_connections_cleaned as u64;
        self.unhealthy_cleaned += result.unhealthy_connections_cleaned as u64;
        self.policy_cleaned += result.policy_connections_cleaned as u64;
        self.capacity_cleaned += result.capacity_connections_cleaned as u64;
        self.warmup_requests += result.warmup_requests.len() as u64;
        self.errors += result.errors.len() as u64;
        self.last_cycle = Some(Utc::now());
    }
}

/// Runs cleanup cycles on a ticker.
pub struct CleanupManager {
    entries: Arc<EntryManager>,
    strategies: Arc<StrategyManager>,
    destinations: Arc<DashMap<String, ConnectionConfig>>,
    config: CleanupConfig,
    pool_config: PoolConfig,
    tracer: Arc<dyn Tracer>,
    cycle: tokio::sync::Mutex<()>,
    stats: Mutex<CleanupStats>,
    task: BackgroundTask,
}

impl CleanupManager {
    pub fn new(
        entries: Arc<EntryManager>,
        strategies: Arc<StrategyManager>,
        destinations: Arc<DashMap<String, ConnectionConfig>>,
        config: CleanupConfig,
        pool_config: PoolConfig,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        Self {
            entries,
            strategies,
            destinations,
            config,
            pool_config,
            tracer,
            cycle: tokio::sync::Mutex::new(()),
            stats: Mutex::new(CleanupStats::default()),
            task: BackgroundTask::new("cleanup"),
        }
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    pub fn stats(&self) -> CleanupStats {
        self.stats.lock().clone()
    }

    /// Run one cycle now. Waits for an in-flight cycle first.
    pub async fn run_cleanup(&self) -> CleanupResult {
        let _cycle = self.cycle.lock().await;
        let started = Instant::now();
        let mut result = CleanupResult::default();

        let idle_timeout = self.config.idle_timeout;
        self.evict_matching(&mut result, EvictionReason::Idle, |e| {
            e.state == EntryState::Idle && e.idle_for > idle_timeout
        })
        .await;

        let max_age = self.config.max_connection_age;
        self.evict_matching(&mut result, EvictionReason::Expired, |e| {
            e.state != EntryState::Active && e.age > max_age
        })
        .await;

        self.evict_matching(&mut result, EvictionReason::Unhealthy, |e| {
            e.state == EntryState::Unhealthy || e.over_failure_threshold()
        })
        .await;

        let strategy = self.strategies.eviction();
        let pool_config = &self.pool_config;
        self.evict_matching(&mut result, EvictionReason::Policy, |e| {
            e.state == EntryState::Idle && strategy.should_evict(e, pool_config)
        })
        .await;

        self.enforce_capacity(&mut result).await;
        result.warmup_requests = self.warmup_requests();

        result.duration = started.elapsed();
        self.stats.lock().absorb(&result);

        for request in &result.warmup_requests {
            self.tracer.event(&TraceEvent::WarmupNeeded {
                key: request.key.clone(),
                missing: request.missing,
            });
        }
        self.tracer.event(&TraceEvent::CleanupCompleted {
            cleaned: result.total_cleaned(),
            duration: result.duration,
        });
        if result.total_cleaned() > 0 {
            info!(
                cleaned = result.total_cleaned(),
                errors = result.errors.len(),
                duration = ?result.duration,
                "Cleanup cycle completed"
            );
        }
        result
    }

    async fn evict_matching<F>(
        &self,
        result: &mut CleanupResult,
        reason: EvictionReason,
        matches: F,
    ) where
        F: Fn(&EntrySnapshot) -> bool,
    {
        let victims: Vec<EntrySnapshot> = self
            .entries
            .snapshots()
            .into_iter()
            .filter(|snapshot| matches(snapshot))
            .collect();

        for victim in victims {
            self.evict(result, victim.id, &victim.key, reason).await;
        }
    }

    /// Returns whether the entry left the pool.
    async fn evict(
        &self,
        result: &mut CleanupResult,
        id: EntryId,
        key: &str,
        reason: EvictionReason,
    ) -> bool {
        let evicted = match self.entries.evict(id, reason).await {
            Ok(Some(_)) => true,
            Ok(None) => return false,
            Err(e) => {
                warn!(key = %key, entry = %id, %reason, error = %e, "Eviction failed");
                result.errors.push(e.to_string());
                true
            }
        };

        result.record(reason);
        self.tracer.event(&TraceEvent::ConnectionEvicted {
            key: key.to_string(),
            entry: id,
            reason,
        });
        evicted
    }

    async fn enforce_capacity(&self, result: &mut CleanupResult) {
        while self.entries.len() > self.config.max_connections {
            let snapshots = self.entries.snapshots();
            let Some(victim) = self.strategies.eviction().select_for_eviction(&snapshots) else {
                break;
            };
            let key = snapshots
                .iter()
                .find(|s| s.id == victim)
                .map(|s| s.key.clone())
                .unwrap_or_default();
            if !self.evict(result, victim, &key, EvictionReason::Capacity).await {
                break;
            }
        }
    }

    fn warmup_requests(&self) -> Vec<WarmupRequest> {
        let minimum = self.config.min_connections;
        if minimum == 0 {
            return Vec::new();
        }

        let mut requests: Vec<WarmupRequest> = self
            .destinations
            .iter()
            .filter_map(|destination| {
                let live = self.entries.count_for(destination.key());
                (live < minimum).then(|| WarmupRequest {
                    key: destination.key().clone(),
                    missing: minimum - live,
                })
            })
            .collect();
        requests.sort_by(|a, b| a.key.cmp(&b.key));
        requests
    }

    /// Start the ticker. No-op when disabled or already running.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) -> bool {
        if !self.config.enabled {
            return false;
        }
        let manager = Arc::downgrade(self);
        let interval = self.config.interval;
        self.task.start(Some(parent), move |token| async move {
            let mut tick = ticker(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.run_cleanup().await;
            }
            debug!("Cleanup loop exited");
        })
    }

    /// Stop the ticker and wait for an in-flight cycle.
    pub async fn stop(&self) {
        self.task.stop().await;
    }

    /// One final cycle, then stop.
    pub async fn graceful_shutdown(&self) -> CleanupResult {
        let result = self.run_cleanup().await;
        self.stop().await;
        result
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }
}

impl std::fmt::Debug for CleanupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupManager")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
