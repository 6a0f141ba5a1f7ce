//! Pool-wide health loop: alerts and connection replacement.
//!
//! [`PoolHealthIntegration`] sees the pool only through the [`Pool`] trait and
//! the shared [`PoolHealthMonitor`]. The pool keeps no reference back to it,
//! and the integration holds the pool weakly: dropping the last pool handle
//! ends the loop without a `close()`.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{AlertThresholds, HealthConfig};
use crate::context::Context;
use crate::error::{PoolError, PoolResult};
use crate::pool::health::{HealthReport, PoolHealthMonitor};
use crate::pool::task::{ticker, BackgroundTask};
use crate::pool::Pool;
use crate::telemetry::{TraceEvent, Tracer};

const ALERT_CHANNEL_CAPACITY: usize = 64;

/// A crossed health threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    /// More unhealthy results than allowed in one cycle.
    TooManyFailures { unhealthy: usize, threshold: usize },
    /// Fewer healthy results than required on a non-empty pool.
    LowHealthyCount { healthy: usize, minimum: usize },
    /// Average probe latency above the limit.
    SlowResponses { average: Duration, threshold: Duration },
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alert::TooManyFailures {
                unhealthy,
                threshold,
            } => write!(
                f,
                "{} unhealthy connection(s), threshold {}",
                unhealthy, threshold
            ),
            Alert::LowHealthyCount { healthy, minimum } => write!(
                f,
                "only {} healthy connection(s), minimum {}",
                healthy, minimum
            ),
            Alert::SlowResponses { average, threshold } => write!(
                f,
                "average response time {:?} above {:?}",
                average, threshold
            ),
        }
    }
}

/// Evaluate `thresholds` against one report.
pub fn evaluate_alerts(report: &HealthReport, thresholds: &AlertThresholds) -> Vec<Alert> {
    let mut alerts = Vec::new();
    if !thresholds.enabled || report.total == 0 {
        return alerts;
    }

    if report.unhealthy > thresholds.max_connection_failures {
        alerts.push(Alert::TooManyFailures {
            unhealthy: report.unhealthy,
            threshold: thresholds.max_connection_failures,
        });
    }
    if report.healthy < thresholds.min_healthy_connections {
        alerts.push(Alert::LowHealthyCount {
            healthy: report.healthy,
            minimum: thresholds.min_healthy_connections,
        });
    }
    if report.average_response_time > thresholds.max_average_response_time {
        alerts.push(Alert::SlowResponses {
            average: report.average_response_time,
            threshold: thresholds.max_average_response_time,
        });
    }
    alerts
}

/// Counters of the integration loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntegrationStats {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub alerts_raised: u64,
    pub replacements_attempted: u64,
    pub replacements_succeeded: u64,
    pub replacements_failed: u64,
    pub last_cycle: Option<DateTime<Utc>>,
}

/// Couples the health monitor to the pool.
pub struct PoolHealthIntegration {
    pool: Weak<dyn Pool>,
    monitor: Arc<PoolHealthMonitor>,
    health: HealthConfig,
    thresholds: AlertThresholds,
    tracer: Arc<dyn Tracer>,
    alerts: broadcast::Sender<Alert>,
    stats: Mutex<IntegrationStats>,
    task: BackgroundTask,
}

impl PoolHealthIntegration {
    pub fn new(
        pool: &Arc<dyn Pool>,
        monitor: Arc<PoolHealthMonitor>,
        health: HealthConfig,
        thresholds: AlertThresholds,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            pool: Arc::downgrade(pool),
            monitor,
            health,
            thresholds,
            tracer,
            alerts,
            stats: Mutex::new(IntegrationStats::default()),
            task: BackgroundTask::new("health-integration"),
        }
    }

    /// Receive every alert raised from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    pub fn stats(&self) -> IntegrationStats {
        self.stats.lock().clone()
    }

    /// Start the loop on the pool's task tracker. No-op when running or when the pool is closed.
    pub fn start(self: &Arc<Self>) -> bool {
        let Some(pool) = self.pool.upgrade() else {
            return false;
        };
        let signal = pool.shutdown_signal();
        drop(pool);
        if signal.token.is_cancelled() {
            return false;
        }

        let integration = Arc::clone(self);
        let interval = self.health.integration_interval;
        self.task
            .start_on(&signal.tracker, Some(&signal.token), move |token| async move {
                let mut tick = ticker(interval);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tick.tick() => {}
                    }
                    let ctx = Context::from_token(token.child_token());
                    if let Err(e) = integration.run_cycle(&ctx).await {
                        warn!(error = %e, "Health integration cycle failed");
                    }
                }
                debug!("Health integration loop exited");
            })
    }

    /// Stop the loop and wait for it.
    pub async fn stop(&self) {
        self.task.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// One cycle: probe, raise alerts, replace unhealthy keys.
    pub async fn run_cycle(&self, ctx: &Context) -> PoolResult<Vec<Alert>> {
        let pool = self.pool()?;
        let report = pool.health_check(ctx).await;
        drop(pool);
        let alerts = evaluate_alerts(&report, &self.thresholds);

        for alert in &alerts {
            warn!(alert = %alert, "Pool health alert");
            self.tracer.event(&TraceEvent::Alert(alert.clone()));
            // No subscribers is fine.
            let _ = self.alerts.send(alert.clone());
        }

        let mut outcome = Ok(());
        for key in report.unhealthy_keys() {
            if ctx.is_cancelled() {
                outcome = Err(PoolError::Cancelled { key });
                break;
            }
            if let Err(e) = self.replace_connection(ctx, &key).await {
                warn!(key = %key, error = %e, "Connection replacement failed");
                if matches!(e, PoolError::PoolClosed | PoolError::Cancelled { .. }) {
                    outcome = Err(e);
                    break;
                }
            }
        }

        {
            let mut stats = self.stats.lock();
            stats.cycles += 1;
            stats.alerts_raised += alerts.len() as u64;
            stats.last_cycle = Some(Utc::now());
            if outcome.is_err() {
                stats.failed_cycles += 1;
            }
        }
        outcome.map(|()| alerts)
    }

    /// Get a working connection for `key` through the pool.
    ///
    /// The key's checkers are unregistered for the duration. Checkers whose
    /// entries are still open are re-registered on success; after the last
    /// failed attempt the key stays deregistered.
    pub async fn replace_connection(&self, ctx: &Context, key: &str) -> PoolResult<()> {
        let pool = self.pool()?;
        self.stats.lock().replacements_attempted += 1;
        let removed = self.monitor.unregister_key(key).await;
        debug!(key = %key, checkers = removed.len(), "Replacing unhealthy connection");

        let attempts = self.health.recovery_retries;
        let mut last_error = None;
        for attempt in 1..=attempts {
            ctx.sleep(self.health.recovery_delay * attempt)
                .await
                .map_err(|_| PoolError::Cancelled {
                    key: key.to_string(),
                })?;

            let acquired = match pool.get(ctx, key).await {
                Ok(connection) => pool.release(key, &connection).await,
                Err(e) => Err(e),
            };

            match acquired {
                Ok(()) => {
                    for checker in removed {
                        if !checker.entry().is_closed() {
                            self.monitor.register(checker);
                        }
                    }
                    self.stats.lock().replacements_succeeded += 1;
                    info!(key = %key, attempt, "Unhealthy connection replaced");
                    return Ok(());
                }
                Err(PoolError::PoolClosed) => return Err(PoolError::PoolClosed),
                Err(e) => {
                    debug!(key = %key, attempt, error = %e, "Replacement attempt failed");
                    last_error = Some(Box::new(e));
                }
            }
        }

        self.stats.lock().replacements_failed += 1;
        self.tracer.event(&TraceEvent::RecoveryExhausted {
            key: key.to_string(),
            attempts,
        });
        Err(PoolError::RecoveryExhausted {
            key: key.to_string(),
            attempts,
            last_error,
        })
    }
}

impl PoolHealthIntegration {
    fn pool(&self) -> PoolResult<Arc<dyn Pool>> {
        self.pool.upgrade().ok_or(PoolError::PoolClosed)
    }
}

impl fmt::Debug for PoolHealthIntegration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHealthIntegration")
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::entry::EntryId;
    use crate::pool::health::HealthResult;

    fn report(healthy: usize, unhealthy: usize, latency: Duration) -> HealthReport {
        let results = (0..healthy + unhealthy)
            .map(|i| HealthResult {
                key: format!("ssh://u@h{}:22", i),
                entry_id: EntryId::new(i as u64),
                healthy: i < healthy,
                response_time: latency,
                error: None,
                timestamp: Utc::now(),
            })
            .collect();
        HealthReport::from_results(results)
    }

    #[test]
    fn test_no_alerts_for_healthy_pool() {
        let alerts = evaluate_alerts(
            &report(3, 0, Duration::from_millis(5)),
            &AlertThresholds::default(),
        );
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_threshold_alerts() {
        let thresholds = AlertThresholds {
            enabled: true,
            max_connection_failures: 1,
            min_healthy_connections: 2,
            max_average_response_time: Duration::from_millis(100),
        };
        let alerts = evaluate_alerts(&report(1, 2, Duration::from_millis(250)), &thresholds);
        assert_eq!(
            alerts,
            vec![
                Alert::TooManyFailures {
                    unhealthy: 2,
                    threshold: 1
                },
                Alert::LowHealthyCount {
                    healthy: 1,
                    minimum: 2
                },
                Alert::SlowResponses {
                    average: Duration::from_millis(250),
                    threshold: Duration::from_millis(100)
                },
            ]
        );
    }

    #[test]
    fn test_empty_pool_raises_nothing() {
        let thresholds = AlertThresholds {
            min_healthy_connections: 5,
            ..AlertThresholds::default()
        };
        assert!(evaluate_alerts(&report(0, 0, Duration::ZERO), &thresholds).is_empty());
    }

    #[test]
    fn test_alert_display() {
        let alert = Alert::LowHealthyCount {
            healthy: 0,
            minimum: 2,
        };
        assert_eq!(alert.to_string(), "only 0 healthy connection(s), minimum 2");
    }
}
