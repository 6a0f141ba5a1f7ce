//! Leak detection: a shadow ledger of connection lifetimes.
//!
//! The detector does not read pool bookkeeping. The pool reports creations,
//! uses and closures, and the detector flags connections that live past
//! their expected lifetime.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LeakDetectionConfig;
use crate::pool::entry::EntryId;
use crate::pool::manager::{EvictionListener, EvictionReason};
use crate::pool::task::{ticker, BackgroundTask};
use crate::telemetry::{TraceEvent, Tracer};

/// Ledger record of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionLifecycle {
    pub key: String,
    pub entry_id: EntryId,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub use_count: u64,
    pub warning_issued: bool,
    pub leak_suspected: bool,
}

impl ConnectionLifecycle {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Invoked once per newly suspected leak, on its own task.
pub type LeakCallback = Arc<dyn Fn(ConnectionLifecycle) + Send + Sync>;

/// Flags connections that outlive their expected lifetime.
pub struct ConnectionLeakDetector {
    config: LeakDetectionConfig,
    ledger: DashMap<EntryId, ConnectionLifecycle>,
    callback: Option<LeakCallback>,
    tracer: Arc<dyn Tracer>,
    task: BackgroundTask,
}

impl ConnectionLeakDetector {
    pub fn new(
        config: LeakDetectionConfig,
        callback: Option<LeakCallback>,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        Self {
            config,
            ledger: DashMap::new(),
            callback,
            tracer,
            task: BackgroundTask::new("leak-detector"),
        }
    }

    pub fn track_connection(&self, entry_id: EntryId, key: &str) {
        let now = Instant::now();
        self.ledger.insert(
            entry_id,
            ConnectionLifecycle {
                key: key.to_string(),
                entry_id,
                created_at: now,
                last_activity: now,
                use_count: 0,
                warning_issued: false,
                leak_suspected: false,
            },
        );
    }

    pub fn update_connection_activity(&self, entry_id: EntryId) {
        if let Some(mut record) = self.ledger.get_mut(&entry_id) {
            record.last_activity = Instant::now();
            record.use_count += 1;
        }
    }

    pub fn untrack_connection(&self, entry_id: EntryId) -> Option<ConnectionLifecycle> {
        self.ledger.remove(&entry_id).map(|(_, record)| record)
    }

    pub fn lifecycle(&self, entry_id: EntryId) -> Option<ConnectionLifecycle> {
        self.ledger.get(&entry_id).map(|r| r.value().clone())
    }

    pub fn tracked(&self) -> usize {
        self.ledger.len()
    }

    /// Every record currently flagged.
    pub fn suspected_leaks(&self) -> Vec<ConnectionLifecycle> {
        self.ledger
            .iter()
            .filter(|r| r.value().leak_suspected)
            .map(|r| r.value().clone())
            .collect()
    }

    /// Scan the ledger. Returns the records newly flagged by this scan.
    pub fn check_for_leaks(&self) -> Vec<ConnectionLifecycle> {
        let mut newly_suspected = Vec::new();

        for mut record in self.ledger.iter_mut() {
            let age = record.age();

            if age > self.config.warning_threshold && !record.warning_issued {
                record.warning_issued = true;
                warn!(
                    key = %record.key,
                    entry = %record.entry_id,
                    age = ?age,
                    uses = record.use_count,
                    "Long-lived connection"
                );
            }

            if age > self.config.max_lifetime && !record.leak_suspected {
                record.leak_suspected = true;
                newly_suspected.push(record.value().clone());
            }
        }

        for record in &newly_suspected {
            warn!(
                key = %record.key,
                entry = %record.entry_id,
                idle = ?record.idle_for(),
                "Connection suspected leaked"
            );
            self.tracer.event(&TraceEvent::LeakSuspected {
                key: record.key.clone(),
                entry: record.entry_id,
                age: record.age(),
            });
            if let Some(callback) = &self.callback {
                let callback = Arc::clone(callback);
                let record = record.clone();
                tokio::spawn(async move { callback(record) });
            }
        }

        newly_suspected
    }

    /// Start the periodic scan. No-op when disabled or already running.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) -> bool {
        if !self.config.enabled {
            return false;
        }
        let detector = Arc::downgrade(self);
        let interval = self.config.check_interval;
        self.task.start(Some(parent), move |token| async move {
            let mut tick = ticker(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let Some(detector) = detector.upgrade() else {
                    break;
                };
                detector.check_for_leaks();
            }
            debug!("Leak detector loop exited");
        })
    }

    pub async fn stop(&self) {
        self.task.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }
}

impl std::fmt::Debug for ConnectionLeakDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLeakDetector")
            .field("config", &self.config)
            .field("tracked", &self.tracked())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EvictionListener for ConnectionLeakDetector {
    async fn on_evicted(&self, id: EntryId, _key: &str, _reason: EvictionReason) {
        self.untrack_connection(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::NoopTracer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn detector(callback: Option<LeakCallback>) -> ConnectionLeakDetector {
        ConnectionLeakDetector::new(
            LeakDetectionConfig {
                enabled: true,
                check_interval: Duration::from_millis(10),
                warning_threshold: Duration::from_millis(20),
                max_lifetime: Duration::from_millis(50),
            },
            callback,
            Arc::new(NoopTracer),
        )
    }

    #[tokio::test]
    async fn test_warning_then_leak_flag() {
        let detector = detector(None);
        detector.track_connection(EntryId::new(1), "ssh://a@h:22");

        assert!(detector.check_for_leaks().is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(detector.check_for_leaks().is_empty());
        let record = detector.lifecycle(EntryId::new(1)).unwrap();
        assert!(record.warning_issued);
        assert!(!record.leak_suspected);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let flagged = detector.check_for_leaks();
        assert_eq!(flagged.len(), 1);
        assert!(detector.check_for_leaks().is_empty());
        assert_eq!(detector.suspected_leaks().len(), 1);
    }

    #[tokio::test]
    async fn test_callback_invoked_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let callback: LeakCallback = Arc::new(move |_record| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let detector = detector(Some(callback));
        detector.track_connection(EntryId::new(7), "k");
        tokio::time::sleep(Duration::from_millis(60)).await;
        detector.check_for_leaks();
        detector.check_for_leaks();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_activity_and_untrack() {
        let detector = detector(None);
        detector.track_connection(EntryId::new(2), "k");
        detector.update_connection_activity(EntryId::new(2));
        detector.update_connection_activity(EntryId::new(2));
        assert_eq!(detector.lifecycle(EntryId::new(2)).unwrap().use_count, 2);

        detector.on_evicted(EntryId::new(2), "k", EvictionReason::Idle).await;
        assert_eq!(detector.tracked(), 0);
    }

    #[tokio::test]
    async fn test_loop_flags_leaks() {
        let detector = Arc::new(detector(None));
        detector.track_connection(EntryId::new(3), "k");
        let root = CancellationToken::new();
        assert!(detector.start(&root));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(detector.suspected_leaks().len(), 1);

        root.cancel();
        detector.stop().await;
        assert!(!detector.is_running());
    }
}
