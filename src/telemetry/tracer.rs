//! Injected tracer for pool spans and lifecycle events.
//!
//! Every pool component receives an `Arc<dyn Tracer>` through its constructor.
//! [`NoopTracer`] is the default when nothing is injected; [`TracingTracer`]
//! forwards everything to the `tracing` ecosystem.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info, info_span, warn, Level, Span};

use crate::pool::entry::EntryId;
use crate::pool::integration::Alert;
use crate::pool::manager::EvictionReason;

/// A lifecycle event emitted by the pool and its background tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    /// A new connection was dialed and added to the pool.
    ConnectionCreated { key: String, entry: EntryId },
    /// An idle connection was handed out again.
    ConnectionReused { key: String, entry: EntryId },
    /// A connection was returned to the pool.
    ConnectionReleased { key: String, entry: EntryId },
    /// The factory or the dial failed.
    ConnectionFailed { key: String, error: String },
    /// An entry was removed from the pool and closed.
    ConnectionEvicted {
        key: String,
        entry: EntryId,
        reason: EvictionReason,
    },
    /// `get` gave up waiting for a slot.
    PoolExhausted { key: String, waited: Duration },
    /// A liveness probe failed.
    HealthCheckFailed {
        key: String,
        entry: EntryId,
        error: String,
    },
    /// A recovery sequence started.
    RecoveryStarted { key: String },
    /// A recovery sequence installed a working connection.
    RecoverySucceeded { key: String, attempts: u32 },
    /// Every recovery attempt failed.
    RecoveryExhausted { key: String, attempts: u32 },
    /// A health alert threshold was crossed.
    Alert(Alert),
    /// A connection outlived its expected lifetime.
    LeakSuspected {
        key: String,
        entry: EntryId,
        age: Duration,
    },
    /// A key is below its minimum connection count.
    WarmupNeeded { key: String, missing: usize },
    /// A cleanup cycle finished.
    CleanupCompleted { cleaned: usize, duration: Duration },
    /// The pool was closed.
    PoolClosed { errors: usize },
}

impl TraceEvent {
    /// Severity used when forwarding to `tracing`.
    pub fn level(&self) -> Level {
        match self {
            TraceEvent::ConnectionReused { .. } | TraceEvent::ConnectionReleased { .. } => {
                Level::TRACE
            }
            TraceEvent::ConnectionCreated { .. }
            | TraceEvent::ConnectionEvicted { .. }
            | TraceEvent::RecoveryStarted { .. }
            | TraceEvent::CleanupCompleted { .. } => Level::DEBUG,
            TraceEvent::RecoverySucceeded { .. }
            | TraceEvent::WarmupNeeded { .. }
            | TraceEvent::PoolClosed { .. } => Level::INFO,
            TraceEvent::ConnectionFailed { .. }
            | TraceEvent::PoolExhausted { .. }
            | TraceEvent::HealthCheckFailed { .. }
            | TraceEvent::RecoveryExhausted { .. }
            | TraceEvent::Alert(_)
            | TraceEvent::LeakSuspected { .. } => Level::WARN,
        }
    }

    /// Short machine-friendly name.
    pub fn name(&self) -> &'static str {
        match self {
            TraceEvent::ConnectionCreated { .. } => "connection_created",
            TraceEvent::ConnectionReused { .. } => "connection_reused",
            TraceEvent::ConnectionReleased { .. } => "connection_released",
            TraceEvent::ConnectionFailed { .. } => "connection_failed",
            TraceEvent::ConnectionEvicted { .. } => "connection_evicted",
            TraceEvent::PoolExhausted { .. } => "pool_exhausted",
            TraceEvent::HealthCheckFailed { .. } => "health_check_failed",
            TraceEvent::RecoveryStarted { .. } => "recovery_started",
            TraceEvent::RecoverySucceeded { .. } => "recovery_succeeded",
            TraceEvent::RecoveryExhausted { .. } => "recovery_exhausted",
            TraceEvent::Alert(_) => "alert",
            TraceEvent::LeakSuspected { .. } => "leak_suspected",
            TraceEvent::WarmupNeeded { .. } => "warmup_needed",
            TraceEvent::CleanupCompleted { .. } => "cleanup_completed",
            TraceEvent::PoolClosed { .. } => "pool_closed",
        }
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEvent::ConnectionCreated { key, entry } => {
                write!(f, "created connection {} for {}", entry, key)
            }
            TraceEvent::ConnectionReused { key, entry } => {
                write!(f, "reused connection {} for {}", entry, key)
            }
            TraceEvent::ConnectionReleased { key, entry } => {
                write!(f, "released connection {} for {}", entry, key)
            }
            TraceEvent::ConnectionFailed { key, error } => {
                write!(f, "connection to {} failed: {}", key, error)
            }
            TraceEvent::ConnectionEvicted { key, entry, reason } => {
                write!(f, "evicted connection {} for {} ({})", entry, key, reason)
            }
            TraceEvent::PoolExhausted { key, waited } => {
                write!(f, "pool exhausted for {} after {:?}", key, waited)
            }
            TraceEvent::HealthCheckFailed { key, entry, error } => {
                write!(f, "health check of {} for {} failed: {}", entry, key, error)
            }
            TraceEvent::RecoveryStarted { key } => write!(f, "recovering {}", key),
            TraceEvent::RecoverySucceeded { key, attempts } => {
                write!(f, "recovered {} after {} attempt(s)", key, attempts)
            }
            TraceEvent::RecoveryExhausted { key, attempts } => {
                write!(f, "recovery of {} failed after {} attempt(s)", key, attempts)
            }
            TraceEvent::Alert(alert) => write!(f, "alert: {}", alert),
            TraceEvent::LeakSuspected { key, entry, age } => {
                write!(f, "connection {} for {} suspected leaked (age {:?})", entry, key, age)
            }
            TraceEvent::WarmupNeeded { key, missing } => {
                write!(f, "{} needs {} more connection(s)", key, missing)
            }
            TraceEvent::CleanupCompleted { cleaned, duration } => {
                write!(f, "cleanup removed {} connection(s) in {:?}", cleaned, duration)
            }
            TraceEvent::PoolClosed { errors } => write!(f, "pool closed with {} error(s)", errors),
        }
    }
}

/// Structured span/event sink.
pub trait Tracer: Send + Sync + fmt::Debug {
    /// Open a span for a pool operation on `key`.
    fn span(&self, operation: &'static str, key: &str) -> Span;

    /// Record a lifecycle event.
    fn event(&self, event: &TraceEvent);
}

/// Discards everything. The default tracer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn span(&self, _operation: &'static str, _key: &str) -> Span {
        Span::none()
    }

    fn event(&self, _event: &TraceEvent) {}
}

/// Emits spans and events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn span(&self, operation: &'static str, key: &str) -> Span {
        info_span!(
            "pool",
            otel.name = %operation,
            otel.kind = "internal",
            pool.key = %key,
            status = tracing::field::Empty,
        )
    }

    fn event(&self, event: &TraceEvent) {
        let name = event.name();
        match event.level() {
            Level::WARN | Level::ERROR => warn!(event = name, "{}", event),
            Level::INFO => info!(event = name, "{}", event),
            _ => debug!(event = name, "{}", event),
        }
    }
}
