//! Pool entries: one live connection plus its lifecycle state.
//!
//! ```text
//!            acquire              release
//!   Idle ───────────────► Active ─────────► Idle
//!    │ ▲                    │
//!    │ └── healthy check ── Unhealthy ◄── failed check
//!    └──────────────── close (any state) ──────────► Closed
//! ```
//!
//! `in_use` is derived from the state, so it can never disagree with it.
//! Whether a caller holds the connection is tracked separately as
//! `borrowed`: a failed check moves a borrowed entry to Unhealthy, but the
//! pool never closes or replaces its connection until it is released.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::connection::{same_connection, Connection, ConnectionConfig, ConnectionResult};
use crate::error::{PoolError, PoolResult};

/// Entries with more health failures than this are evictable regardless of idle time.
pub const MAX_HEALTH_FAILURES: u32 = 3;

/// Stable identifier of a pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl EntryId {
    /// Wrap a raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// Available for `get`.
    Idle,
    /// Handed out to a caller.
    Active,
    /// Failed its last health check.
    Unhealthy,
    /// Terminal. The connection has been taken and closed.
    Closed,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryState::Idle => "idle",
            EntryState::Active => "active",
            EntryState::Unhealthy => "unhealthy",
            EntryState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// How an entry came into the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryOrigin {
    /// Dialed by `get` on a miss.
    #[default]
    OnDemand,
    /// Dialed ahead of demand.
    Prewarm,
    /// Dialed to replace a failed connection.
    Recovery,
}

/// Diagnostic metadata attached to an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryMetadata {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub origin: EntryOrigin,
    /// Successful connection replacements.
    pub recoveries: u32,
    /// Most recent health or recovery error.
    pub last_error: Option<String>,
    /// Free-form labels.
    pub tags: HashMap<String, String>,
}

impl EntryMetadata {
    /// Metadata describing a connection dialed for `config`.
    pub fn from_config(config: &ConnectionConfig, origin: EntryOrigin) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            origin,
            ..Self::default()
        }
    }
}

/// Point-in-time copy of an entry's scalar fields.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    pub id: EntryId,
    pub key: String,
    pub state: EntryState,
    pub use_count: u64,
    pub health_failures: u32,
    /// Handed out and not yet released, whatever the health state.
    pub borrowed: bool,
    /// Time since the entry was last acquired or released.
    pub idle_for: Duration,
    /// Time since the entry was created.
    pub age: Duration,
}

impl EntrySnapshot {
    /// Whether the entry is handed out.
    pub fn in_use(&self) -> bool {
        self.state == EntryState::Active
    }

    /// More than [`MAX_HEALTH_FAILURES`] failed checks.
    pub fn over_failure_threshold(&self) -> bool {
        self.health_failures > MAX_HEALTH_FAILURES
    }
}

struct EntryInner {
    connection: Option<Arc<dyn Connection>>,
    state: EntryState,
    borrowed: bool,
    created_at: Instant,
    last_used: Instant,
    last_health_check: Option<Instant>,
    use_count: u64,
    health_failures: u32,
    metadata: EntryMetadata,
}

/// A pooled connection and its bookkeeping.
pub struct PoolEntry {
    id: EntryId,
    key: String,
    inner: RwLock<EntryInner>,
}

impl PoolEntry {
    /// Wrap a connected transport in an Idle entry.
    pub fn new(
        id: EntryId,
        key: impl Into<String>,
        connection: Arc<dyn Connection>,
        metadata: EntryMetadata,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            key: key.into(),
            inner: RwLock::new(EntryInner {
                connection: Some(connection),
                state: EntryState::Idle,
                borrowed: false,
                created_at: now,
                last_used: now,
                last_health_check: None,
                use_count: 0,
                health_failures: 0,
                metadata,
            }),
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> EntryState {
        self.inner.read().state
    }

    /// Whether the entry is handed out.
    pub fn in_use(&self) -> bool {
        self.state() == EntryState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state() == EntryState::Closed
    }

    /// Whether a caller holds the connection.
    pub fn is_borrowed(&self) -> bool {
        self.inner.read().borrowed
    }

    pub fn use_count(&self) -> u64 {
        self.inner.read().use_count
    }

    pub fn health_failures(&self) -> u32 {
        self.inner.read().health_failures
    }

    /// The connection, unless it has been taken or the entry is closed.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.inner.read().connection.clone()
    }

    /// Whether `connection` is the one this entry owns.
    pub fn holds(&self, connection: &Arc<dyn Connection>) -> bool {
        self.inner
            .read()
            .connection
            .as_ref()
            .is_some_and(|own| same_connection(own, connection))
    }

    pub fn created_at(&self) -> Instant {
        self.inner.read().created_at
    }

    pub fn last_used(&self) -> Instant {
        self.inner.read().last_used
    }

    pub fn last_health_check(&self) -> Option<Instant> {
        self.inner.read().last_health_check
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.read().last_used.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.inner.read().created_at.elapsed()
    }

    pub fn metadata(&self) -> EntryMetadata {
        self.inner.read().metadata.clone()
    }

    /// Attach a free-form label.
    pub fn set_tag(&self, name: impl Into<String>, value: impl Into<String>) {
        self.inner
            .write()
            .metadata
            .tags
            .insert(name.into(), value.into());
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        let inner = self.inner.read();
        EntrySnapshot {
            id: self.id,
            key: self.key.clone(),
            state: inner.state,
            use_count: inner.use_count,
            health_failures: inner.health_failures,
            borrowed: inner.borrowed,
            idle_for: inner.last_used.elapsed(),
            age: inner.created_at.elapsed(),
        }
    }

    /// Idle → Active. Returns the connection on success.
    ///
    /// An Idle entry whose transport reports itself disconnected is moved to
    /// Unhealthy instead of being handed out.
    pub fn try_acquire(&self) -> Option<Arc<dyn Connection>> {
        let mut inner = self.inner.write();
        if inner.state != EntryState::Idle {
            return None;
        }
        let connection = inner.connection.clone()?;

        if !connection.is_connected() {
            inner.state = EntryState::Unhealthy;
            inner.health_failures += 1;
            inner.metadata.last_error = Some("transport disconnected".to_string());
            debug!(key = %self.key, entry = %self.id, "Idle connection found disconnected");
            return None;
        }

        inner.state = EntryState::Active;
        inner.borrowed = true;
        inner.use_count += 1;
        inner.last_used = Instant::now();
        trace!(key = %self.key, entry = %self.id, uses = inner.use_count, "Entry acquired");
        Some(connection)
    }

    /// Active → Idle. An Unhealthy entry stays Unhealthy; other states are untouched.
    /// The borrow ends in every case.
    ///
    /// Returns whether the entry became Idle.
    pub fn release(&self) -> bool {
        let mut inner = self.inner.write();
        inner.borrowed = false;
        match inner.state {
            EntryState::Active => {
                inner.state = EntryState::Idle;
                inner.last_used = Instant::now();
                true
            }
            EntryState::Unhealthy => {
                inner.last_used = Instant::now();
                false
            }
            EntryState::Idle | EntryState::Closed => false,
        }
    }

    /// Record a failed health check. Returns the failure count.
    pub fn mark_unhealthy(&self, error: impl Into<String>) -> u32 {
        let mut inner = self.inner.write();
        if inner.state == EntryState::Closed {
            return inner.health_failures;
        }
        inner.state = EntryState::Unhealthy;
        inner.health_failures += 1;
        inner.last_health_check = Some(Instant::now());
        inner.metadata.last_error = Some(error.into());
        inner.health_failures
    }

    /// Record a successful health check: failures reset, Unhealthy → Idle.
    ///
    /// A borrowed entry goes back to Active instead, so it cannot be handed
    /// out twice.
    pub fn mark_healthy(&self) {
        let mut inner = self.inner.write();
        if inner.state == EntryState::Closed {
            return;
        }
        inner.health_failures = 0;
        inner.last_health_check = Some(Instant::now());
        if inner.state == EntryState::Unhealthy {
            inner.state = if inner.borrowed {
                EntryState::Active
            } else {
                EntryState::Idle
            };
        }
    }

    /// Take the connection out for replacement, leaving the state untouched.
    ///
    /// Refused while the entry is borrowed. Once taken, the entry cannot be
    /// acquired until a new connection is installed.
    pub fn take_connection(&self) -> PoolResult<Option<Arc<dyn Connection>>> {
        let mut inner = self.inner.write();
        if inner.borrowed {
            return Err(PoolError::HealthCheck {
                key: self.key.clone(),
                message: format!("connection of entry {} is borrowed", self.id),
            });
        }
        Ok(inner.connection.take())
    }

    /// Install a freshly dialed and probed connection: state Idle, failures reset.
    ///
    /// Returns the connection back as `Err` when the entry was closed or
    /// borrowed meanwhile, and the displaced connection, if any, as `Ok`.
    pub fn replace_connection(
        &self,
        connection: Arc<dyn Connection>,
    ) -> Result<Option<Arc<dyn Connection>>, Arc<dyn Connection>> {
        let mut inner = self.inner.write();
        if inner.state == EntryState::Closed || inner.borrowed {
            return Err(connection);
        }
        let previous = inner.connection.replace(connection);
        let now = Instant::now();
        inner.state = EntryState::Idle;
        inner.health_failures = 0;
        inner.last_health_check = Some(now);
        inner.last_used = now;
        inner.metadata.recoveries += 1;
        inner.metadata.last_error = None;
        Ok(previous)
    }

    /// Any state → Closed. The connection is closed exactly once; later calls return `Ok`.
    pub async fn close(&self) -> ConnectionResult<()> {
        let connection = {
            let mut inner = self.inner.write();
            inner.state = EntryState::Closed;
            inner.borrowed = false;
            inner.connection.take()
        };

        match connection {
            Some(connection) => {
                debug!(key = %self.key, entry = %self.id, "Closing pooled connection");
                connection.close().await
            }
            None => Ok(()),
        }
    }

    /// Close unless the entry is handed out. Returns whether it was closed.
    ///
    /// The borrow check and the transition to Closed happen under one lock, so
    /// an entry cannot be acquired and retired at the same time.
    pub async fn close_unless_borrowed(&self) -> ConnectionResult<bool> {
        let connection = {
            let mut inner = self.inner.write();
            if inner.borrowed {
                return Ok(false);
            }
            inner.state = EntryState::Closed;
            inner.connection.take()
        };

        if let Some(connection) = connection {
            debug!(key = %self.key, entry = %self.id, "Retiring pooled connection");
            connection.close().await?;
        }
        Ok(true)
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, last_used: Duration, created: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.write();
        inner.last_used = now.checked_sub(last_used).unwrap_or(now);
        inner.created_at = now.checked_sub(created).unwrap_or(now);
    }
}

impl fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("PoolEntry")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &inner.state)
            .field("use_count", &inner.use_count)
            .field("health_failures", &inner.health_failures)
            .finish()
    }
}
