//! Key → entries registry with slot reservation.
//!
//! The manager owns every [`PoolEntry`]. Capacity is enforced through
//! [`SlotReservation`]s: a dial reserves a slot before it starts and either
//! commits its entry into the slot or drops the reservation, so live entries
//! plus in-flight dials never exceed the pool's limit.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::error::{PoolError, PoolResult};
use crate::pool::entry::{EntryId, EntrySnapshot, EntryState, PoolEntry};

/// Why an entry left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    /// Idle longer than the idle timeout.
    Idle,
    /// Older than the maximum connection age.
    Expired,
    /// Failed health checks.
    Unhealthy,
    /// Judged evictable by the eviction strategy.
    Policy,
    /// Removed to make room.
    Capacity,
    /// The pool is closing.
    Shutdown,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            EvictionReason::Idle => "idle",
            EvictionReason::Expired => "expired",
            EvictionReason::Unhealthy => "unhealthy",
            EvictionReason::Policy => "policy",
            EvictionReason::Capacity => "capacity",
            EvictionReason::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

/// Notified after an entry has been removed and closed.
#[async_trait]
pub trait EvictionListener: Send + Sync {
    async fn on_evicted(&self, id: EntryId, key: &str, reason: EvictionReason);
}

#[derive(Default)]
struct Inner {
    by_key: HashMap<String, Vec<Arc<PoolEntry>>>,
    reserved: usize,
    closed: bool,
}

impl Inner {
    fn live(&self) -> usize {
        self.by_key.values().map(Vec::len).sum::<usize>() + self.reserved
    }
}

/// Registry of pool entries.
pub struct EntryManager {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
    slot_freed: Notify,
    listeners: RwLock<Vec<Arc<dyn EvictionListener>>>,
}

impl Default for EntryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryManager {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_id: AtomicU64::new(1),
            slot_freed: Notify::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Allocate a fresh entry id.
    pub fn next_id(&self) -> EntryId {
        EntryId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn add_listener(&self, listener: Arc<dyn EvictionListener>) {
        self.listeners.write().push(listener);
    }

    /// Signalled whenever a slot frees up or an entry returns to Idle.
    pub fn slot_freed(&self) -> &Notify {
        &self.slot_freed
    }

    /// Wake every waiter.
    pub fn notify_slot_freed(&self) {
        self.slot_freed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    /// Reserve a slot for a dial if live entries plus reservations are below `max`.
    pub fn try_reserve(&self, max: usize) -> PoolResult<Option<SlotReservation<'_>>> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(PoolError::PoolClosed);
        }
        if inner.live() >= max {
            return Ok(None);
        }
        inner.reserved += 1;
        trace!(live = inner.live(), max, "Slot reserved");
        Ok(Some(SlotReservation {
            manager: self,
            committed: false,
        }))
    }

    /// Live entries plus in-flight dials.
    pub fn live(&self) -> usize {
        self.inner.read().live()
    }

    /// Number of entries (excluding reservations).
    pub fn len(&self) -> usize {
        self.inner.read().by_key.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_for(&self, key: &str) -> usize {
        self.inner.read().by_key.get(key).map_or(0, Vec::len)
    }

    pub fn get(&self, id: EntryId) -> Option<Arc<PoolEntry>> {
        self.inner
            .read()
            .by_key
            .values()
            .flatten()
            .find(|entry| entry.id() == id)
            .cloned()
    }

    /// All entries for `key`.
    pub fn entries_for(&self, key: &str) -> Vec<Arc<PoolEntry>> {
        self.inner
            .read()
            .by_key
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Idle entries for `key`.
    pub fn available(&self, key: &str) -> Vec<Arc<PoolEntry>> {
        self.entries_for(key)
            .into_iter()
            .filter(|entry| entry.state() == EntryState::Idle)
            .collect()
    }

    /// The entry of `key` owning `connection`.
    pub fn find_by_connection(
        &self,
        key: &str,
        connection: &Arc<dyn Connection>,
    ) -> Option<Arc<PoolEntry>> {
        self.inner
            .read()
            .by_key
            .get(key)?
            .iter()
            .find(|entry| entry.holds(connection))
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<PoolEntry>> {
        self.inner
            .read()
            .by_key
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.read().by_key.keys().cloned().collect()
    }

    pub fn by_state(&self, state: EntryState) -> Vec<Arc<PoolEntry>> {
        self.all()
            .into_iter()
            .filter(|entry| entry.state() == state)
            .collect()
    }

    pub fn snapshots(&self) -> Vec<EntrySnapshot> {
        self.all().iter().map(|entry| entry.snapshot()).collect()
    }

    /// Drop an entry from the registry without closing it.
    pub fn remove(&self, id: EntryId) -> Option<Arc<PoolEntry>> {
        let removed = {
            let mut inner = self.inner.write();
            let mut removed = None;
            let mut empty_key = None;
            for (key, entries) in inner.by_key.iter_mut() {
                if let Some(pos) = entries.iter().position(|entry| entry.id() == id) {
                    removed = Some(entries.swap_remove(pos));
                    if entries.is_empty() {
                        empty_key = Some(key.clone());
                    }
                    break;
                }
            }
            if let Some(key) = empty_key {
                inner.by_key.remove(&key);
            }
            removed
        };

        if removed.is_some() {
            self.slot_freed.notify_waiters();
        }
        removed
    }

    /// Close an entry that is not borrowed, remove it and notify listeners.
    ///
    /// Returns `Ok(None)` when the entry is unknown or currently handed out.
    /// A close failure is returned after the entry has been removed.
    pub async fn evict(
        &self,
        id: EntryId,
        reason: EvictionReason,
    ) -> PoolResult<Option<Arc<PoolEntry>>> {
        let Some(entry) = self.get(id) else {
            return Ok(None);
        };

        let closed = entry.close_unless_borrowed().await;
        if matches!(closed, Ok(false)) {
            return Ok(None);
        }

        self.remove(id);
        debug!(key = %entry.key(), entry = %id, %reason, "Entry evicted");
        self.notify_listeners(id, entry.key(), reason).await;

        match closed {
            Ok(_) => Ok(Some(entry)),
            Err(e) => Err(PoolError::connection(entry.key(), e)),
        }
    }

    async fn notify_listeners(&self, id: EntryId, key: &str, reason: EvictionReason) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_evicted(id, key, reason).await;
        }
    }

    /// Mark the registry closed and hand back every entry for closing.
    pub fn drain(&self) -> Vec<Arc<PoolEntry>> {
        let drained: Vec<_> = {
            let mut inner = self.inner.write();
            inner.closed = true;
            inner.by_key.drain().flat_map(|(_, entries)| entries).collect()
        };
        self.slot_freed.notify_waiters();
        drained
    }

    fn release_reservation(&self) {
        let mut inner = self.inner.write();
        inner.reserved = inner.reserved.saturating_sub(1);
    }
}

impl fmt::Debug for EntryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("EntryManager")
            .field("keys", &inner.by_key.len())
            .field("reserved", &inner.reserved)
            .field("closed", &inner.closed)
            .finish()
    }
}

/// A capacity slot held by an in-flight dial.
///
/// Dropping an uncommitted reservation frees the slot and wakes waiters.
pub struct SlotReservation<'a> {
    manager: &'a EntryManager,
    committed: bool,
}

impl SlotReservation<'_> {
    /// Turn the reservation into a live entry. Fails if the registry closed meanwhile.
    pub fn commit(mut self, entry: Arc<PoolEntry>) -> PoolResult<()> {
        let mut inner = self.manager.inner.write();
        if inner.closed {
            return Err(PoolError::PoolClosed);
        }
        inner.reserved = inner.reserved.saturating_sub(1);
        inner
            .by_key
            .entry(entry.key().to_string())
            .or_default()
            .push(entry);
        self.committed = true;
        Ok(())
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.manager.release_reservation();
            self.manager.slot_freed.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::entry::tests::StubConnection;
    use crate::pool::entry::EntryMetadata;
    use parking_lot::Mutex;

    fn make_entry(manager: &EntryManager, key: &str) -> (Arc<PoolEntry>, Arc<StubConnection>) {
        let conn = Arc::new(StubConnection::default());
        let entry = Arc::new(PoolEntry::new(
            manager.next_id(),
            key,
            Arc::clone(&conn) as Arc<dyn Connection>,
            EntryMetadata::default(),
        ));
        (entry, conn)
    }

    #[derive(Default)]
    struct RecordingListener {
        seen: Mutex<Vec<(EntryId, EvictionReason)>>,
    }

    #[async_trait]
    impl EvictionListener for RecordingListener {
        async fn on_evicted(&self, id: EntryId, _key: &str, reason: EvictionReason) {
            self.seen.lock().push((id, reason));
        }
    }

    #[test]
    fn test_reservation_bounds_capacity() {
        let manager = EntryManager::new();
        let first = manager.try_reserve(2).unwrap().unwrap();
        let second = manager.try_reserve(2).unwrap().unwrap();
        assert!(manager.try_reserve(2).unwrap().is_none());
        assert_eq!(manager.live(), 2);

        drop(first);
        assert_eq!(manager.live(), 1);

        let (entry, _) = make_entry(&manager, "ssh://a@h:22");
        second.commit(entry).unwrap();
        assert_eq!(manager.live(), 1);
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.count_for("ssh://a@h:22"), 1);
    }

    #[test]
    fn test_commit_after_drain_fails() {
        let manager = EntryManager::new();
        let reservation = manager.try_reserve(1).unwrap().unwrap();
        manager.drain();

        let (entry, _) = make_entry(&manager, "k");
        assert!(matches!(reservation.commit(entry), Err(PoolError::PoolClosed)));
        assert!(matches!(manager.try_reserve(1), Err(PoolError::PoolClosed)));
        assert_eq!(manager.live(), 0);
    }

    #[test]
    fn test_lookup_by_connection_and_state() {
        let manager = EntryManager::new();
        let (a, _) = make_entry(&manager, "k");
        let (b, _) = make_entry(&manager, "k");
        for entry in [&a, &b] {
            manager
                .try_reserve(10)
                .unwrap()
                .unwrap()
                .commit(Arc::clone(entry))
                .unwrap();
        }

        let conn = b.try_acquire().unwrap();
        let found = manager.find_by_connection("k", &conn).unwrap();
        assert_eq!(found.id(), b.id());
        assert!(manager.find_by_connection("other", &conn).is_none());

        assert_eq!(manager.available("k").len(), 1);
        assert_eq!(manager.by_state(EntryState::Active).len(), 1);
        assert_eq!(manager.keys(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_evict_skips_active_and_notifies() {
        let manager = EntryManager::new();
        let listener = Arc::new(RecordingListener::default());
        manager.add_listener(Arc::clone(&listener) as Arc<dyn EvictionListener>);

        let (entry, conn) = make_entry(&manager, "k");
        manager
            .try_reserve(1)
            .unwrap()
            .unwrap()
            .commit(Arc::clone(&entry))
            .unwrap();

        let _borrowed = entry.try_acquire().unwrap();
        assert!(manager
            .evict(entry.id(), EvictionReason::Capacity)
            .await
            .unwrap()
            .is_none());
        assert_eq!(manager.len(), 1);

        entry.release();
        let evicted = manager
            .evict(entry.id(), EvictionReason::Idle)
            .await
            .unwrap();
        assert!(evicted.is_some());
        assert!(manager.is_empty());
        assert_eq!(
            conn.closes.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert_eq!(
            listener.seen.lock().as_slice(),
            &[(entry.id(), EvictionReason::Idle)]
        );
    }

    #[tokio::test]
    async fn test_dropped_reservation_wakes_waiter() {
        let manager = Arc::new(EntryManager::new());
        let reservation_holder = Arc::clone(&manager);

        let notified = manager.slot_freed().notified();
        {
            let _reservation = reservation_holder.try_reserve(1).unwrap().unwrap();
        }
        tokio::time::timeout(std::time::Duration::from_millis(100), notified)
            .await
            .unwrap();
    }
}
