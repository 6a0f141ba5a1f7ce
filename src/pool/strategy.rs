//! Eviction strategies and selection among idle connections.
//!
//! An [`EvictionStrategy`] answers two questions for the cleanup manager and
//! for `get` at capacity: which idle entry should go first, and whether a
//! given entry should go at all. The [`StrategyManager`] composes a strategy
//! with a [`LoadBalancingMode`] and an [`AffinityMode`] to pick one of several
//! idle connections for the same key.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::pool::entry::{EntryId, EntrySnapshot, EntryState};
use crate::pool::manager::{EvictionListener, EvictionReason};

/// Names accepted for `eviction_strategy`.
pub const EVICTION_STRATEGY_NAMES: &[&str] = &["lru", "fifo", "lfu", "custom"];

/// LFU retires rarely used connections older than this.
const LFU_MIN_AGE: Duration = Duration::from_secs(3600);

/// LFU treats connections used fewer times than this as rarely used.
const LFU_MIN_USES: u64 = 5;

// ============================================================================
// Eviction
// ============================================================================

/// Picks a victim among snapshots.
pub type EvictionSelector = Arc<dyn Fn(&[EntrySnapshot]) -> Option<EntryId> + Send + Sync>;

/// Judges a single snapshot.
pub type EvictionPredicate = Arc<dyn Fn(&EntrySnapshot, &PoolConfig) -> bool + Send + Sync>;

/// A user-supplied strategy.
#[derive(Clone)]
pub struct CustomStrategy {
    name: String,
    selector: EvictionSelector,
    predicate: EvictionPredicate,
}

impl CustomStrategy {
    pub fn new<S, P>(name: impl Into<String>, selector: S, predicate: P) -> Self
    where
        S: Fn(&[EntrySnapshot]) -> Option<EntryId> + Send + Sync + 'static,
        P: Fn(&EntrySnapshot, &PoolConfig) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            selector: Arc::new(selector),
            predicate: Arc::new(predicate),
        }
    }
}

impl fmt::Debug for CustomStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomStrategy")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Eviction strategy.
#[derive(Debug, Clone, Default)]
pub enum EvictionStrategy {
    /// Least recently used goes first.
    #[default]
    Lru,
    /// Oldest goes first.
    Fifo,
    /// Least frequently used goes first.
    Lfu,
    /// Injected closures.
    Custom(CustomStrategy),
}

impl EvictionStrategy {
    /// Resolve a configured name. `custom` requires an injected strategy.
    pub fn from_name(name: &str, custom: Option<CustomStrategy>) -> PoolResult<Self> {
        match (name.to_ascii_lowercase().as_str(), custom) {
            (_, Some(custom)) => Ok(Self::Custom(custom)),
            ("lru", None) => Ok(Self::Lru),
            ("fifo", None) => Ok(Self::Fifo),
            ("lfu", None) => Ok(Self::Lfu),
            ("custom", None) => Err(PoolError::Configuration(
                "eviction strategy 'custom' requires an injected strategy".into(),
            )),
            (other, None) => Err(PoolError::Configuration(format!(
                "unknown eviction strategy '{}'",
                other
            ))),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Lru => "lru",
            Self::Fifo => "fifo",
            Self::Lfu => "lfu",
            Self::Custom(custom) => &custom.name,
        }
    }

    /// Pick the Idle entry to evict first.
    pub fn select_for_eviction(&self, entries: &[EntrySnapshot]) -> Option<EntryId> {
        let idle = || entries.iter().filter(|e| e.state == EntryState::Idle);
        match self {
            Self::Lru => idle().max_by_key(|e| e.idle_for).map(|e| e.id),
            Self::Fifo => idle().max_by_key(|e| e.age).map(|e| e.id),
            Self::Lfu => idle().min_by_key(|e| e.use_count).map(|e| e.id),
            Self::Custom(custom) => (custom.selector)(entries),
        }
    }

    /// Whether `entry` should be evicted now.
    pub fn should_evict(&self, entry: &EntrySnapshot, config: &PoolConfig) -> bool {
        if let Self::Custom(custom) = self {
            return (custom.predicate)(entry, config);
        }

        if entry.state == EntryState::Closed || entry.over_failure_threshold() {
            return true;
        }

        let idle = entry.state == EntryState::Idle;
        match self {
            Self::Lru => {
                entry.state == EntryState::Unhealthy
                    || (idle && entry.idle_for > config.max_idle_time)
            }
            Self::Fifo => {
                entry.state == EntryState::Unhealthy
                    || (idle && entry.age > config.max_idle_time * 2)
            }
            Self::Lfu => {
                idle && (entry.idle_for > config.max_idle_time
                    || (entry.use_count < LFU_MIN_USES && entry.age > LFU_MIN_AGE))
            }
            Self::Custom(_) => false,
        }
    }
}

// ============================================================================
// Selection
// ============================================================================

/// How one of several idle connections for a key is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingMode {
    #[default]
    RoundRobin,
    LeastUsed,
    Random,
    /// Highest `use_count - 10 * health_failures` first.
    Weighted,
}

impl FromStr for LoadBalancingMode {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "least_used" | "leastused" => Ok(Self::LeastUsed),
            "random" => Ok(Self::Random),
            "weighted" => Ok(Self::Weighted),
            other => Err(PoolError::Configuration(format!(
                "unknown load balancing mode '{}'",
                other
            ))),
        }
    }
}

/// Whether a key keeps getting the same connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityMode {
    #[default]
    None,
    /// Reuse the connection last handed out for the key when it is idle.
    Sticky,
    /// Stable hash of the key over the candidates ordered by id.
    Consistent,
}

impl FromStr for AffinityMode {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "sticky" => Ok(Self::Sticky),
            "consistent" => Ok(Self::Consistent),
            other => Err(PoolError::Configuration(format!(
                "unknown affinity mode '{}'",
                other
            ))),
        }
    }
}

/// Composes eviction, load balancing and affinity.
#[derive(Debug)]
pub struct StrategyManager {
    eviction: EvictionStrategy,
    load_balancing: LoadBalancingMode,
    affinity: AffinityMode,
    counter: AtomicUsize,
    pinned: DashMap<String, EntryId>,
}

impl Default for StrategyManager {
    fn default() -> Self {
        Self::new(
            EvictionStrategy::default(),
            LoadBalancingMode::default(),
            AffinityMode::default(),
        )
    }
}

impl StrategyManager {
    pub fn new(
        eviction: EvictionStrategy,
        load_balancing: LoadBalancingMode,
        affinity: AffinityMode,
    ) -> Self {
        Self {
            eviction,
            load_balancing,
            affinity,
            counter: AtomicUsize::new(0),
            pinned: DashMap::new(),
        }
    }

    pub fn eviction(&self) -> &EvictionStrategy {
        &self.eviction
    }

    pub fn load_balancing(&self) -> LoadBalancingMode {
        self.load_balancing
    }

    pub fn affinity(&self) -> AffinityMode {
        self.affinity
    }

    /// Pick one of `candidates` (idle entries of `key`).
    pub fn select_available(&self, key: &str, candidates: &[EntrySnapshot]) -> Option<EntryId> {
        if candidates.is_empty() {
            return None;
        }

        let chosen = match self.affinity {
            AffinityMode::Sticky => self
                .pinned
                .get(key)
                .map(|pinned| *pinned)
                .filter(|id| candidates.iter().any(|c| c.id == *id))
                .or_else(|| self.balance(candidates)),
            AffinityMode::Consistent => {
                let mut ordered: Vec<EntryId> = candidates.iter().map(|c| c.id).collect();
                ordered.sort_unstable();
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                let index = (hasher.finish() % ordered.len() as u64) as usize;
                Some(ordered[index])
            }
            AffinityMode::None => self.balance(candidates),
        }?;

        if self.affinity == AffinityMode::Sticky {
            self.pinned.insert(key.to_string(), chosen);
        }
        Some(chosen)
    }

    fn balance(&self, candidates: &[EntrySnapshot]) -> Option<EntryId> {
        match self.load_balancing {
            LoadBalancingMode::RoundRobin => {
                let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates.get(index).map(|c| c.id)
            }
            LoadBalancingMode::LeastUsed => {
                candidates.iter().min_by_key(|c| c.use_count).map(|c| c.id)
            }
            LoadBalancingMode::Random => {
                let index = rand::thread_rng().gen_range(0..candidates.len());
                candidates.get(index).map(|c| c.id)
            }
            LoadBalancingMode::Weighted => candidates
                .iter()
                .max_by_key(|c| c.use_count as i64 - 10 * i64::from(c.health_failures))
                .map(|c| c.id),
        }
    }

    /// Drop any pin pointing at `id`.
    pub fn forget(&self, id: EntryId) {
        self.pinned.retain(|_, pinned| *pinned != id);
    }
}

#[async_trait]
impl EvictionListener for StrategyManager {
    async fn on_evicted(&self, id: EntryId, _key: &str, _reason: EvictionReason) {
        self.forget(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(id: u64, state: EntryState, idle_secs: u64, age_secs: u64, uses: u64) -> EntrySnapshot {
        EntrySnapshot {
            id: EntryId::new(id),
            key: "ssh://deploy@web1:22".to_string(),
            state,
            use_count: uses,
            health_failures: 0,
            borrowed: state == EntryState::Active,
            idle_for: Duration::from_secs(idle_secs),
            age: Duration::from_secs(age_secs),
        }
    }

    fn config() -> PoolConfig {
        PoolConfig::default().max_idle_time(Duration::from_secs(300))
    }

    #[test]
    fn test_lru_eviction_order() {
        // last used t-10m, t-5m, t-1m with a 5m idle limit
        let entries = vec![
            snap(1, EntryState::Idle, 600, 900, 3),
            snap(2, EntryState::Idle, 300, 900, 3),
            snap(3, EntryState::Idle, 60, 900, 3),
        ];
        let lru = EvictionStrategy::Lru;

        assert_eq!(lru.select_for_eviction(&entries), Some(EntryId::new(1)));
        assert!(lru.should_evict(&entries[0], &config()));
        assert!(!lru.should_evict(&entries[1], &config()));
        assert!(!lru.should_evict(&entries[2], &config()));
    }

    #[test]
    fn test_selection_ignores_non_idle() {
        let entries = vec![
            snap(1, EntryState::Active, 6000, 9000, 0),
            snap(2, EntryState::Idle, 10, 20, 50),
        ];
        assert_eq!(
            EvictionStrategy::Lru.select_for_eviction(&entries),
            Some(EntryId::new(2))
        );
        assert_eq!(
            EvictionStrategy::Fifo.select_for_eviction(&entries),
            Some(EntryId::new(2))
        );
        assert_eq!(
            EvictionStrategy::Lfu.select_for_eviction(&entries),
            Some(EntryId::new(2))
        );
        assert_eq!(
            EvictionStrategy::Lru.select_for_eviction(&entries[..1]),
            None
        );
    }

    #[test]
    fn test_fifo_and_lfu_rules() {
        let cfg = config();
        let old = snap(1, EntryState::Idle, 10, 601, 100);
        assert!(EvictionStrategy::Fifo.should_evict(&old, &cfg));
        assert!(!EvictionStrategy::Lfu.should_evict(&old, &cfg));

        let rarely_used = snap(2, EntryState::Idle, 10, 3601, 2);
        assert!(EvictionStrategy::Lfu.should_evict(&rarely_used, &cfg));

        let unhealthy = snap(3, EntryState::Unhealthy, 0, 0, 0);
        assert!(EvictionStrategy::Lru.should_evict(&unhealthy, &cfg));
        assert!(EvictionStrategy::Fifo.should_evict(&unhealthy, &cfg));
        assert!(!EvictionStrategy::Lfu.should_evict(&unhealthy, &cfg));
    }

    #[test]
    fn test_failure_threshold_and_closed_always_evictable() {
        let cfg = config();
        let mut failing = snap(1, EntryState::Idle, 0, 0, 0);
        failing.health_failures = 4;
        let closed = snap(2, EntryState::Closed, 0, 0, 0);

        for strategy in [EvictionStrategy::Lru, EvictionStrategy::Fifo, EvictionStrategy::Lfu] {
            assert!(strategy.should_evict(&failing, &cfg), "{}", strategy.name());
            assert!(strategy.should_evict(&closed, &cfg), "{}", strategy.name());
        }
    }

    #[test]
    fn test_custom_strategy() {
        let custom = CustomStrategy::new(
            "newest-first",
            |entries: &[EntrySnapshot]| entries.iter().min_by_key(|e| e.age).map(|e| e.id),
            |entry: &EntrySnapshot, _cfg: &PoolConfig| entry.use_count == 0,
        );
        let strategy = EvictionStrategy::from_name("custom", Some(custom)).unwrap();
        assert_eq!(strategy.name(), "newest-first");

        let entries = vec![snap(1, EntryState::Idle, 0, 50, 1), snap(2, EntryState::Idle, 0, 5, 0)];
        assert_eq!(strategy.select_for_eviction(&entries), Some(EntryId::new(2)));
        assert!(strategy.should_evict(&entries[1], &config()));
        assert!(!strategy.should_evict(&entries[0], &config()));
    }

    #[test]
    fn test_from_name() {
        assert_eq!(EvictionStrategy::from_name("FIFO", None).unwrap().name(), "fifo");
        assert!(EvictionStrategy::from_name("custom", None).is_err());
        assert!(EvictionStrategy::from_name("random", None).is_err());
    }

    #[test]
    fn test_round_robin_cycles() {
        let manager = StrategyManager::default();
        let candidates = vec![
            snap(1, EntryState::Idle, 0, 0, 0),
            snap(2, EntryState::Idle, 0, 0, 0),
            snap(3, EntryState::Idle, 0, 0, 0),
        ];
        let picks: Vec<_> = (0..6)
            .filter_map(|_| manager.select_available("k", &candidates))
            .map(EntryId::get)
            .collect();
        assert_eq!(picks, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_least_used_and_weighted() {
        let mut candidates = vec![
            snap(1, EntryState::Idle, 0, 0, 7),
            snap(2, EntryState::Idle, 0, 0, 2),
            snap(3, EntryState::Idle, 0, 0, 9),
        ];
        let least = StrategyManager::new(
            EvictionStrategy::Lru,
            LoadBalancingMode::LeastUsed,
            AffinityMode::None,
        );
        assert_eq!(least.select_available("k", &candidates), Some(EntryId::new(2)));

        candidates[2].health_failures = 1;
        let weighted = StrategyManager::new(
            EvictionStrategy::Lru,
            LoadBalancingMode::Weighted,
            AffinityMode::None,
        );
        assert_eq!(weighted.select_available("k", &candidates), Some(EntryId::new(1)));
    }

    #[test]
    fn test_random_stays_in_range() {
        let manager = StrategyManager::new(
            EvictionStrategy::Lru,
            LoadBalancingMode::Random,
            AffinityMode::None,
        );
        let candidates = vec![snap(4, EntryState::Idle, 0, 0, 0), snap(5, EntryState::Idle, 0, 0, 0)];
        for _ in 0..50 {
            let id = manager.select_available("k", &candidates).unwrap();
            assert!(id == EntryId::new(4) || id == EntryId::new(5));
        }
        assert_eq!(manager.select_available("k", &[]), None);
    }

    #[tokio::test]
    async fn test_sticky_affinity_and_forget() {
        let manager = StrategyManager::new(
            EvictionStrategy::Lru,
            LoadBalancingMode::RoundRobin,
            AffinityMode::Sticky,
        );
        let candidates = vec![snap(1, EntryState::Idle, 0, 0, 0), snap(2, EntryState::Idle, 0, 0, 0)];

        let first = manager.select_available("k", &candidates).unwrap();
        for _ in 0..5 {
            assert_eq!(manager.select_available("k", &candidates), Some(first));
        }

        manager.on_evicted(first, "k", EvictionReason::Idle).await;
        let remaining: Vec<_> = candidates.into_iter().filter(|c| c.id != first).collect();
        let next = manager.select_available("k", &remaining).unwrap();
        assert_ne!(next, first);
    }

    #[test]
    fn test_consistent_affinity_is_stable() {
        let manager = StrategyManager::new(
            EvictionStrategy::Lru,
            LoadBalancingMode::RoundRobin,
            AffinityMode::Consistent,
        );
        let candidates = vec![
            snap(3, EntryState::Idle, 0, 0, 0),
            snap(1, EntryState::Idle, 0, 0, 0),
            snap(2, EntryState::Idle, 0, 0, 0),
        ];
        let mut reordered = candidates.clone();
        reordered.reverse();

        let first = manager.select_available("ssh://a@b:22", &candidates);
        assert_eq!(manager.select_available("ssh://a@b:22", &reordered), first);
        assert_eq!(manager.select_available("ssh://a@b:22", &candidates), first);
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!(
            "least_used".parse::<LoadBalancingMode>().unwrap(),
            LoadBalancingMode::LeastUsed
        );
        assert_eq!("sticky".parse::<AffinityMode>().unwrap(), AffinityMode::Sticky);
        assert!("nearest".parse::<AffinityMode>().is_err());
    }
}
