//! # Rustible Pool - Connection Pooling for Remote-Shell Sessions
//!
//! `rustible-pool` keeps long-lived remote-shell sessions open and hands them
//! out to concurrent callers. Opening a session costs network round trips,
//! key exchange and authentication, so many short operations against a
//! fleet of hosts go through a pool keyed by `ssh://user@host:port`.
//!
//! ## Core Concepts
//!
//! - **Pool entries**: One pooled session with its Idle/Active/Unhealthy/Closed state
//! - **Entry manager**: Capacity accounting, reservations for in-flight dials, lookup
//! - **Strategies**: Eviction (LRU, FIFO, LFU, custom), load balancing and affinity
//! - **Health**: Per-connection probes with automatic recovery, pool-wide alerts
//! - **Cleanup**: Periodic eviction of idle, expired and unhealthy sessions
//! - **Leak detection**: A shadow ledger that flags sessions outliving their lifetime
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         ConnectionPool                               │
//! │           get / release / prewarm / health_check / close             │
//! └─────────────────────────────────────────────────────────────────────┘
//!          │                         │                         │
//!          ▼                         ▼                         ▼
//! ┌─────────────────┐   ┌─────────────────────┐   ┌─────────────────────┐
//! │  EntryManager   │   │   StrategyManager   │   │ PoolHealthMonitor   │
//! │ (entries, slots,│   │ (eviction, balance, │   │ (HealthChecker per  │
//! │  reservations)  │   │  affinity)          │   │  connection)        │
//! └─────────────────┘   └─────────────────────┘   └─────────────────────┘
//!          │                         │                         │
//!          └─────────────────────────┼─────────────────────────┘
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │     CleanupManager · ConnectionLeakDetector · PoolHealthIntegration  │
//! │                   (cancellable background loops)                     │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │             ConnectionFactory / Connection (transport)               │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use rustible_pool::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> PoolResult<()> {
//!     let config = AdvancedPoolConfig::load(None)?;
//!     let pool = ConnectionPool::builder(Arc::new(MyFactory))
//!         .config(config)
//!         .tracer(Arc::new(TracingTracer))
//!         .build()?;
//!     pool.start()?;
//!
//!     let ctx = Context::with_timeout(Duration::from_secs(10));
//!     let key = pool.register(ConnectionConfig::new("web1").user("deploy"))?;
//!     let conn = pool.get(&ctx, &key).await?;
//!     let result = conn.execute(&ctx, "uptime").await?;
//!     println!("{}", result.stdout);
//!     pool.release(&key, &conn).await?;
//!
//!     pool.close().await
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.
    //!
    //! ```rust,ignore
    //! use rustible_pool::prelude::*;
    //! ```

    pub use std::sync::Arc;
    pub use std::time::Duration;

    pub use crate::config::{
        AdvancedPoolConfig, AlertThresholds, CleanupSettings, ExhaustionPolicy, HealthConfig,
        LeakDetectionConfig, MetricsConfig, PoolConfig,
    };
    pub use crate::connection::{
        AuthMethod, CommandResult, Connection, ConnectionConfig, ConnectionError,
        ConnectionFactory, ConnectionResult,
    };
    pub use crate::context::{Context, ContextError};
    pub use crate::error::{PoolError, PoolResult};
    pub use crate::pool::health::HealthReport;
    pub use crate::pool::integration::{Alert, PoolHealthIntegration};
    pub use crate::pool::strategy::{AffinityMode, CustomStrategy, LoadBalancingMode};
    pub use crate::pool::{ConnectionPool, Pool, PoolStats, PrewarmResult};
    pub use crate::telemetry::{NoopTracer, Tracer, TracingTracer};
}

/// Error types and result aliases.
pub mod error;

/// Cancellation and deadline propagation for pool operations.
pub mod context;

/// Pool configuration: defaults, files, environment overrides.
pub mod config;

/// The transport seam: connections, factories and destination configs.
pub mod connection;

/// The pool engine and its background components.
pub mod pool;

/// Tracer injection and structured logging setup.
pub mod telemetry;

pub use config::{AdvancedPoolConfig, ExhaustionPolicy, PoolConfig};
pub use connection::{Connection, ConnectionConfig, ConnectionFactory};
pub use context::Context;
pub use error::{PoolError, PoolResult};
pub use pool::{ConnectionPool, ConnectionPoolBuilder, Pool};
