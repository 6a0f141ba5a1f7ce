//! Shared test utilities for the pool test suite.
//!
//! This module provides:
//! - A scriptable [`MockConnection`] (failing commands, dropped transports, close counting)
//! - A [`MockFactory`] that records every connection it creates
//! - A [`RecordingTracer`] that keeps every emitted event
//! - Pool construction helpers
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::Span;

use rustible_pool::config::{AdvancedPoolConfig, ExhaustionPolicy, HealthConfig, PoolConfig};
use rustible_pool::connection::{
    CommandResult, Connection, ConnectionConfig, ConnectionError, ConnectionFactory,
    ConnectionResult,
};
use rustible_pool::context::Context;
use rustible_pool::pool::ConnectionPool;
use rustible_pool::telemetry::{TraceEvent, Tracer};

// ============================================================================
// Mock Connection
// ============================================================================

/// A mock remote-shell session.
#[derive(Debug)]
pub struct MockConnection {
    identifier: String,
    alive: AtomicBool,
    fail_commands: AtomicBool,
    fail_close: AtomicBool,
    commands: RwLock<Vec<String>>,
    closes: AtomicU32,
}

impl MockConnection {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            alive: AtomicBool::new(true),
            fail_commands: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            commands: RwLock::new(Vec::new()),
            closes: AtomicU32::new(0),
        }
    }

    /// Make every command exit non-zero.
    pub fn set_fail_commands(&self, fail: bool) {
        self.fail_commands.store(fail, Ordering::SeqCst);
    }

    /// Make `close` report an error after tearing the session down.
    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Simulate the transport dropping underneath the pool.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.read().clone()
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn connect(&self, _ctx: &Context) -> ConnectionResult<()> {
        Ok(())
    }

    async fn execute(&self, _ctx: &Context, command: &str) -> ConnectionResult<CommandResult> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected);
        }
        self.commands.write().push(command.to_string());
        if self.fail_commands.load(Ordering::SeqCst) {
            return Ok(CommandResult::failure(1, String::new(), "command failed".into()));
        }
        Ok(CommandResult::success(String::new(), String::new()))
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectionClosed);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Mock Factory
// ============================================================================

/// Creates [`MockConnection`]s and keeps a handle to each one.
#[derive(Debug, Default)]
pub struct MockFactory {
    created: RwLock<Vec<Arc<MockConnection>>>,
    attempts: AtomicUsize,
    fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent `create` fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Delay every subsequent `create`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Successful creations.
    pub fn created(&self) -> usize {
        self.created.read().len()
    }

    /// Every call to `create`, failed or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn connection(&self, index: usize) -> Arc<MockConnection> {
        Arc::clone(&self.created.read()[index])
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.created.read().clone()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn create(&self, config: &ConnectionConfig) -> ConnectionResult<Arc<dyn Connection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectionFailed(format!(
                "{} unreachable",
                config.host
            )));
        }
        let connection = Arc::new(MockConnection::new(config.host.clone()));
        self.created.write().push(Arc::clone(&connection));
        Ok(connection as Arc<dyn Connection>)
    }
}

// ============================================================================
// Recording Tracer
// ============================================================================

/// Keeps every event for later assertions.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingTracer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// Number of events with the given machine name.
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}

impl Tracer for RecordingTracer {
    fn span(&self, _operation: &'static str, _key: &str) -> Span {
        Span::none()
    }

    fn event(&self, event: &TraceEvent) {
        self.events.lock().push(event.clone());
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn destination(host: &str) -> ConnectionConfig {
    ConnectionConfig::new(host).user("deploy")
}

/// A config whose background loops never fire during a test.
pub fn quiet_config(max_connections: usize, policy: ExhaustionPolicy) -> AdvancedPoolConfig {
    AdvancedPoolConfig::new()
        .with_pool(
            PoolConfig::new()
                .max_connections(max_connections)
                .exhaustion_policy(policy)
                .acquire_timeout(Duration::from_secs(5)),
        )
        .with_health(HealthConfig::default().disable_monitoring())
}

pub fn build_pool(
    factory: &Arc<MockFactory>,
    config: AdvancedPoolConfig,
) -> Arc<ConnectionPool> {
    ConnectionPool::builder(Arc::clone(factory) as Arc<dyn ConnectionFactory>)
        .config(config)
        .build()
        .expect("valid pool config")
}

pub fn traced_pool(
    factory: &Arc<MockFactory>,
    tracer: &Arc<RecordingTracer>,
    config: AdvancedPoolConfig,
) -> Arc<ConnectionPool> {
    ConnectionPool::builder(Arc::clone(factory) as Arc<dyn ConnectionFactory>)
        .config(config)
        .tracer(Arc::clone(tracer) as Arc<dyn Tracer>)
        .build()
        .expect("valid pool config")
}
