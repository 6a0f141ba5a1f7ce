//! Capability interfaces for the remote-shell transport.
//!
//! The pool never dials, authenticates or speaks a wire protocol itself. It
//! consumes transports through the [`Connection`] and [`ConnectionFactory`]
//! traits defined here, and reports transport failures as
//! [`ConnectionError`]s.
//!
//! # Example
//!
//! ```rust,ignore
//! use rustible_pool::connection::{ConnectionConfig, ConnectionFactory};
//! use rustible_pool::Context;
//!
//! let config = ConnectionConfig::new("192.168.1.100").user("admin").port(2222);
//! let conn = factory.create(&config).await?;
//! conn.connect(&Context::background()).await?;
//! let result = conn.execute(&Context::background(), "uname -a").await?;
//! println!("Output: {}", result.stdout);
//! ```

/// Connection configuration types.
pub mod config;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::Context;

pub use config::{AuthMethod, ConnectionConfig};

/// Failure reported by a transport.
///
/// The pool wraps these in [`PoolError::Connection`](crate::error::PoolError)
/// together with the destination key.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The session could not be opened.
    #[error("dial failed: {0}")]
    ConnectionFailed(String),

    #[error("remote host rejected credentials ({0})")]
    AuthenticationFailed(String),

    /// Dialing did not finish within the configured connect timeout.
    #[error("no session after {}", humantime_serde::re::humantime::format_duration(*.0))]
    Timeout(Duration),

    /// The caller's context was cancelled while the transport was working.
    #[error("transport operation cancelled")]
    Cancelled,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// The session was used before `connect` succeeded.
    #[error("session not established")]
    NotConnected,

    /// The remote side closed the session.
    #[error("session closed by remote host")]
    ConnectionClosed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Outcome of a command run over a session.
///
/// Health probes only look at [`CommandResult::success`].
///
/// ```rust
/// use rustible_pool::connection::CommandResult;
///
/// let ok = CommandResult::success("up 3 days".into(), String::new());
/// assert!(ok.success);
///
/// let probe = CommandResult::failure(127, String::new(), "true: not found".into());
/// assert_eq!(probe.exit_code, 127);
/// assert!(!probe.success);
/// ```
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Mirrors `exit_code == 0`.
    pub success: bool,
}

impl CommandResult {
    /// Zero exit status.
    pub fn success(stdout: String, stderr: String) -> Self {
        Self::from_exit(0, stdout, stderr)
    }

    pub fn failure(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            success: false,
            ..Self::from_exit(exit_code, stdout, stderr)
        }
    }

    /// Build a result from a raw exit status.
    pub fn from_exit(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            success: exit_code == 0,
            exit_code,
            stdout,
            stderr,
        }
    }
}

/// A live remote-shell session.
///
/// Once handed to the pool a connection is owned by its pool entry. Borrowers
/// between `get` and `release` must not call [`Connection::close`].
#[async_trait]
pub trait Connection: Send + Sync {
    /// Connection identifier (usually the host name).
    fn identifier(&self) -> &str;

    /// Establish the session. Must abort promptly when `ctx` is done.
    async fn connect(&self, ctx: &Context) -> ConnectionResult<()>;

    /// Execute a command. Implementations should terminate the remote command
    /// on a best-effort basis when `ctx` is cancelled.
    async fn execute(&self, ctx: &Context, command: &str) -> ConnectionResult<CommandResult>;

    /// Close the session.
    async fn close(&self) -> ConnectionResult<()>;

    /// Whether the session is currently usable.
    fn is_connected(&self) -> bool;
}

/// Creates unconnected transports for a destination.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Build a connection for `config`. The pool calls [`Connection::connect`] afterwards.
    async fn create(&self, config: &ConnectionConfig) -> ConnectionResult<Arc<dyn Connection>>;
}

#[async_trait]
impl<T: ConnectionFactory + ?Sized> ConnectionFactory for Arc<T> {
    async fn create(&self, config: &ConnectionConfig) -> ConnectionResult<Arc<dyn Connection>> {
        (**self).create(config).await
    }
}

/// Identity comparison for shared connection handles.
///
/// Compares the data pointers only, so two handles to the same connection are
/// equal even when their vtable pointers differ.
pub fn same_connection(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
