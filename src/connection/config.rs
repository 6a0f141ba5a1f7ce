//! Destination configuration for pooled connections.
//!
//! A [`ConnectionConfig`] identifies a destination (`user@host:port`) and
//! carries the auth and timeout parameters handed to the
//! [`ConnectionFactory`](super::ConnectionFactory). It is immutable per pool key.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

/// Default SSH port
pub const DEFAULT_PORT: u16 = 22;

/// Default connection timeout in seconds
pub const DEFAULT_TIMEOUT: u64 = 30;

/// How the transport authenticates. The pool only passes this through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method")]
pub enum AuthMethod {
    /// Use the running SSH agent.
    Agent,
    /// Use a private key file.
    PrivateKey {
        /// Path to the key
        path: PathBuf,
        /// Optional passphrase
        #[serde(default, skip_serializing)]
        passphrase: Option<String>,
    },
    /// Password authentication.
    Password {
        /// The password
        #[serde(skip_serializing)]
        password: String,
    },
}

impl Default for AuthMethod {
    fn default() -> Self {
        Self::Agent
    }
}

/// Destination identity plus auth/timeout parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Host name or address
    pub host: String,

    /// Port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Remote user
    #[serde(default = "default_user")]
    pub user: String,

    /// Authentication method
    #[serde(default)]
    pub auth: AuthMethod,

    /// Timeout for establishing the session
    #[serde(default = "default_connect_timeout")]
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Timeout applied by the transport to individual commands
    #[serde(default)]
    #[serde(with = "humantime_serde")]
    pub command_timeout: Option<Duration>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(DEFAULT_TIMEOUT)
}

impl ConnectionConfig {
    /// Create a configuration for `host` with default port, user and timeouts.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: default_user(),
            auth: AuthMethod::default(),
            connect_timeout: default_connect_timeout(),
            command_timeout: None,
        }
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the user
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the authentication method
    pub fn auth(mut self, auth: AuthMethod) -> Self {
        self.auth = auth;
        self
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-command timeout
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// The pool key for this destination.
    pub fn pool_key(&self) -> String {
        format!("ssh://{}@{}:{}", self.user, self.host, self.port)
    }

    /// Reject configs that cannot identify a destination.
    pub fn validate(&self) -> PoolResult<()> {
        if self.host.trim().is_empty() {
            return Err(PoolError::Configuration("host must not be empty".into()));
        }
        if self.user.trim().is_empty() {
            return Err(PoolError::Configuration("user must not be empty".into()));
        }
        if self.port == 0 {
            return Err(PoolError::Configuration("port must be non-zero".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(PoolError::Configuration(
                "connect_timeout must be positive".into(),
            ));
        }
        if matches!(self.command_timeout, Some(t) if t.is_zero()) {
            return Err(PoolError::Configuration(
                "command_timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}
