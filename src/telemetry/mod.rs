//! Telemetry for the connection pool.
//!
//! - **Tracer**: the injected span/event sink every component receives
//!   through its constructor ([`NoopTracer`] by default).
//! - **Structured logging**: subscriber setup for embedding applications.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rustible_pool::telemetry::{init_logging, LogFormat, TracingTracer};
//!
//! init_logging(LogFormat::Json, "rustible_pool=debug")?;
//! let pool = ConnectionPool::builder(factory)
//!     .tracer(Arc::new(TracingTracer))
//!     .build()?;
//! ```

pub mod logging;
pub mod tracer;

pub use logging::{init_logging, LogFormat, LoggingBuilder};
pub use tracer::{NoopTracer, TraceEvent, Tracer, TracingTracer};
