//! # bundle-net
//!
//! Connection plumbing for long-lived, authenticated peer links.
//!
//! ## Layers
//! - [`service`]: worker threads running cooperative connection tasks with
//!   deadline watchdogs, a worker pool, the TLS accept loop and the dial path
//! - [`transport`]: resumable TLS state machine over any non-blocking channel,
//!   with trust decided by a pluggable [`transport::TrustManager`]
//! - [`core`]: byte channels and compressed, length-prefixed bundle framing
//! - [`protocol`]: the control panel command bus with challenge-response login
//!   and ping-driven liveness
//!
//! ## Quick start
//! ```no_run
//! use bundle_net::config::WorkerConfig;
//! use bundle_net::service::{connection_body, ConnectionManager, ConnectionPool};
//!
//! # fn main() -> bundle_net::error::Result<()> {
//! let pool = ConnectionPool::new("net", WorkerConfig::default())?;
//! pool.add_connection(None, connection_body(|connection| async move {
//!     connection.closing().await;
//!     Ok(())
//! }))?;
//! pool.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::NetworkConfig;
pub use error::{ProtocolError, Result};
