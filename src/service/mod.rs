//! # Connection Services
//!
//! Threads, accept loops and dial paths.
//!
//! ## Components
//! - **Worker**: one thread, one readiness multiplexer, many cooperative
//!   connection tasks with deadline watchdogs
//! - **Pool**: fixed set of workers behind the [`pool::ConnectionManager`] trait
//! - **Listener**: accept loop plus TLS, bundle and header setup per socket
//! - **Client**: outbound counterpart of the listener

pub mod client;
pub mod listener;
pub mod pool;
pub mod worker;

pub use client::{connect, connect_with_config};
pub use listener::{BundleConnection, ConnectHandler, ConnectionListenWorker};
pub use pool::{ConnectionManager, ConnectionPool};
pub use worker::{connection_body, Connection, ConnectionBody, ConnectionWorker, WorkerThread};
