//! # Utility Modules
//!
//! Supporting utilities shared by the channel, TLS, bundle and protocol layers.
//!
//! ## Components
//! - **Buffer Pool**: per-thread capacity-keyed free list for bundle buffers
//! - **Compression**: bounded DEFLATE for bundle payloads
//! - **Crypto**: XChaCha20-Poly1305 and key derivation for authentication
//! - **Logging**: `tracing-subscriber` setup
//! - **Metrics**: relaxed atomic counters
//! - **Time**: epoch timestamps for ping/pong
//! - **Timeout**: default durations and async timeout wrapper

pub mod buffer_pool;
pub mod compression;
pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod time;
pub mod timeout;
