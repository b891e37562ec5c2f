//! # Transport Layer
//!
//! Address resolution, TLS and peer trust.
//!
//! ## Components
//! - **Address**: lazily resolved host/port pairs
//! - **TLS**: [`tls::SslChannel`] state machine and [`tls::TlsContext`] material
//! - **Trust**: pluggable [`trust::TrustManager`] with accept-all and pinning
//!   implementations

pub mod address;
pub mod tls;
pub mod trust;

pub use address::RemoteAddress;
pub use tls::{new_ssl_channel, SslChannel, TlsContext, TlsState};
pub use trust::{AcceptAll, PeerSession, PinnedTrust, TrustManager};
