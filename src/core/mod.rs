//! # Core Transport Components
//!
//! Byte channels, bundle framing and envelope serialization.
//!
//! ## Components
//! - **Channel**: non-blocking byte channel trait with TCP and in-memory pipe
//!   implementations
//! - **Bundle**: compressed, length-prefixed framing over any channel
//! - **Serialization**: JSON / MessagePack envelope encoding
//!
//! ## Wire Format
//! ```text
//! [Length(4, big-endian)] [zlib payload(Length)]
//! ```

pub mod bundle;
pub mod channel;
pub mod serialization;
