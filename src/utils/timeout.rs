//! Timeout constants and async timeout helpers.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Upper bound for an idle worker's multiplexer sleep
pub const MAX_SLEEP: Duration = Duration::from_millis(250);

/// Grace window a stopping worker gives its connections
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Watchdog polling interval
pub const WATCHDOG_INTERVAL: Duration = Duration::from_millis(100);

/// Deadline for TLS handshake plus connection header on accept
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Control panel ping interval
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Base of the ping-driven deadline extension
pub const LIVENESS_BASE: Duration = Duration::from_secs(10);

/// Best-effort bound on draining a TLS close_notify
pub const TLS_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Time a cancelled connection body gets to tear down before it is dropped
pub const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Pause after a failed `accept` before trying again
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Run `fut` with a deadline, mapping expiry to [`ProtocolError::Timeout`].
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
