//! Outbound connections.
//!
//! Dialing mirrors the accepting side: resolve, connect TCP, run the TLS
//! handshake in client mode, then send the connection header bundle.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::config::TransportConfig;
use crate::core::bundle::PacketBundleChannel;
use crate::core::channel::TcpChannel;
use crate::error::Result;
use crate::service::listener::{connection_header, BundleConnection};
use crate::transport::address::RemoteAddress;
use crate::transport::tls::{new_ssl_channel, TlsContext};
use crate::transport::trust::TrustManager;
use crate::utils::timeout::{with_timeout_error, HANDSHAKE_TIMEOUT};

/// Connect with default transport settings and handshake timeout.
pub async fn connect(
    address: &RemoteAddress,
    tls: &TlsContext,
    trust: Arc<dyn TrustManager>,
    connection_type: u8,
) -> Result<BundleConnection> {
    connect_with_config(
        address,
        tls,
        trust,
        connection_type,
        &TransportConfig::default(),
        HANDSHAKE_TIMEOUT,
    )
    .await
}

/// Connect to `address` and announce `connection_type`.
///
/// The returned channel has completed its TLS handshake and already carries the
/// connection header.
#[instrument(skip(address, tls, trust, transport), fields(address = %address))]
pub async fn connect_with_config(
    address: &RemoteAddress,
    tls: &TlsContext,
    trust: Arc<dyn TrustManager>,
    connection_type: u8,
    transport: &TransportConfig,
    handshake_timeout: Duration,
) -> Result<BundleConnection> {
    let mut address = address.clone();
    let socket = address.resolve().await?;
    let stream = with_timeout_error(
        async { Ok(TcpStream::connect(socket).await?) },
        handshake_timeout,
    )
    .await?;
    stream.set_nodelay(true)?;

    let mut ssl = new_ssl_channel(trust, address.host(), TcpChannel::new(stream), tls, true)?;
    with_timeout_error(ssl.handshake(), handshake_timeout).await?;
    debug!(%socket, "TLS session established");

    let mut channel = PacketBundleChannel::with_config(ssl, transport);
    channel.send(&connection_header(connection_type))?;
    channel.flush().await?;
    Ok(channel)
}
