//! # Connection Listener
//!
//! Accepts sockets on one address and runs the connection setup sequence for
//! each of them as its own connection task.
//!
//! ## Per-socket sequence
//! 1. the handler's [`ConnectHandler::admit`] predicate may reject the peer
//!    (logged at trace so scanners do not flood the log)
//! 2. the socket is wrapped in TLS (server mode), then in a bundle channel
//! 3. the first bundle must be the connection header, magic bytes plus one
//!    connection-type byte; anything else disconnects
//! 4. [`ConnectHandler::on_connect`] takes over the bundle channel
//! 5. whatever happened, queued bundles are flushed and both layers closed
//!
//! The TLS handshake and header must complete before `handshake_timeout`.
//!
//! A failure that concerns one accepted socket drops that socket and is logged;
//! the accept loop itself only ends when its connection is asked to close.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{ListenerConfig, TransportConfig, MAGIC_BYTES};
use crate::core::bundle::PacketBundleChannel;
use crate::core::channel::TcpChannel;
use crate::error::{ProtocolError, Result};
use crate::service::pool::ConnectionManager;
use crate::service::worker::{connection_body, Connection};
use crate::transport::tls::{new_ssl_channel, SslChannel, TlsContext};
use crate::transport::trust::TrustManager;
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::{with_timeout_error, ACCEPT_BACKOFF, TLS_CLOSE_TIMEOUT};

/// Bundle channel over TLS over TCP, as handed to connection handlers
pub type BundleConnection = PacketBundleChannel<SslChannel<TcpChannel>>;

/// Length of the connection header bundle
pub const CONNECTION_HEADER_LEN: usize = MAGIC_BYTES.len() + 1;

/// The first bundle of every connection: magic bytes plus connection type
pub fn connection_header(connection_type: u8) -> [u8; CONNECTION_HEADER_LEN] {
    let mut header = [0u8; CONNECTION_HEADER_LEN];
    header[..MAGIC_BYTES.len()].copy_from_slice(&MAGIC_BYTES);
    header[MAGIC_BYTES.len()] = connection_type;
    header
}

/// Validate a connection header and return its type byte
pub fn parse_connection_header(bundle: &[u8]) -> Result<u8> {
    if bundle.len() != CONNECTION_HEADER_LEN || bundle[..MAGIC_BYTES.len()] != MAGIC_BYTES {
        return Err(ProtocolError::InvalidHeader);
    }
    Ok(bundle[MAGIC_BYTES.len()])
}

/// Application side of a listener
#[allow(async_fn_in_trait)]
pub trait ConnectHandler: Send + Sync + 'static {
    /// Admission predicate, consulted before any bytes are read
    fn admit(&self, _peer: &SocketAddr) -> bool {
        true
    }

    /// Serve an accepted connection. The listener flushes and closes `channel`
    /// when this returns.
    async fn on_connect(
        &self,
        connection: &Connection,
        connection_type: u8,
        peer: SocketAddr,
        channel: &mut BundleConnection,
    ) -> Result<()>;
}

pub struct ConnectionListenWorker<M, H> {
    manager: Arc<M>,
    handler: Arc<H>,
    tls: Arc<TlsContext>,
    trust: Arc<dyn TrustManager>,
    listener: ListenerConfig,
    transport: TransportConfig,
}

impl<M, H> ConnectionListenWorker<M, H>
where
    M: ConnectionManager + 'static,
    H: ConnectHandler,
{
    pub fn new(
        manager: Arc<M>,
        handler: Arc<H>,
        tls: Arc<TlsContext>,
        trust: Arc<dyn TrustManager>,
    ) -> Self {
        Self {
            manager,
            handler,
            tls,
            trust,
            listener: ListenerConfig::default(),
            transport: TransportConfig::default(),
        }
    }

    pub fn with_config(mut self, listener: ListenerConfig, transport: TransportConfig) -> Self {
        self.listener = listener;
        self.transport = transport;
        self
    }

    /// Bind `address` and register the accept loop. Returns the bound address,
    /// which carries the real port when `address` asked for port 0.
    #[instrument(skip(self))]
    pub fn start(&self, address: &str) -> Result<SocketAddr> {
        if !self.tls.can_serve() {
            return Err(ProtocolError::ConfigError(
                "Listener needs a TLS context with a server certificate".into(),
            ));
        }
        let socket = std::net::TcpListener::bind(address)?;
        socket.set_nonblocking(true)?;
        let bound = socket.local_addr()?;

        let manager = self.manager.clone();
        let handler = self.handler.clone();
        let tls = self.tls.clone();
        let trust = self.trust.clone();
        let handshake_timeout = self.listener.handshake_timeout;
        let transport = self.transport.clone();

        // The accept loop is a connection without a deadline
        self.manager.add_connection(
            None,
            connection_body(move |connection| async move {
                let listener = TcpListener::from_std(socket)?;
                info!(address=%bound, "Listening");
                loop {
                    let accepted = tokio::select! {
                        accepted = listener.accept() => accepted,
                        _ = connection.closing() => break,
                    };
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error=%e, "Error accepting connection");
                            // EMFILE and friends persist; do not spin on them
                            tokio::select! {
                                _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                                _ = connection.closing() => break,
                            }
                        }
                    };
                    if !handler.admit(&peer) {
                        global_metrics().connection_rejected();
                        trace!(%peer, "Connection rejected by predicate");
                        continue;
                    }

                    let setup = SocketSetup {
                        handler: handler.clone(),
                        tls: tls.clone(),
                        trust: trust.clone(),
                        transport: transport.clone(),
                    };
                    if let Err(e) =
                        hand_off(manager.as_ref(), setup, stream, peer, handshake_timeout)
                    {
                        warn!(%peer, error=%e, "Dropping accepted connection");
                    }
                }
                info!(address=%bound, "Listener stopped");
                Ok(())
            }),
        )?;

        Ok(bound)
    }
}

/// Queue an accepted socket as its own connection task. On error the socket is
/// dropped, which closes it.
fn hand_off<M, H>(
    manager: &M,
    setup: SocketSetup<H>,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    handshake_timeout: Duration,
) -> Result<()>
where
    M: ConnectionManager,
    H: ConnectHandler,
{
    // Re-registered with whichever worker runs the connection
    let stream = stream.into_std()?;
    manager.add_connection(
        Some(handshake_timeout),
        connection_body(move |connection| async move {
            let stream = tokio::net::TcpStream::from_std(stream)?;
            setup.serve(connection, stream, peer).await
        }),
    )
}

struct SocketSetup<H> {
    handler: Arc<H>,
    tls: Arc<TlsContext>,
    trust: Arc<dyn TrustManager>,
    transport: TransportConfig,
}

impl<H: ConnectHandler> SocketSetup<H> {
    #[instrument(skip(self, connection, stream), fields(connection = connection.id()))]
    async fn serve(
        self,
        connection: Connection,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
    ) -> Result<()> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error=%e, "Unable to set TCP_NODELAY");
        }
        let address = peer.to_string();
        let ssl = new_ssl_channel(
            self.trust.clone(),
            &address,
            TcpChannel::new(stream),
            &self.tls,
            false,
        )?;
        let mut channel = PacketBundleChannel::with_config(ssl, &self.transport);

        let outcome = tokio::select! {
            outcome = self.dispatch(&connection, peer, &mut channel) => outcome,
            _ = connection.cancelled() => Err(ProtocolError::Cancelled),
        };

        if let Err(e) = with_timeout_error(channel.flush(), TLS_CLOSE_TIMEOUT).await {
            debug!(error=%e, "Flush before teardown failed");
        }
        if let Err(e) = channel.close().await {
            debug!(error=%e, "Teardown failed");
        }
        outcome
    }

    async fn dispatch(
        &self,
        connection: &Connection,
        peer: SocketAddr,
        channel: &mut BundleConnection,
    ) -> Result<()> {
        let header = channel.receive().await?;
        let connection_type = parse_connection_header(&header)?;
        channel.recycle(header);
        debug!(%peer, connection_type, "Connection header accepted");
        self.handler
            .on_connect(connection, connection_type, peer, channel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_header() {
        let header = connection_header(3);
        assert_eq!(&header[..4], b"BNDL");
        assert_eq!(parse_connection_header(&header).unwrap(), 3);

        assert!(matches!(
            parse_connection_header(b"BNDX\x03"),
            Err(ProtocolError::InvalidHeader)
        ));
        assert!(matches!(
            parse_connection_header(b"BNDL"),
            Err(ProtocolError::InvalidHeader)
        ));
        assert!(matches!(
            parse_connection_header(b"BNDL\x03\x00"),
            Err(ProtocolError::InvalidHeader)
        ));
    }
}
