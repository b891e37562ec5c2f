//! Listener, dial path and control panel over real TCP sockets

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bundle_net::config::{ListenerConfig, ProtocolConfig, TransportConfig, WorkerConfig};
use bundle_net::core::bundle::PacketBundleChannel;
use bundle_net::core::channel::TcpChannel;
use bundle_net::error::{ProtocolError, Result};
use bundle_net::protocol::{ControlPanelProtocol, Payload, Role, Secret, StaticCredentials};
use bundle_net::service::{
    connect, BundleConnection, ConnectHandler, Connection, ConnectionBody, ConnectionListenWorker,
    ConnectionManager, ConnectionPool,
};
use bundle_net::transport::{new_ssl_channel, AcceptAll, PinnedTrust, RemoteAddress, TlsContext};
use serde_json::json;

const PANEL: u8 = 1;

struct PanelHandler {
    credentials: Arc<StaticCredentials>,
    served: Arc<AtomicUsize>,
    refuse_all: bool,
}

impl ConnectHandler for PanelHandler {
    fn admit(&self, _peer: &SocketAddr) -> bool {
        !self.refuse_all
    }

    async fn on_connect(
        &self,
        connection: &Connection,
        connection_type: u8,
        _peer: SocketAddr,
        channel: &mut BundleConnection,
    ) -> Result<()> {
        if connection_type != PANEL {
            return Err(ProtocolError::InvalidHeader);
        }
        self.served.fetch_add(1, Ordering::SeqCst);
        let mut panel = ControlPanelProtocol::new(
            channel,
            connection.clone(),
            Role::server(self.credentials.clone()),
            ProtocolConfig::default(),
        );
        panel.add_command("echo", |payload, sender| {
            sender.send("echo-reply", payload.clone());
        });
        panel.run().await
    }
}

struct Fixture {
    pool: Arc<ConnectionPool>,
    address: RemoteAddress,
    server_tls: Arc<TlsContext>,
    served: Arc<AtomicUsize>,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.pool.stop();
    }
}

fn start_server(refuse_all: bool) -> Fixture {
    let worker_config = WorkerConfig {
        threads: 2,
        max_sleep: Duration::from_millis(20),
        shutdown_grace: Duration::from_millis(200),
        watchdog_interval: Duration::from_millis(20),
    };
    let pool = Arc::new(ConnectionPool::new("e2e", worker_config).unwrap());
    let server_tls = Arc::new(TlsContext::self_signed(vec!["localhost".into()]).unwrap());
    let served = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(PanelHandler {
        credentials: Arc::new(StaticCredentials::new().with_password("operator", "s3cret")),
        served: served.clone(),
        refuse_all,
    });

    let listener = ConnectionListenWorker::new(pool.clone(), handler, server_tls.clone(), Arc::new(AcceptAll))
        .with_config(
            ListenerConfig {
                address: "127.0.0.1:0".into(),
                handshake_timeout: Duration::from_secs(5),
            },
            TransportConfig::default(),
        );
    let bound = listener.start("127.0.0.1:0").unwrap();

    Fixture {
        pool,
        address: RemoteAddress::from(bound),
        server_tls,
        served,
    }
}

fn client_trust(fixture: &Fixture) -> Arc<PinnedTrust> {
    let trust = PinnedTrust::new();
    trust.pin(fixture.server_tls.certificate().unwrap());
    Arc::new(trust)
}

#[tokio::test]
async fn test_control_panel_over_tls() {
    let fixture = start_server(false);
    let client_tls = TlsContext::self_signed(vec!["operator".into()]).unwrap();
    let mut channel = connect(&fixture.address, &client_tls, client_trust(&fixture), PANEL)
        .await
        .unwrap();

    let connection = Connection::new(1);
    let mut panel = ControlPanelProtocol::new(
        &mut channel,
        connection.clone(),
        Role::client("operator", Secret::password("s3cret")),
        ProtocolConfig::default(),
    );

    let replies = Arc::new(AtomicUsize::new(0));
    let seen = replies.clone();
    let closer = connection.clone();
    panel.command_hook("echo-reply", move |payload, _| {
        assert_eq!(payload.get("n"), Some(&json!(42)));
        seen.fetch_add(1, Ordering::SeqCst);
        closer.request_close();
    });
    panel.open_hook(|sender| {
        let mut payload = Payload::new();
        payload.insert("n".into(), json!(42));
        sender.send("echo", payload);
    });

    tokio::time::timeout(Duration::from_secs(10), panel.run())
        .await
        .expect("session timed out")
        .unwrap();
    assert_eq!(replies.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.served.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bad_magic_is_disconnected() {
    let fixture = start_server(false);
    let socket = fixture.address.clone().resolve().await.unwrap();
    let stream = tokio::net::TcpStream::connect(socket).await.unwrap();
    let mut ssl = new_ssl_channel(
        client_trust(&fixture),
        "localhost",
        TcpChannel::new(stream),
        &TlsContext::client_only(),
        true,
    )
    .unwrap();
    ssl.handshake().await.unwrap();

    let mut channel = PacketBundleChannel::new(ssl);
    channel.send(b"NOPE\x01").unwrap();
    channel.flush().await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), channel.receive())
        .await
        .expect("server kept the connection open");
    assert!(outcome.unwrap_err().is_expected_disconnect());
    assert_eq!(fixture.served.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_connection_type_is_disconnected() {
    let fixture = start_server(false);
    let mut channel = connect(
        &fixture.address,
        &TlsContext::client_only(),
        client_trust(&fixture),
        PANEL + 1,
    )
    .await
    .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), channel.receive())
        .await
        .expect("server kept the connection open");
    assert!(outcome.is_err());
}

#[tokio::test]
async fn test_admission_predicate_rejects_peer() {
    let fixture = start_server(true);
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        connect(
            &fixture.address,
            &TlsContext::client_only(),
            client_trust(&fixture),
            PANEL,
        ),
    )
    .await
    .expect("connect hung");
    assert!(outcome.is_err());
}

#[tokio::test]
async fn test_wrong_server_certificate_is_refused() {
    let fixture = start_server(false);
    let other = TlsContext::self_signed(vec!["elsewhere".into()]).unwrap();
    let trust = PinnedTrust::new();
    trust.pin(other.certificate().unwrap());

    let outcome = connect(&fixture.address, &TlsContext::client_only(), Arc::new(trust), PANEL).await;
    assert!(matches!(
        outcome,
        Err(ProtocolError::UntrustedCertificate { .. })
    ));
}

/// Refuses one chosen `add_connection` call, delegating the rest to a pool
struct RefuseOnce {
    pool: Arc<ConnectionPool>,
    calls: AtomicUsize,
    refuse: usize,
}

impl ConnectionManager for RefuseOnce {
    fn add_connection(&self, timeout: Option<Duration>, body: ConnectionBody) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == self.refuse {
            return Err(ProtocolError::Custom("refused for this socket".into()));
        }
        self.pool.add_connection(timeout, body)
    }

    fn connection_count(&self) -> usize {
        self.pool.connection_count()
    }
}

#[tokio::test]
async fn test_listener_survives_failed_socket_setup() {
    let worker_config = WorkerConfig {
        threads: 1,
        max_sleep: Duration::from_millis(20),
        shutdown_grace: Duration::from_millis(200),
        watchdog_interval: Duration::from_millis(20),
    };
    let pool = Arc::new(ConnectionPool::new("flaky", worker_config).unwrap());
    // Call 0 registers the accept loop; call 1 is the first accepted socket
    let manager = Arc::new(RefuseOnce {
        pool: pool.clone(),
        calls: AtomicUsize::new(0),
        refuse: 1,
    });
    let server_tls = Arc::new(TlsContext::self_signed(vec!["localhost".into()]).unwrap());
    let served = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(PanelHandler {
        credentials: Arc::new(StaticCredentials::new()),
        served: served.clone(),
        refuse_all: false,
    });
    let listener = ConnectionListenWorker::new(manager, handler, server_tls.clone(), Arc::new(AcceptAll));
    let address = RemoteAddress::from(listener.start("127.0.0.1:0").unwrap());

    let trust = PinnedTrust::new();
    trust.pin(server_tls.certificate().unwrap());
    let trust = Arc::new(trust);

    // The first socket is dropped during setup
    let first = tokio::time::timeout(
        Duration::from_secs(5),
        connect(&address, &TlsContext::client_only(), trust.clone(), PANEL),
    )
    .await
    .expect("dropped socket left the client hanging");
    assert!(first.is_err());

    // The listener is still accepting
    let second = tokio::time::timeout(
        Duration::from_secs(5),
        connect(&address, &TlsContext::client_only(), trust, PANEL),
    )
    .await
    .expect("listener stopped accepting");
    let _channel = second.unwrap();

    let start = std::time::Instant::now();
    while served.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(served.load(Ordering::SeqCst), 1);
    pool.stop();
}
