#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Boundary conditions and error paths across the layers

use std::time::{Duration, Instant};

use bundle_net::config::TransportConfig;
use bundle_net::core::bundle::{BundleStatus, PacketBundleChannel};
use bundle_net::core::channel::{pipe, Channel};
use bundle_net::core::serialization::SerializationFormat;
use bundle_net::error::{constants, ProtocolError};
use bundle_net::protocol::{CommandDispatcher, CommandSender, Envelope, Payload};
use bundle_net::service::listener::{connection_header, parse_connection_header};
use bundle_net::service::Connection;
use bundle_net::transport::trust::fingerprint;
use bundle_net::transport::{AcceptAll, PeerSession, PinnedTrust, RemoteAddress, TrustManager};
use bundle_net::utils::timeout::with_timeout_error;

// ============================================================================
// BUNDLE EDGE CASES
// ============================================================================

#[tokio::test]
async fn test_empty_bundle_roundtrip() {
    let (a, b) = pipe();
    let mut sender = PacketBundleChannel::new(a);
    let mut receiver = PacketBundleChannel::new(b);
    sender.send(&[]).unwrap();
    sender.flush().await.unwrap();
    assert!(receiver.receive().await.unwrap().is_empty());
}

#[test]
fn test_outbound_bundle_over_configured_limit() {
    let (a, _b) = pipe();
    let config = TransportConfig {
        max_bundle_size: 1024,
        ..TransportConfig::default()
    };
    let mut sender = PacketBundleChannel::with_config(a, &config);
    assert!(matches!(
        sender.send(&[7u8; 2048]),
        Err(ProtocolError::OversizedBundle(2048))
    ));
    assert_eq!(sender.pending_bundles(), 0);
    assert!(sender.is_closed());
    assert!(matches!(
        sender.close_reason(),
        Some(ProtocolError::OversizedBundle(2048))
    ));
    assert!(matches!(
        sender.send(b"small"),
        Err(ProtocolError::ConnectionClosed)
    ));
}

#[test]
fn test_inbound_bomb_is_refused() {
    let (mut raw, b) = pipe();
    let config = TransportConfig {
        max_bundle_size: 4096,
        ..TransportConfig::default()
    };
    let mut receiver = PacketBundleChannel::with_config(b, &config);

    // Small on the wire, far larger once inflated
    let body = bundle_net::utils::compression::compress(&vec![0u8; 1 << 20], 9).unwrap();
    assert!(body.len() < 4096);
    raw.write(&(body.len() as u32).to_be_bytes()).unwrap();
    raw.write(&body).unwrap();

    assert_eq!(receiver.process(), BundleStatus::Closed);
    assert!(matches!(
        receiver.close_reason(),
        Some(ProtocolError::DecompressionFailure)
    ));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (a, _b) = pipe();
    let mut channel = PacketBundleChannel::new(a);
    channel.send(b"unflushed").unwrap();
    channel.close().await.unwrap();
    channel.close().await.unwrap();
    assert!(channel.is_closed());
    assert!(matches!(
        channel.send(b"late"),
        Err(ProtocolError::ConnectionClosed)
    ));
}

// ============================================================================
// CONNECTION HEADER
// ============================================================================

#[test]
fn test_header_for_every_type() {
    for connection_type in [0u8, 1, 127, 255] {
        let header = connection_header(connection_type);
        assert_eq!(parse_connection_header(&header).unwrap(), connection_type);
    }
    assert!(matches!(
        parse_connection_header(&[]),
        Err(ProtocolError::InvalidHeader)
    ));
}

// ============================================================================
// ENVELOPES AND DISPATCH
// ============================================================================

#[test]
fn test_envelope_with_unknown_keys_is_accepted() {
    let mut envelope: Envelope = SerializationFormat::Json
        .decode(br#"{"Ping":12,"Extra":true}"#)
        .unwrap();
    assert_eq!(envelope.ping, Some(12));
    assert!(envelope.take_commands().unwrap().is_empty());
}

#[test]
fn test_one_bad_command_rejects_the_envelope() {
    let mut envelope: Envelope = SerializationFormat::Json
        .decode(br#"{"Commands":[{"Command":"ok","Payload":{}},{"Payload":{}}]}"#)
        .unwrap();
    assert!(matches!(
        envelope.take_commands(),
        Err(ProtocolError::MalformedEnvelope(m)) if m == constants::ERR_MISSING_COMMAND
    ));
}

#[test]
fn test_non_map_payload_fails_to_decode() {
    let decoded = SerializationFormat::Json
        .decode::<Envelope>(br#"{"Commands":[{"Command":"x","Payload":[1,2]}]}"#);
    assert!(matches!(decoded, Err(ProtocolError::DeserializeError(_))));
}

#[test]
fn test_sender_is_shared_between_clones() {
    let sender = CommandSender::new();
    let other = sender.clone();
    std::thread::spawn(move || other.send("from-thread", Payload::new()))
        .join()
        .unwrap();
    assert_eq!(sender.pending(), 1);
}

#[test]
fn test_hooks_on_other_commands_untouched() {
    let mut dispatcher = CommandDispatcher::new();
    dispatcher.hook("a", |_, _| {});
    dispatcher.hook("b", |_, _| {});
    let sender = CommandSender::new();
    let command = bundle_net::protocol::Command::new("a", Payload::new());
    assert_eq!(dispatcher.dispatch(&command, &sender), 1);
    assert_eq!(dispatcher.pending_hooks("a"), 0);
    assert_eq!(dispatcher.pending_hooks("b"), 1);
}

// ============================================================================
// TRUST AND ADDRESSES
// ============================================================================

#[test]
fn test_anonymous_peers() {
    let empty = PeerSession::default();
    assert!(AcceptAll.verify_session("x:1", &empty, false).is_ok());
    assert!(matches!(
        PinnedTrust::new().verify_session("x:1", &empty, false),
        Err(ProtocolError::TlsError(m)) if m == constants::ERR_NO_PEER_CERTIFICATE
    ));
    assert!(PinnedTrust::new()
        .allow_anonymous(true)
        .verify_session("x:1", &empty, false)
        .is_ok());
}

#[test]
fn test_pin_by_fingerprint() {
    let cert = b"not really DER but hashed all the same";
    let trust = PinnedTrust::new();
    trust.pin_fingerprint(fingerprint(cert));
    assert!(trust.is_pinned(cert));
    assert!(!trust.is_pinned(b"other"));
}

#[test]
fn test_address_parsing_edges() {
    assert!(RemoteAddress::parse("host").is_err());
    assert!(RemoteAddress::parse(":80").is_err());
    assert!(RemoteAddress::parse("host:99999").is_err());
    let v6 = RemoteAddress::parse("[::1]:7000").unwrap();
    assert_eq!(v6.host(), "::1");
    assert_eq!(v6.to_string(), "[::1]:7000");
}

// ============================================================================
// DEADLINES AND TIMEOUTS
// ============================================================================

#[test]
fn test_cancel_is_idempotent() {
    let connection = Connection::new(3);
    assert!(!connection.is_cancelled());
    connection.cancel();
    connection.cancel();
    assert!(connection.is_cancelled());
}

#[tokio::test]
async fn test_closing_returns_after_cancel() {
    let connection = Connection::new(4);
    connection.cancel();
    tokio::time::timeout(Duration::from_millis(100), connection.closing())
        .await
        .expect("closing should resolve once cancelled");
}

#[tokio::test]
async fn test_timeout_wrapper() {
    let start = Instant::now();
    let outcome: bundle_net::error::Result<()> = with_timeout_error(
        async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        },
        Duration::from_millis(20),
    )
    .await;
    assert!(matches!(outcome, Err(ProtocolError::Timeout)));
    assert!(start.elapsed() < Duration::from_secs(1));
}
