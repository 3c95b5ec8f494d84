//! Teardown and lifecycle guarantees: completions resolve on disposal,
//! post-shutdown calls fail cleanly, and registry entries drain to zero.

use bytes::Bytes;
use quicbridge::{
    ClientConfig, ClientConnection, Credentials, DatagramOutcome, DatagramSend, Listener,
    QuicBridgeError, Registration, SendFlags, ServerConfig, ServerConnection, Status,
};
use quicbridge_engine::LoopbackEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn connect_pair(
    registration: &Registration,
    name: &str,
) -> (Listener, ClientConnection, ServerConnection) {
    let listener = Listener::new(
        registration,
        ServerConfig::new(name, Credentials::self_signed("localhost")),
    )
    .unwrap();
    let bound = listener.start("127.0.0.1:0".parse().unwrap()).unwrap();
    let client = ClientConnection::new(registration, ClientConfig::new(name)).unwrap();
    client.set_certificate_validator(|_| true);
    client.start("localhost", bound.port()).unwrap();
    let server = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    timeout(WAIT, client.connected()).await.unwrap().unwrap();
    (listener, client, server)
}

#[tokio::test]
async fn post_shutdown_calls_report_closed() {
    let engine = Arc::new(LoopbackEngine::new());
    let registration = Registration::new(engine, "post_shutdown").unwrap();
    let (_listener, client, server) = connect_pair(&registration, "test").await;

    client.shutdown().await;
    assert!(client.is_closed());

    assert_eq!(
        client.open_stream(true).unwrap_err(),
        QuicBridgeError::ConnectionClosed
    );
    let datagram = DatagramSend::copied(b"late");
    assert_eq!(
        client.send_datagram(&datagram).unwrap_err(),
        QuicBridgeError::ConnectionClosed
    );

    // The peer observes the teardown too.
    server.shutdown().await;
    assert!(server.is_closed());
}

#[tokio::test]
async fn disposal_resolves_outstanding_send() {
    let engine = Arc::new(LoopbackEngine::new());
    let registration = Registration::new(engine, "disposal_send").unwrap();
    let (_listener, client, _server) = connect_pair(&registration, "test").await;

    let stream = client.open_stream(true).unwrap();
    let pending = stream
        .send(Bytes::from_static(b"mid-flight"), SendFlags::default())
        .unwrap();
    client.close();

    // Resolved either way (delivered or canceled), never left dangling.
    let outcome = timeout(WAIT, pending.wait()).await.unwrap();
    assert!(matches!(outcome, Ok(()) | Err(QuicBridgeError::SendCanceled)));
}

#[tokio::test]
async fn refused_connection_cancels_early_sends() {
    let engine = Arc::new(LoopbackEngine::new());
    let registration = Registration::new(engine, "refused_sends").unwrap();

    // No listener on this port: the handshake will be refused.
    let client = ClientConnection::new(&registration, ClientConfig::new("test")).unwrap();
    client.set_certificate_validator(|_| true);

    let stream = client.open_stream(true).unwrap();
    let pending = stream
        .send(Bytes::from_static(b"early"), SendFlags::fin())
        .unwrap();
    let datagram = DatagramSend::copied(b"early");
    client.send_datagram(&datagram).unwrap();

    client.start("localhost", 9).unwrap();

    let err = timeout(WAIT, client.connected()).await.unwrap().unwrap_err();
    assert_eq!(
        err,
        QuicBridgeError::HandshakeFailed {
            status: Status::ConnectionRefused
        }
    );
    assert_eq!(
        timeout(WAIT, pending.wait()).await.unwrap(),
        Err(QuicBridgeError::SendCanceled)
    );
    assert_eq!(
        timeout(WAIT, datagram.wait_acknowledged()).await.unwrap(),
        DatagramOutcome::Canceled
    );
}

#[tokio::test]
async fn certificate_rejection_fails_the_handshake() {
    let engine = Arc::new(LoopbackEngine::new());
    let registration = Registration::new(engine, "cert_reject").unwrap();
    let listener = Listener::new(
        &registration,
        ServerConfig::new("test", Credentials::self_signed("localhost")),
    )
    .unwrap();
    let bound = listener.start("127.0.0.1:0".parse().unwrap()).unwrap();

    // No validator installed: default-deny.
    let client = ClientConnection::new(&registration, ClientConfig::new("test")).unwrap();
    client.start("localhost", bound.port()).unwrap();

    let err = timeout(WAIT, client.connected()).await.unwrap().unwrap_err();
    assert_eq!(
        err,
        QuicBridgeError::HandshakeFailed {
            status: Status::BadCertificate
        }
    );
}

#[tokio::test]
async fn panicking_validator_is_captured_not_propagated() {
    let engine = Arc::new(LoopbackEngine::new());
    let registration = Registration::new(engine, "panicking_validator").unwrap();
    let listener = Listener::new(
        &registration,
        ServerConfig::new("test", Credentials::self_signed("localhost")),
    )
    .unwrap();
    let bound = listener.start("127.0.0.1:0".parse().unwrap()).unwrap();

    let client = ClientConnection::new(&registration, ClientConfig::new("test")).unwrap();
    let mut unobserved = client.unobserved_errors().unwrap();
    client.set_certificate_validator(|_| panic!("validator exploded"));
    client.start("localhost", bound.port()).unwrap();

    let err = timeout(WAIT, client.connected()).await.unwrap().unwrap_err();
    assert_eq!(
        err,
        QuicBridgeError::HandshakeFailed {
            status: Status::BadCertificate
        }
    );

    let captured = timeout(WAIT, unobserved.recv()).await.unwrap().unwrap();
    assert_eq!(captured.context, "certificate validator");
    assert!(captured.message.contains("validator exploded"));
}

#[tokio::test]
async fn idle_connection_closes_locally() {
    let engine = Arc::new(LoopbackEngine::new());
    let registration = Registration::new(engine, "idle_close").unwrap();

    let client = ClientConnection::new(&registration, ClientConfig::new("test")).unwrap();
    assert_eq!(registration.active_objects(), 1);

    client.shutdown().await;
    assert!(client.is_closed());
    assert_eq!(registration.active_objects(), 0);
    assert!(client.start("localhost", 9).is_err());
}

#[tokio::test]
async fn registry_drains_after_full_teardown() {
    let engine = Arc::new(LoopbackEngine::new());
    let registration = Registration::new(engine, "registry_drain").unwrap();
    let (listener, client, server) = connect_pair(&registration, "test").await;

    let stream = client.open_stream(true).unwrap();
    let pending = stream
        .send(Bytes::from_static(b"Hello"), SendFlags::fin())
        .unwrap();
    let server_stream = timeout(WAIT, server.accept_stream()).await.unwrap().unwrap();
    timeout(WAIT, server_stream.readable()).await.unwrap();
    timeout(WAIT, pending.wait()).await.unwrap().unwrap();

    client.shutdown().await;
    server.shutdown().await;
    drop(stream);
    drop(server_stream);
    drop(listener);

    // Connections, streams, datagram contexts, and the listener are all
    // released once shutdown-complete was observed everywhere.
    assert_eq!(registration.active_objects(), 0);
}

#[tokio::test]
async fn stopped_listener_refuses_connections() {
    let engine = Arc::new(LoopbackEngine::new());
    let registration = Registration::new(engine, "stopped_listener").unwrap();
    let listener = Listener::new(
        &registration,
        ServerConfig::new("test", Credentials::self_signed("localhost")),
    )
    .unwrap();
    let bound = listener.start("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.stop();

    let client = ClientConnection::new(&registration, ClientConfig::new("test")).unwrap();
    client.set_certificate_validator(|_| true);
    client.start("localhost", bound.port()).unwrap();

    let err = timeout(WAIT, client.connected()).await.unwrap().unwrap_err();
    assert_eq!(
        err,
        QuicBridgeError::HandshakeFailed {
            status: Status::ConnectionRefused
        }
    );
}
