//! Round-trip scenarios over the loopback engine: connection setup, stream
//! byte fidelity, and datagram acknowledgment.

use bytes::Bytes;
use quicbridge::{
    ClientConfig, ClientConnection, Credentials, DatagramOutcome, DatagramSend, Listener,
    Registration, SendFlags, ServerConfig, ServerConnection,
};
use quicbridge_engine::{DatagramSendState, LoopbackEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn connect_pair(
    registration: &Registration,
    alpn: &str,
) -> (Listener, ClientConnection, ServerConnection) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let server_config = ServerConfig::new(alpn, Credentials::self_signed("localhost"));
    let listener = Listener::new(registration, server_config).unwrap();
    let bound = listener.start("127.0.0.1:0".parse().unwrap()).unwrap();

    let client = ClientConnection::new(registration, ClientConfig::new(alpn)).unwrap();
    client.set_certificate_validator(|_| true);
    client.start("localhost", bound.port()).unwrap();

    let server = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    timeout(WAIT, client.connected()).await.unwrap().unwrap();
    timeout(WAIT, server.connected()).await.unwrap().unwrap();
    (listener, client, server)
}

#[tokio::test]
async fn connection_setup() {
    let engine = Arc::new(LoopbackEngine::new());
    let registration = Registration::new(engine, "connection_setup").unwrap();
    let (_listener, client, server) = connect_pair(&registration, "test").await;

    assert_eq!(client.negotiated_alpn().as_ref(), b"test");
    assert_eq!(server.negotiated_alpn().as_ref(), b"test");
    assert!(!client.is_resumed());
    assert!(!server.is_resumed());
    assert!(client.remote_addr().is_some());
    assert_eq!(client.remote_addr(), server.local_addr());
}

#[tokio::test]
async fn simple_stream_hello() {
    let engine = Arc::new(LoopbackEngine::new());
    let registration = Registration::new(engine, "simple_stream_hello").unwrap();
    let (_listener, client, server) = connect_pair(&registration, "test").await;

    let client_stream = client.open_stream(true).unwrap();
    let pending = client_stream
        .send(Bytes::from_static(b"Hello"), SendFlags::fin())
        .unwrap();

    let server_stream = timeout(WAIT, server.accept_stream()).await.unwrap().unwrap();
    assert!(server_stream.started());

    timeout(WAIT, server_stream.readable()).await.unwrap();
    let mut received = [0u8; 16];
    let read = server_stream.receive(&mut received);
    assert_eq!(read, 5);
    assert_eq!(&received[..read], b"Hello");

    timeout(WAIT, pending.wait()).await.unwrap().unwrap();
    assert!(pending.is_resolved());
}

#[tokio::test]
async fn multiple_outstanding_sends_preserve_order() {
    let engine = Arc::new(LoopbackEngine::new());
    let registration = Registration::new(engine, "multiple_sends").unwrap();
    let (_listener, client, server) = connect_pair(&registration, "test").await;

    let client_stream = client.open_stream(true).unwrap();
    let first = client_stream
        .send(Bytes::from_static(b"Hel"), SendFlags::default())
        .unwrap();
    let second = client_stream
        .send(Bytes::from_static(b"lo"), SendFlags::fin())
        .unwrap();

    let server_stream = timeout(WAIT, server.accept_stream()).await.unwrap().unwrap();
    let mut received = Vec::new();
    let mut chunk = [0u8; 8];
    while received.len() < 5 {
        timeout(WAIT, server_stream.readable()).await.unwrap();
        let read = server_stream.receive(&mut chunk);
        received.extend_from_slice(&chunk[..read]);
    }
    assert_eq!(received, b"Hello");

    let (first_result, second_result) =
        timeout(WAIT, futures::future::join(first.wait(), second.wait()))
            .await
            .unwrap();
    first_result.unwrap();
    second_result.unwrap();
}

#[tokio::test]
async fn no_sends_after_fin() {
    let engine = Arc::new(LoopbackEngine::new());
    let registration = Registration::new(engine, "no_sends_after_fin").unwrap();
    let (_listener, client, _server) = connect_pair(&registration, "test").await;

    let stream = client.open_stream(true).unwrap();
    stream
        .send(Bytes::from_static(b"bye"), SendFlags::fin())
        .unwrap();
    let err = stream
        .send(Bytes::from_static(b"more"), SendFlags::default())
        .unwrap_err();
    assert_eq!(err, quicbridge::QuicBridgeError::StreamClosed);
}

#[tokio::test]
async fn bidirectional_echo() {
    let engine = Arc::new(LoopbackEngine::new());
    let registration = Registration::new(engine, "bidirectional_echo").unwrap();
    let (_listener, client, server) = connect_pair(&registration, "test").await;

    let client_stream = client.open_stream(true).unwrap();
    client_stream
        .send(Bytes::from_static(b"ping"), SendFlags::default())
        .unwrap();

    let server_stream = timeout(WAIT, server.accept_stream()).await.unwrap().unwrap();
    timeout(WAIT, server_stream.readable()).await.unwrap();
    let mut request = [0u8; 8];
    let read = server_stream.receive(&mut request);
    assert_eq!(&request[..read], b"ping");

    server_stream
        .send(Bytes::from_static(b"pong"), SendFlags::default())
        .unwrap();
    timeout(WAIT, client_stream.readable()).await.unwrap();
    let mut reply = [0u8; 8];
    let read = client_stream.receive(&mut reply);
    assert_eq!(&reply[..read], b"pong");
}

#[tokio::test]
async fn datagram_push_observation() {
    let engine = Arc::new(LoopbackEngine::new());
    let registration = Registration::new(engine, "datagram_push").unwrap();
    let (_listener, client, server) = connect_pair(&registration, "test").await;

    let datagram = DatagramSend::pinned(Bytes::from_static(b"Hello"));
    // Subscribe before issuing so every transition is observed.
    let mut changes = datagram.state_changes();
    client.send_datagram(&datagram).unwrap();

    let received = timeout(WAIT, server.recv_datagram()).await.unwrap().unwrap();
    assert_eq!(received.payload.as_ref(), b"Hello");
    assert!(!received.zero_rtt);

    let first = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
    let second = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
    // Sent strictly precedes the acknowledgment.
    assert_eq!(first, DatagramSendState::Sent);
    assert!(matches!(
        second,
        DatagramSendState::Acknowledged | DatagramSendState::AcknowledgedSpurious
    ));
}

#[tokio::test]
async fn datagram_pull_observation() {
    let engine = Arc::new(LoopbackEngine::new());
    let registration = Registration::new(engine, "datagram_pull").unwrap();
    let (_listener, client, server) = connect_pair(&registration, "test").await;

    let datagram = DatagramSend::copied(b"Hello");
    client.send_datagram(&datagram).unwrap();

    timeout(WAIT, datagram.wait_sent()).await.unwrap().unwrap();
    let outcome = timeout(WAIT, datagram.wait_acknowledged()).await.unwrap();
    assert!(outcome.is_delivered());
    assert_eq!(outcome, DatagramOutcome::Acknowledged);

    let received = timeout(WAIT, server.recv_datagram()).await.unwrap().unwrap();
    assert_eq!(received.payload.as_ref(), b"Hello");
}

#[tokio::test]
async fn datagram_cannot_be_issued_twice() {
    let engine = Arc::new(LoopbackEngine::new());
    let registration = Registration::new(engine, "datagram_once").unwrap();
    let (_listener, client, _server) = connect_pair(&registration, "test").await;

    let datagram = DatagramSend::copied(b"Hello");
    client.send_datagram(&datagram).unwrap();
    assert!(client.send_datagram(&datagram).is_err());
}
