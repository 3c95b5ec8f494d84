//! Resumption and 0-RTT scenarios: ticket capture, resumed handshakes, and
//! pre-handshake data tagging.

use bytes::Bytes;
use quicbridge::{
    ClientConfig, ClientConnection, Credentials, Listener, Registration, SendFlags, ServerConfig,
};
use quicbridge_engine::LoopbackEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn server_config() -> ServerConfig {
    let mut config = ServerConfig::new("test", Credentials::self_signed("localhost"));
    config.resumption_payload = Bytes::from_static(b"srv-state");
    config
}

/// Connect once and capture the ticket the server issues at connect time.
async fn obtain_ticket(registration: &Registration, listener: &Listener, port: u16) -> Bytes {
    let client = ClientConnection::new(registration, ClientConfig::new("test")).unwrap();
    client.set_certificate_validator(|_| true);
    client.start("localhost", port).unwrap();

    let server = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    timeout(WAIT, client.connected()).await.unwrap().unwrap();
    assert!(!server.is_resumed());

    let ticket = timeout(WAIT, client.wait_resumption_ticket())
        .await
        .unwrap();
    assert!(!ticket.is_empty());
    assert_eq!(client.resumption_ticket(), ticket);

    client.shutdown().await;
    server.shutdown().await;
    ticket
}

#[tokio::test]
async fn client_receives_a_resumption_ticket() {
    let engine = Arc::new(LoopbackEngine::new());
    let registration = Registration::new(engine, "ticket_capture").unwrap();
    let listener = Listener::new(&registration, server_config()).unwrap();
    let bound = listener.start("127.0.0.1:0".parse().unwrap()).unwrap();

    let _ticket = obtain_ticket(&registration, &listener, bound.port()).await;
}

#[tokio::test]
async fn presenting_a_ticket_resumes_the_session() {
    let engine = Arc::new(LoopbackEngine::new());
    let registration = Registration::new(engine, "resumed_session").unwrap();
    let listener = Listener::new(&registration, server_config()).unwrap();
    let bound = listener.start("127.0.0.1:0".parse().unwrap()).unwrap();

    let ticket = obtain_ticket(&registration, &listener, bound.port()).await;

    let client = ClientConnection::new(&registration, ClientConfig::new("test")).unwrap();
    client.set_certificate_validator(|_| true);
    client.set_resumption_ticket(ticket).unwrap();
    client.start("localhost", bound.port()).unwrap();

    let server = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    timeout(WAIT, client.connected()).await.unwrap().unwrap();
    timeout(WAIT, server.connected()).await.unwrap().unwrap();

    assert!(server.is_resumed());
    assert!(client.is_resumed());
    // The application payload embedded at issue time comes back as
    // resumption state.
    assert_eq!(server.resumption_state().as_ref(), b"srv-state");
}

#[tokio::test]
async fn early_data_is_tagged_zero_rtt() {
    let engine = Arc::new(LoopbackEngine::new());
    let registration = Registration::new(engine, "early_data").unwrap();
    let listener = Listener::new(&registration, server_config()).unwrap();
    let bound = listener.start("127.0.0.1:0".parse().unwrap()).unwrap();

    let ticket = obtain_ticket(&registration, &listener, bound.port()).await;

    let client = ClientConnection::new(&registration, ClientConfig::new("test")).unwrap();
    client.set_certificate_validator(|_| true);
    client.set_resumption_ticket(ticket).unwrap();

    // Opened and sent before the handshake starts: rides 0-RTT.
    let early_stream = client.open_stream(true).unwrap();
    let pending = early_stream
        .send(Bytes::from_static(b"Hello"), SendFlags::fin())
        .unwrap();

    client.start("localhost", bound.port()).unwrap();

    let server = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    timeout(WAIT, server.connected()).await.unwrap().unwrap();
    assert!(server.is_resumed());

    let server_stream = timeout(WAIT, server.accept_stream()).await.unwrap().unwrap();
    timeout(WAIT, server_stream.readable()).await.unwrap();
    let mut received = [0u8; 16];
    let read = server_stream.receive(&mut received);
    assert_eq!(&received[..read], b"Hello");
    // Pre-handshake-confirmed data is distinguishable on arrival.
    assert!(server_stream.zero_rtt_received());

    timeout(WAIT, pending.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn fresh_connections_never_tag_zero_rtt() {
    let engine = Arc::new(LoopbackEngine::new());
    let registration = Registration::new(engine, "no_false_tag").unwrap();
    let listener = Listener::new(&registration, server_config()).unwrap();
    let bound = listener.start("127.0.0.1:0".parse().unwrap()).unwrap();

    let client = ClientConnection::new(&registration, ClientConfig::new("test")).unwrap();
    client.set_certificate_validator(|_| true);
    client.start("localhost", bound.port()).unwrap();

    let server = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    timeout(WAIT, client.connected()).await.unwrap().unwrap();

    let stream = client.open_stream(true).unwrap();
    stream
        .send(Bytes::from_static(b"Hello"), SendFlags::fin())
        .unwrap();

    let server_stream = timeout(WAIT, server.accept_stream()).await.unwrap().unwrap();
    timeout(WAIT, server_stream.readable()).await.unwrap();
    assert!(!server_stream.zero_rtt_received());
}
