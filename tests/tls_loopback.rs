//! Framed transport over TLS-wrapped loopback sockets.

use anyhow::Result;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use framelink::{tls, Connection, Message, Role, TransportConfig, WireError};

fn test_config() -> TransportConfig {
    TransportConfig {
        read_timeout_secs: 10,
        ..TransportConfig::default()
    }
}

#[test]
fn tls_round_trip_and_tofu_pinning() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cert = dir.path().join("cert.pem");
    let key = dir.path().join("key.pem");
    let known_hosts = dir.path().join("known_hosts");

    let server_tls = Arc::new(tls::load_or_generate_server_config(
        Some(cert.clone()),
        Some(key.clone()),
    )?);
    assert!(cert.exists() && key.exists(), "self-signed pair persisted");

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    // Client drives its half from a second thread; the TLS handshake needs
    // both sides pumping the socket at once.
    let known_for_client = known_hosts.clone();
    let client_thread = thread::spawn(move || -> framelink::Result<Vec<u8>> {
        let stream = TcpStream::connect(addr).map_err(WireError::Io)?;
        let cfg = Arc::new(tls::client_config_with_known_hosts(
            "127.0.0.1",
            addr.port(),
            known_for_client,
        ));
        let session = rustls::ClientConnection::new(cfg, tls::server_name_for("127.0.0.1")?)
            .map_err(|e| WireError::Tls(e.to_string()))?;
        let tls_stream = rustls::StreamOwned::new(session, stream);
        let mut client = Connection::from_socket(Box::new(tls_stream), Role::Client, test_config())?;
        client.send(&Message::raw(b"over tls".to_vec()))?;
        match client.receive(0)? {
            Message::Raw(reply) => Ok(reply),
            other => Err(WireError::ProtocolViolation {
                reason: format!("unexpected reply {other:?}"),
            }),
        }
    });

    let (stream, _) = listener.accept()?;
    let tls_stream = tls::wrap_server(stream, server_tls)?;
    let mut server = Connection::from_socket(Box::new(tls_stream), Role::Server, test_config())?;
    match server.receive(0)? {
        Message::Raw(got) => assert_eq!(got, b"over tls"),
        other => panic!("expected raw message, got {other:?}"),
    }
    server.send(&Message::raw(b"ack over tls".to_vec()))?;

    let reply = client_thread.join().unwrap()?;
    assert_eq!(reply, b"ack over tls");

    // First contact pinned the server certificate.
    let pinned = std::fs::read_to_string(&known_hosts)?;
    assert!(pinned.contains(&format!("127.0.0.1:{}", addr.port())));
    Ok(())
}
