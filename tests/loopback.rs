//! End-to-end tests over real loopback TCP connections.

use anyhow::Result;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use framelink::bulk;
use framelink::checksum::{hex_digest, ChecksumKind};
use framelink::stream;
use framelink::{AbortHandle, Connection, Control, Message, Role, TransportConfig, WireError};

const ABCDEF_MD5: &str = "5ab557c937e38f15291c04b7e99544ad";

fn test_config() -> TransportConfig {
    TransportConfig {
        packet_size: 4096,
        chunk_size: 8192,
        read_timeout_secs: 10,
        channel_buffer: 4,
        ..TransportConfig::default()
    }
}

/// Connected client/server pair over a fresh loopback listener.
fn pair(cfg: TransportConfig) -> Result<(Connection, Connection)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let server_cfg = cfg.clone();
    let accept = thread::spawn(move || Connection::accept(&listener, server_cfg));
    let client = Connection::connect(addr, cfg)?;
    let server = accept.join().unwrap()?;
    Ok((client, server))
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn round_trip_across_packet_boundaries() -> Result<()> {
    let cfg = test_config();
    let ps = cfg.packet_size;
    let (mut client, mut server) = pair(cfg)?;
    for size in [0, ps - 1, ps, ps + 1, 10 * ps] {
        let payload = patterned(size);
        client.send(&Message::raw(payload.clone()))?;
        match server.receive(0)? {
            Message::Raw(got) => assert_eq!(got, payload, "size {size}"),
            other => panic!("expected raw message, got {other:?}"),
        }
        // And the other direction.
        server.send(&Message::raw(payload.clone()))?;
        assert_eq!(client.receive(0)?, Message::Raw(payload));
    }
    Ok(())
}

#[test]
fn control_messages_round_trip() -> Result<()> {
    let (mut client, mut server) = pair(test_config())?;
    client.send(&Message::Control(Control::TransferEnd {
        checksum: ABCDEF_MD5.to_string(),
    }))?;
    client.send(&Message::Control(Control::Ack))?;
    assert_eq!(
        server.receive(0)?,
        Message::Control(Control::TransferEnd {
            checksum: ABCDEF_MD5.to_string()
        })
    );
    assert_eq!(server.receive(0)?, Message::Control(Control::Ack));
    Ok(())
}

#[test]
fn keepalive_is_invisible_to_data() -> Result<()> {
    let mut cfg = test_config();
    cfg.keepalive_secs = 1;
    let (mut client, mut server) = pair(cfg)?;

    thread::sleep(Duration::from_millis(1100));
    assert!(client.maybe_keepalive()?, "ping was due after the lapse");
    assert!(client.keepalive_outstanding());
    assert!(
        !client.maybe_keepalive()?,
        "only one ping may be outstanding"
    );

    // Data sent after the ping arrives unchanged; the server answers the
    // ping internally before handing the data frame back.
    let payload = patterned(10_000);
    client.send(&Message::raw(payload.clone()))?;
    assert_eq!(server.receive(0)?, Message::Raw(payload));

    // Servicing the pong clears the outstanding flag without blocking for
    // a real message.
    assert_eq!(client.poll_receive(0)?, None);
    assert!(!client.keepalive_outstanding());
    Ok(())
}

#[test]
fn receive_times_out_without_traffic() -> Result<()> {
    let mut cfg = test_config();
    cfg.read_timeout_secs = 1;
    let (_client, mut server) = pair(cfg)?;
    match server.receive(0) {
        Err(WireError::Timeout { .. }) => Ok(()),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[test]
fn closed_peer_is_reported() -> Result<()> {
    let (client, mut server) = pair(test_config())?;
    drop(client);
    match server.receive(0) {
        Err(WireError::ConnectionClosed { .. }) => Ok(()),
        other => panic!("expected connection-closed, got {other:?}"),
    }
}

#[test]
fn oversized_frame_is_rejected_before_buffering() -> Result<()> {
    let (mut client, mut server) = pair(test_config())?;
    client.send(&Message::raw(patterned(50_000)))?;
    match server.receive(1024) {
        Err(WireError::ReadLimitExceeded { got, limit }) => {
            assert_eq!(got, 50_000);
            assert_eq!(limit, 1024);
            Ok(())
        }
        other => panic!("expected read-limit error, got {other:?}"),
    }
}

#[test]
fn garbage_on_the_wire_is_a_decode_error() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let accept = thread::spawn(move || Connection::accept(&listener, test_config()));
    let mut raw = TcpStream::connect(addr)?;
    let mut server = accept.join().unwrap()?;
    raw.write_all(b"hello there")?;
    match server.receive(0) {
        Err(WireError::DecodeError { .. }) => Ok(()),
        other => panic!("expected decode error, got {other:?}"),
    }
}

#[test]
fn malformed_keepalive_does_not_kill_the_connection() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let accept = thread::spawn(move || Connection::accept(&listener, test_config()));
    let mut raw = TcpStream::connect(addr)?;
    let mut server = accept.join().unwrap()?;

    // A keep-alive frame whose payload is not a keep-alive value.
    raw.write_all(b"#KA3:zzz")?;
    match server.receive(0) {
        Err(WireError::ProtocolViolation { .. }) => {}
        other => panic!("expected protocol violation, got {other:?}"),
    }

    // The offending bytes were consumed; the connection keeps working.
    raw.write_all(b"2:ok")?;
    assert_eq!(server.receive(0)?, Message::Raw(b"ok".to_vec()));
    Ok(())
}

/// The documented wire scenario: a 7-byte transfer with packet_size=4 still
/// produces a single `7:abcdef\n` frame, followed by an EOF frame carrying
/// the MD5 of the payload.
#[test]
fn wire_format_of_a_small_transfer() -> Result<()> {
    let mut cfg = test_config();
    cfg.packet_size = 4;
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    let sender = thread::spawn(move || -> framelink::Result<stream::TransferSummary> {
        let mut conn = Connection::connect(addr, cfg)?;
        stream::send(&mut conn, &mut &b"abcdef\n"[..], None)
    });

    let (mut raw, _) = listener.accept()?;
    // The chunk frame is raw bytes behind a decimal length header, written
    // in 4-byte packets but framed exactly once.
    let mut first = [0u8; 9];
    raw.read_exact(&mut first)?;
    assert_eq!(&first, b"7:abcdef\n");

    // Speak the rest of the protocol through a real connection on the same
    // socket: ack the chunk, then collect the end-of-transfer frame.
    let mut conn = Connection::from_stream(raw, Role::Server, test_config())?;
    conn.send(&Message::Control(Control::Ack))?;
    match conn.receive(0)? {
        Message::Control(Control::TransferEnd { checksum }) => {
            assert_eq!(checksum, ABCDEF_MD5);
        }
        other => panic!("expected end-of-transfer, got {other:?}"),
    }

    let summary = sender.join().unwrap()?;
    assert_eq!(summary.bytes, 7);
    assert_eq!(summary.checksum, ABCDEF_MD5);
    assert!(!summary.aborted);
    Ok(())
}

#[test]
fn streamed_transfer_round_trips() -> Result<()> {
    let (mut client, mut server) = pair(test_config())?;
    // 3.5 chunks: exercises both full and partial chunk frames.
    let payload = patterned(8192 * 3 + 4096);
    let expected_sum = hex_digest(&payload, ChecksumKind::Md5);

    let payload_clone = payload.clone();
    let sender = thread::spawn(move || -> framelink::Result<stream::TransferSummary> {
        stream::send(&mut client, &mut payload_clone.as_slice(), None)
    });

    let mut sink = Vec::new();
    let received = stream::receive(&mut server, &mut sink, 0, None)?;
    let sent = sender.join().unwrap()?;

    assert_eq!(sink, payload);
    assert_eq!(received.bytes, payload.len() as u64);
    assert_eq!(received.checksum, expected_sum);
    assert_eq!(sent.checksum, expected_sum);
    assert!(!received.aborted && !sent.aborted);
    Ok(())
}

#[test]
fn chunk_multiple_payload_round_trips() -> Result<()> {
    let (mut client, mut server) = pair(test_config())?;
    let payload = patterned(8192 * 2); // exactly two chunks
    let payload_clone = payload.clone();
    let sender = thread::spawn(move || -> framelink::Result<stream::TransferSummary> {
        stream::send(&mut client, &mut payload_clone.as_slice(), None)
    });
    let mut sink = Vec::new();
    let received = stream::receive(&mut server, &mut sink, 0, None)?;
    sender.join().unwrap()?;
    assert_eq!(sink, payload);
    assert_eq!(received.bytes, 8192 * 2);
    Ok(())
}

#[test]
fn zero_length_transfer() -> Result<()> {
    let (mut client, mut server) = pair(test_config())?;
    let sender = thread::spawn(move || -> framelink::Result<stream::TransferSummary> {
        stream::send(&mut client, &mut &b""[..], None)
    });
    let mut sink = Vec::new();
    let received = stream::receive(&mut server, &mut sink, 0, None)?;
    let sent = sender.join().unwrap()?;
    assert!(sink.is_empty());
    assert_eq!(received.bytes, 0);
    assert_eq!(received.checksum, "d41d8cd98f00b204e9800998ecf8427e");
    assert_eq!(sent.checksum, received.checksum);
    Ok(())
}

#[test]
fn corrupted_checksum_is_reported_as_mismatch() -> Result<()> {
    let (mut client, mut server) = pair(test_config())?;
    // Hand-roll a sender that announces the wrong digest.
    let sender = thread::spawn(move || -> framelink::Result<()> {
        client.send(&Message::raw(b"abcd".to_vec()))?;
        match client.receive(0)? {
            Message::Control(Control::Ack) => {}
            other => panic!("expected ack, got {other:?}"),
        }
        client.send(&Message::Control(Control::TransferEnd {
            checksum: "0000000000000000000000000000dead".to_string(),
        }))?;
        Ok(())
    });

    let mut sink = Vec::new();
    match stream::receive(&mut server, &mut sink, 0, None) {
        Err(WireError::ChecksumMismatch {
            announced,
            computed,
            bytes,
        }) => {
            assert_eq!(bytes, 4);
            assert_eq!(announced, "0000000000000000000000000000dead");
            assert_eq!(computed, hex_digest(b"abcd", ChecksumKind::Md5));
        }
        other => panic!("expected checksum mismatch, got {other:?}"),
    }
    sender.join().unwrap()?;
    Ok(())
}

#[test]
fn receive_limit_stops_before_the_sink() -> Result<()> {
    let (mut client, mut server) = pair(test_config())?;
    let payload = patterned(100_000);
    let sender = thread::spawn(move || -> framelink::Result<stream::TransferSummary> {
        stream::send(&mut client, &mut payload.as_slice(), None)
    });

    // Two full 8 KiB chunks fit under the limit; the third must not reach
    // the sink at all.
    let mut sink = Vec::new();
    match stream::receive(&mut server, &mut sink, 20_000, None) {
        Err(WireError::ReadLimitExceeded { got, limit }) => {
            assert_eq!(limit, 20_000);
            assert_eq!(got, 8192 * 3);
        }
        other => panic!("expected read-limit error, got {other:?}"),
    }
    assert_eq!(sink.len(), 8192 * 2, "offending chunk must be discarded");

    // The sender sees the abort as a negotiated stop, not an error.
    let sent = sender.join().unwrap()?;
    assert!(sent.aborted);
    Ok(())
}

#[test]
fn sender_abort_is_negotiated() -> Result<()> {
    let (mut client, mut server) = pair(test_config())?;
    let handle = AbortHandle::new();
    handle.abort();
    let sender = thread::spawn(move || -> framelink::Result<stream::TransferSummary> {
        stream::send(&mut client, &mut patterned(50_000).as_slice(), Some(&handle))
    });
    let mut sink = Vec::new();
    let received = stream::receive(&mut server, &mut sink, 0, None)?;
    let sent = sender.join().unwrap()?;
    assert!(received.aborted);
    assert!(sent.aborted);
    assert_eq!(sent.bytes, 0, "abort observed before the first chunk");
    assert!(sink.is_empty());
    Ok(())
}

#[test]
fn receiver_abort_stops_both_sides() -> Result<()> {
    let (mut client, mut server) = pair(test_config())?;
    let payload = patterned(100_000);
    let sender = thread::spawn(move || -> framelink::Result<stream::TransferSummary> {
        stream::send(&mut client, &mut payload.as_slice(), None)
    });

    let handle = AbortHandle::new();
    handle.abort();
    let mut sink = Vec::new();
    let received = stream::receive(&mut server, &mut sink, 0, Some(&handle))?;
    let sent = sender.join().unwrap()?;

    assert!(received.aborted, "abort returns success, not an error");
    assert!(sent.aborted);
    assert!(sink.is_empty(), "no chunk is written after the abort");
    Ok(())
}

fn write_file(path: &Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut remaining = size;
    let mut val: u8 = 0;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_add(1);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n])?;
        remaining -= n;
    }
    Ok(())
}

fn build_sample_tree(root: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(root.join("tree/empty"))?;
    write_file(&root.join("tree/a.txt"), 8 * 1024)?;
    write_file(&root.join("tree/sub/deep/b.bin"), 300 * 1024)?;
    // Bigger than channel_buffer * chunk_size, forcing many pipe cycles.
    write_file(&root.join("tree/big.bin"), 3 * 1024 * 1024)?;
    write_file(&root.join("single.dat"), 1024)?;
    Ok(vec![root.join("tree"), root.join("single.dat")])
}

fn assert_trees_match(src: &Path, dst: &Path) -> Result<()> {
    for rel in [
        "tree/a.txt",
        "tree/sub/deep/b.bin",
        "tree/big.bin",
        "single.dat",
    ] {
        let a = std::fs::read(src.join(rel))?;
        let b = std::fs::read(dst.join(rel))?;
        assert_eq!(a, b, "content mismatch for {rel}");
    }
    assert!(dst.join("tree/empty").is_dir(), "empty directory survives");
    Ok(())
}

fn bulk_round_trip(compress: bool) -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let paths = build_sample_tree(src.path())?;

    let (mut client, mut server) = pair(test_config())?;
    let sender = thread::spawn(move || -> framelink::Result<bulk::BulkSummary> {
        bulk::send_paths(&mut client, &paths, compress, None)
    });
    let received = bulk::receive_into(&mut server, dst.path(), compress, 0, None)?;
    let sent = sender.join().unwrap()?;

    assert_eq!(sent.entries, 4);
    assert_eq!(received.entries, 4);
    assert_eq!(sent.payload_bytes, received.payload_bytes);
    assert_eq!(sent.archive_bytes, received.archive_bytes);
    if compress {
        assert!(
            received.archive_bytes < received.payload_bytes,
            "patterned data must compress"
        );
    }
    assert_trees_match(src.path(), dst.path())?;
    Ok(())
}

#[test]
fn bulk_transfer_round_trips() -> Result<()> {
    bulk_round_trip(false)
}

#[test]
fn compressed_bulk_transfer_round_trips() -> Result<()> {
    bulk_round_trip(true)
}

#[test]
fn spooled_bulk_transfer_round_trips() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let paths = build_sample_tree(src.path())?;

    let (mut client, mut server) = pair(test_config())?;
    let sender = thread::spawn(move || -> framelink::Result<bulk::BulkSummary> {
        bulk::send_paths_spooled(&mut client, &paths, false, None)
    });
    let received = bulk::receive_into(&mut server, dst.path(), false, 0, None)?;
    let sent = sender.join().unwrap()?;

    assert_eq!(sent.entries, received.entries);
    assert_eq!(sent.archive_bytes, received.archive_bytes);
    assert_trees_match(src.path(), dst.path())?;
    Ok(())
}

#[test]
fn bulk_receive_respects_size_limit() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let paths = build_sample_tree(src.path())?;

    let (mut client, mut server) = pair(test_config())?;
    let sender = thread::spawn(move || -> framelink::Result<bulk::BulkSummary> {
        bulk::send_paths(&mut client, &paths, false, None)
    });
    match bulk::receive_into(&mut server, dst.path(), false, 64 * 1024, None) {
        Err(WireError::ReadLimitExceeded { .. }) => {}
        other => panic!("expected read-limit error, got {other:?}"),
    }
    // The sender observed the abort handshake and stopped cleanly.
    let sent = sender.join().unwrap()?;
    assert!(sent.aborted);
    Ok(())
}
