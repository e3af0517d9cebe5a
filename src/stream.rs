//! Chunked byte-stream transfer with running checksum and abort handshake.
//!
//! The sender moves fixed-size chunks as raw frames, waiting for a one-word
//! acknowledgement after each, then announces a digest of everything sent.
//! Either side may stop the transfer with a single `Abort` in place of its
//! next expected message; an observed abort is a negotiated outcome, not an
//! error. Memory use is bounded to one chunk regardless of payload size.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::checksum::{ChecksumKind, TransferChecksum};
use crate::error::{Result, WireError};
use crate::message::{Control, Message};
use crate::transport::Connection;

/// Cooperative cancellation flag shared with an in-progress transfer.
#[derive(Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a finished or negotiated-abort transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    /// Payload bytes moved (excludes framing and control traffic).
    pub bytes: u64,
    /// Hex digest of exactly the bytes moved.
    pub checksum: String,
    /// True when the transfer ended on an abort from either side.
    pub aborted: bool,
}

/// Stream `source` to the peer in chunk-size raw frames.
pub fn send<R: Read>(
    conn: &mut Connection,
    source: &mut R,
    abort: Option<&AbortHandle>,
) -> Result<TransferSummary> {
    send_with(conn, source, ChecksumKind::default(), abort)
}

pub fn send_with<R: Read>(
    conn: &mut Connection,
    source: &mut R,
    kind: ChecksumKind,
    abort: Option<&AbortHandle>,
) -> Result<TransferSummary> {
    let chunk_size = conn.config().chunk_size;
    let mut digest = TransferChecksum::new(kind);
    let mut sent: u64 = 0;
    let mut chunk = vec![0u8; chunk_size];
    loop {
        if abort.map_or(false, AbortHandle::is_aborted) {
            conn.send(&Message::Control(Control::Abort))?;
            let summary = TransferSummary {
                bytes: sent,
                checksum: digest.finalize(),
                aborted: true,
            };
            conn.event_log().transfer_done(conn.peer(), summary.bytes, true);
            return Ok(summary);
        }
        let n = read_full(source, &mut chunk)?;
        if n == 0 {
            break;
        }
        digest.update(&chunk[..n]);
        conn.send(&Message::Raw(chunk[..n].to_vec()))?;
        sent += n as u64;
        // One-word acknowledgement after every chunk.
        match expect_control(conn)? {
            Control::Ack => {}
            Control::Abort => {
                let summary = TransferSummary {
                    bytes: sent,
                    checksum: digest.finalize(),
                    aborted: true,
                };
                conn.event_log().transfer_done(conn.peer(), summary.bytes, true);
                return Ok(summary);
            }
            other => {
                return Err(WireError::ProtocolViolation {
                    reason: format!("expected chunk acknowledgement, got {other:?}"),
                })
            }
        }
    }
    let checksum = digest.finalize();
    conn.send(&Message::Control(Control::TransferEnd {
        checksum: checksum.clone(),
    }))?;
    conn.event_log().transfer_done(conn.peer(), sent, false);
    Ok(TransferSummary {
        bytes: sent,
        checksum,
        aborted: false,
    })
}

/// Receive a streamed transfer into `sink`, enforcing `max_size` (0 = no
/// limit) and verifying the sender's announced digest.
pub fn receive<W: Write>(
    conn: &mut Connection,
    sink: &mut W,
    max_size: u64,
    abort: Option<&AbortHandle>,
) -> Result<TransferSummary> {
    receive_with(conn, sink, ChecksumKind::default(), max_size, abort)
}

pub fn receive_with<W: Write>(
    conn: &mut Connection,
    sink: &mut W,
    kind: ChecksumKind,
    max_size: u64,
    abort: Option<&AbortHandle>,
) -> Result<TransferSummary> {
    let mut digest = TransferChecksum::new(kind);
    let mut received: u64 = 0;
    loop {
        match conn.receive(0)? {
            Message::Raw(chunk) => {
                if max_size > 0 && received + chunk.len() as u64 > max_size {
                    // The whole in-flight chunk is discarded: nothing of it
                    // reaches the sink. Stop the sender before failing.
                    conn.send(&Message::Control(Control::Abort))?;
                    return Err(WireError::ReadLimitExceeded {
                        got: (received + chunk.len() as u64) as usize,
                        limit: max_size as usize,
                    });
                }
                if abort.map_or(false, AbortHandle::is_aborted) {
                    conn.send(&Message::Control(Control::Abort))?;
                    let summary = TransferSummary {
                        bytes: received,
                        checksum: digest.finalize(),
                        aborted: true,
                    };
                    conn.event_log().transfer_done(conn.peer(), summary.bytes, true);
                    return Ok(summary);
                }
                if let Err(e) = sink.write_all(&chunk) {
                    // A dead sink is local; stop the sender instead of
                    // leaving it waiting for an acknowledgement.
                    let _ = conn.send(&Message::Control(Control::Abort));
                    return Err(WireError::Io(e));
                }
                digest.update(&chunk);
                received += chunk.len() as u64;
                conn.send(&Message::Control(Control::Ack))?;
            }
            Message::Control(Control::TransferEnd { checksum }) => {
                let computed = digest.finalize();
                if computed != checksum {
                    return Err(WireError::ChecksumMismatch {
                        announced: checksum,
                        computed,
                        bytes: received,
                    });
                }
                conn.event_log().transfer_done(conn.peer(), received, false);
                return Ok(TransferSummary {
                    bytes: received,
                    checksum: computed,
                    aborted: false,
                });
            }
            Message::Control(Control::Abort) => {
                let summary = TransferSummary {
                    bytes: received,
                    checksum: digest.finalize(),
                    aborted: true,
                };
                conn.event_log().transfer_done(conn.peer(), summary.bytes, true);
                return Ok(summary);
            }
            Message::Control(other) => {
                return Err(WireError::ProtocolViolation {
                    reason: format!("expected chunk or end-of-transfer, got {other:?}"),
                })
            }
        }
    }
}

fn expect_control(conn: &mut Connection) -> Result<Control> {
    match conn.receive(0)? {
        Message::Control(ctl) => Ok(ctl),
        Message::Raw(bytes) => Err(WireError::ProtocolViolation {
            reason: format!("expected acknowledgement, got {} raw bytes", bytes.len()),
        }),
    }
}

/// Fill `buf` from `src`, tolerating short reads; returns bytes read, 0 at EOF.
fn read_full<R: Read>(src: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(WireError::Io(e)),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_handle_is_shared() {
        let h = AbortHandle::new();
        let h2 = h.clone();
        assert!(!h.is_aborted());
        h2.abort();
        assert!(h.is_aborted());
    }

    #[test]
    fn read_full_tolerates_short_reads() {
        // A chained reader yields one short read per segment.
        let data = b"abcdefghij";
        let mut src = std::io::Read::chain(&data[..4], &data[4..]);
        let mut buf = [0u8; 10];
        assert_eq!(read_full(&mut src, &mut buf).unwrap(), 10);
        assert_eq!(&buf, data);
        assert_eq!(read_full(&mut src, &mut buf).unwrap(), 0);
    }
}
