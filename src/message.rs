//! Messages exchanged over a connection.

use serde::{Deserialize, Serialize};

/// One unit handed to or returned from the transport.
///
/// Raw payloads are framed byte-identical on the wire and the control codec
/// never sees them; control values are codec-encoded behind a frame-level
/// magic, so the variant is unambiguous at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Opaque payload bytes (RPC request/response bodies, stream chunks).
    Raw(Vec<u8>),
    /// Structured control value for the transfer sub-protocols.
    Control(Control),
}

/// Closed set of control values carried behind the magic-tagged frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Control {
    /// Liveness probe (`ping: true`) or its reply (`ping: false`).
    KeepAlive { id: String, ping: bool },
    /// End of a streamed transfer: hex digest of every byte sent.
    TransferEnd { checksum: String },
    /// Per-chunk success acknowledgement.
    Ack,
    /// Negotiated early stop; either side may send it once.
    Abort,
}

impl Message {
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Message::Raw(bytes.into())
    }
}
