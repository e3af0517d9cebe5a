//! Shared wire-format constants for the framed transport

// A keep-alive frame is this magic immediately followed by one data frame
// whose payload decodes to a ping/pong control value. The first byte of a
// data frame is always an ASCII digit, so the prefix cannot be mistaken
// for a length header.
pub const KEEPALIVE_MAGIC: &[u8; 3] = b"#KA";

// Transfer-control frames (acks, EOF markers, aborts) carry the same shape
// behind their own magic, keeping raw chunk frames byte-identical on the wire.
pub const CONTROL_MAGIC: &[u8; 3] = b"#TC";

// Frame writes are split into packets of this size; one message is still
// exactly one frame on the wire.
pub const PACKET_SIZE: usize = 1024 * 1024;

// Fixed chunk size for streamed transfers.
pub const CHUNK_SIZE: usize = 1024 * 1024;

// Hard frame cap (64MB) - prevents DoS via memory exhaustion even when a
// caller passes no limit of its own.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

// A length header longer than this many digits is malformed, not merely big.
pub const MAX_HEADER_DIGITS: usize = 20;

// Control payloads are one-word markers or a hex digest; anything larger is
// a protocol violation.
pub const MAX_CONTROL_SIZE: usize = 4096;
