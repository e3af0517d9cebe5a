//! Framelink: connection-level framing, liveness, and bulk transfer for
//! long-lived RPC connections.
//!
//! One TCP (optionally TLS) socket carries three interleaved concerns:
//! opaque request/response payloads, a keep-alive sub-protocol that can
//! never be mistaken for data, and checksummed byte streams with
//! cooperative cancellation - with memory bounded regardless of payload
//! size.

pub mod bulk;
pub mod checksum;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod keepalive;
pub mod logger;
pub mod message;
pub mod protocol;
pub mod socket;
pub mod stream;
pub mod tls;
pub mod transport;

pub use config::TransportConfig;
pub use error::{Result, WireError};
pub use message::{Control, Message};
pub use stream::{AbortHandle, TransferSummary};
pub use transport::{Connection, Role};
