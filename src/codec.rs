//! Control-message codec seam.
//!
//! The application payload codec lives above this crate; the only values the
//! transport itself needs to marshal are [`Control`] messages, and this trait
//! is the seam for swapping their wire encoding.

use crate::error::{Result, WireError};
use crate::message::Control;

pub trait Codec: Send + Sync {
    fn encode(&self, msg: &Control) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Control>;
}

/// Default codec: compact binary encoding.
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode(&self, msg: &Control) -> Result<Vec<u8>> {
        bincode::serialize(msg).map_err(|e| WireError::DecodeError {
            reason: format!("encode control: {e}"),
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<Control> {
        bincode::deserialize(bytes).map_err(|e| WireError::DecodeError {
            reason: format!("decode control: {e}"),
        })
    }
}

/// Human-readable alternative, handy when tapping a connection with tcpdump.
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, msg: &Control) -> Result<Vec<u8>> {
        serde_json::to_vec(msg).map_err(|e| WireError::DecodeError {
            reason: format!("encode control: {e}"),
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<Control> {
        serde_json::from_slice(bytes).map_err(|e| WireError::DecodeError {
            reason: format!("decode control: {e}"),
        })
    }
}
