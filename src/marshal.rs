//! Wire-level encode/decode of the protocol messages.
//!
//! The encoding is serde_json: self-describing, stable across peers, and a
//! failed decode is an `Option::None` instead of a fault. Any bytes that do
//! not decode must end up as a `WrongArg` reply at the caller, never a crash.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::CMError;

/// Encode a protocol message into its wire bytes.
pub fn dump<T: Serialize>(v: &T) -> Result<Vec<u8>, CMError> {
    serde_json::to_vec(v).map_err(|_| CMError::Marshal("serialize"))
}

/// Decode wire bytes into a protocol message.
/// Malformed, truncated or unknown-shape bytes yield `None`.
pub fn dedump<T: DeserializeOwned>(bytes: &[u8]) -> Option<T> {
    serde_json::from_slice(bytes).ok()
}

/// A reply that decodes as either `MRReply` or `RCReply` with
/// `status == WrongArg`. Used when the request bytes are too garbled to even
/// tell which reply type the peer expects.
#[inline]
pub fn wrong_arg_reply() -> Vec<u8> {
    br#"{"status":"WrongArg","attr":null}"#.to_vec()
}
