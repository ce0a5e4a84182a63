//! JSON body codec for control requests and responses.

use std::io;

use serde::{Deserialize, Serialize};

/// Maximum accepted response body (16 MiB).
pub const MAX_BODY: usize = 16 * 1024 * 1024;

/// Serializes `msg` as a JSON request body.
pub fn encode(msg: &impl Serialize) -> io::Result<Vec<u8>> {
    serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Decodes a JSON response body.
pub fn decode<T: for<'de> Deserialize<'de>>(body: &[u8]) -> serde_json::Result<T> {
    serde_json::from_slice(body)
}

/// Rejects bodies above [`MAX_BODY`].
pub fn check_len(len: usize) -> io::Result<()> {
    if len > MAX_BODY {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "response body exceeds 16 MiB limit",
        ));
    }
    Ok(())
}
