//! Base64 helpers used for carrying binary blobs in JSON payloads.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

pub fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn decode(data: &str) -> Option<Vec<u8>> {
    STANDARD.decode(data).ok()
}
