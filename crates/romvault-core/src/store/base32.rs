//! RFC 4648 Base32 (`A-Z2-7`) without padding, used for path-safe tokens.

use data_encoding::BASE32_NOPAD;

pub fn encode(bytes: &[u8]) -> String {
    BASE32_NOPAD.encode(bytes)
}

/// Case-insensitive: the input is uppercased before decoding.
pub fn decode(token: &str) -> Option<Vec<u8>> {
    BASE32_NOPAD
        .decode(token.trim().to_ascii_uppercase().as_bytes())
        .ok()
}
