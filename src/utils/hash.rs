use std::fmt::Write;

#[inline]
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut output, b| {
        let _ = write!(output, "{b:02x}");
        output
    })
}

/// Short stable key for on-disk file names derived from a URL.
pub fn short_hash(text: &str) -> String {
    let hash = blake3::hash(text.as_bytes());
    hex_encode(&hash.as_bytes()[..8])
}

/// Full content hash, used for fingerprint cache keys.
pub fn hash_string_as_hex(text: &str) -> String {
    hex_encode(blake3::hash(text.as_bytes()).as_bytes())
}
