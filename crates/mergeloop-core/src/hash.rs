use sha2::{Digest, Sha256};

/// Compute SHA-256 hash of bytes, returning lowercase hex string.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// First `len` hex chars of the SHA-256 digest of a set of fields.
/// Fields are separated by `\n` so adjacent values cannot run together.
pub fn short_digest(fields: &[&str], len: usize) -> String {
    let mut hasher = Sha256::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\n");
        }
        hasher.update(field.as_bytes());
    }
    let mut out = hex::encode(hasher.finalize());
    out.truncate(len.min(64));
    out
}
