//! Password hashing.

use sha2::{Digest, Sha224};

/// SHA-224 of the password as lowercase hex, the trojan wire identity.
#[inline]
pub fn sha224_hex(password: &str) -> String {
    let mut hasher = Sha224::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}
