//! Credential digests

use rand::RngCore;
use sha1::{Digest, Sha1};

/// Fresh random salt, hex encoded
pub fn new_salt() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    to_hex(&bytes)
}

/// Hex SHA-1 of salt followed by password
pub fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    to_hex(&hasher.finalize())
}

pub fn verify(salt: &str, password: &str, expected: &str) -> bool {
    digest(salt, password) == expected
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
