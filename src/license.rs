//! Expiry-key validation.
//!
//! A license key is 32 lowercase hex characters: the first 16 encode
//! the expiry (UTC milliseconds, big-endian u64), the last 16 are the
//! first 8 bytes of SHA-256 over `"{project}:{expiry_hex}"`. Decoding
//! is a pure function; whether the expiry has passed is the caller's
//! concern.

use sha2::{Digest, Sha256};

const KEY_LEN: usize = 32;
const EXPIRY_HEX_LEN: usize = 16;

/// Decode a key issued for `project`, returning the expiry timestamp
/// in UTC milliseconds. `None` means the key is malformed or was issued
/// for a different project.
pub fn decode(project: &str, key: &str) -> Option<i64> {
    if key.len() != KEY_LEN || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }

    let (expiry_hex, mac_hex) = key.split_at(EXPIRY_HEX_LEN);
    if mac_hex != checksum(project, expiry_hex) {
        return None;
    }

    let raw = u64::from_str_radix(expiry_hex, 16).ok()?;
    i64::try_from(raw).ok()
}

/// Issue a key for `project` expiring at `expiry_ms` (UTC milliseconds).
/// Used by provisioning tooling and tests.
pub fn encode(project: &str, expiry_ms: i64) -> String {
    let expiry_hex = format!("{:016x}", expiry_ms as u64);
    let mac_hex = checksum(project, &expiry_hex);
    format!("{expiry_hex}{mac_hex}")
}

fn checksum(project: &str, expiry_hex: &str) -> String {
    let digest = Sha256::digest(format!("{project}:{expiry_hex}").as_bytes());
    hex::encode(&digest[..EXPIRY_HEX_LEN / 2])
}

/// Gate decision for the periodic license check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseStatus {
    Valid(i64),
    Missing,
    Invalid,
    Expired,
}

/// Judge the configured key against `now_ms`. Anything but `Valid`
/// stops the service.
pub fn check(project: &str, key: Option<&str>, now_ms: i64) -> LicenseStatus {
    let Some(key) = key else {
        return LicenseStatus::Missing;
    };
    let Some(expiry) = decode(project, key) else {
        return LicenseStatus::Invalid;
    };
    if expiry < now_ms {
        LicenseStatus::Expired
    } else {
        LicenseStatus::Valid(expiry)
    }
}
