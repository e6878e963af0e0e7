//! Typed payloads carried inside `params`/`result` strings.
//!
//! Each method has its own little struct with explicit serde derives;
//! decoding is `serde_json::from_str` at the call site and encoding is
//! `serde_json::to_string`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateInfo {
    pub license_key: String,
}

/// Ping payload, passed through without interpretation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientPingInfo {
    pub timestamp: i64,
}

/// Stop accepts an empty object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopInfo {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrepareInfo {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncInfo {}

/// Prepare replies with this (currently empty) service state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateInfo {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLogInfo {
    /// http(s) URL the local log file is POSTed to.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshUrlInfo {
    pub url: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OnlineUsers {
    pub daemon: usize,
}

/// Node health snapshot broadcast to verified peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    /// CPU load fraction in `[0, 1]`.
    pub cpu: f64,
    /// Load averages, space-joined (`"l1 l5 l15"`).
    pub uptime: String,
    pub memory_total: u64,
    pub memory_free: u64,
    pub hdd_total: u64,
    pub hdd_free: u64,
    /// Bytes per second since the previous sample.
    pub bandwidth_in: u64,
    pub bandwidth_out: u64,
    pub uptime_seconds: u64,
    /// UTC milliseconds at sample time.
    pub timestamp: i64,
    pub net_total_bytes_recv: u64,
    pub net_total_bytes_send: u64,
    pub online_users: OnlineUsers,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsInfo {
    pub name: String,
    pub version: String,
    pub arch: String,
    pub ram_bytes_total: u64,
    pub ram_bytes_free: u64,
}

/// `ServerInfo` extended with identity and expiry, returned by Activate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullServiceInfo {
    pub expiration_time: i64,
    pub project: String,
    pub version: String,
    pub os: OsInfo,
    #[serde(flatten)]
    pub stats: ServerInfo,
}
