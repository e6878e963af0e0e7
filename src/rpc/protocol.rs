//! Wire protocol types.
//!
//! Messages are JSON-RPC shaped, one JSON document per newline-delimited
//! frame. Ids are strings unique within a connection's outbound stream;
//! `params` and `result` carry a JSON object *as a string*, matching the
//! companion-process dialect.

use serde::{Deserialize, Serialize};

// Method identifiers, bidirectional.
pub const DAEMON_ACTIVATE: &str = "daemon_activate";
pub const DAEMON_STOP_SERVICE: &str = "daemon_stop_service";
pub const DAEMON_PING_SERVICE: &str = "daemon_ping_service";
pub const DAEMON_PREPARE_SERVICE: &str = "daemon_prepare_service";
pub const DAEMON_SYNC_SERVICE: &str = "daemon_sync_service";
pub const DAEMON_GET_LOG_SERVICE: &str = "daemon_get_log_service";
pub const DAEMON_REFRESH_URL: &str = "daemon_refresh_url";
pub const DAEMON_SERVER_PING: &str = "daemon_server_ping";
/// Server→client statistics push.
pub const DAEMON_STATISTIC_SERVICE: &str = "daemon_statistic_service";

// Wire error codes. The numbering is ours to pick; keep it stable.
/// Bad arguments, missing params, or a verification-gate rejection.
pub const ERR_INVALID: i32 = -1;
/// License key failed to decode.
pub const ERR_LICENSE: i32 = -2;
/// An external HTTP fetch or upload failed.
pub const ERR_EXTERNAL: i32 = -3;

/// Client→server or server→client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<String>,
}

/// Response carrying exactly one of `result` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// One inbound frame: requests carry `method`, responses don't, so the
/// untagged deserializer tries `Request` first.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RpcMessage {
    Request(Request),
    Response(Response),
}

/// Parse one frame. The caller decides whether a parse failure is
/// tolerated or escalates to closing the connection.
pub fn parse_message(line: &str) -> Result<RpcMessage, serde_json::Error> {
    serde_json::from_str(line)
}

impl Request {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Option<String>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

impl Response {
    pub fn ok(id: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}
