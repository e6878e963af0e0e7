//! Per-peer session state.
//!
//! A `PeerSession` owns the write half of an accepted connection plus
//! the verification state and the table of outbound requests awaiting a
//! response. Sessions live in the daemon's peer table and are only ever
//! touched from the daemon loop; dropping the session closes the socket.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::commands::ClientPingInfo;
use super::protocol::{self, Request, Response};

pub type PeerId = u64;

/// Outbound request awaiting its response, kept so an inbound response
/// can be matched back to the originating method.
#[derive(Debug)]
pub struct PendingRequest {
    pub method: String,
    pub created_at: Instant,
}

pub struct PeerSession {
    id: PeerId,
    addr: SocketAddr,
    writer: OwnedWriteHalf,
    verified: bool,
    license_expiry: i64,
    pending: HashMap<String, PendingRequest>,
    parse_strikes: u32,
    reader_task: Option<JoinHandle<()>>,
}

impl PeerSession {
    pub fn new(id: PeerId, addr: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self {
            id,
            addr,
            writer,
            verified: false,
            license_expiry: 0,
            pending: HashMap::new(),
            parse_strikes: 0,
            reader_task: None,
        }
    }

    /// Attach the task draining this connection's read half so it dies
    /// with the session.
    pub fn attach_reader(&mut self, task: JoinHandle<()>) {
        self.reader_task = Some(task);
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Promote to verified. There is no demotion path; expiration stops
    /// the whole service instead.
    pub fn set_verified(&mut self, expiry: i64) {
        self.verified = true;
        self.license_expiry = expiry;
    }

    pub fn license_expiry(&self) -> i64 {
        self.license_expiry
    }

    /// Queue a request and record it in the pending map.
    pub async fn write_request(&mut self, req: Request) -> io::Result<()> {
        self.pending.insert(
            req.id.clone(),
            PendingRequest {
                method: req.method.clone(),
                created_at: Instant::now(),
            },
        );
        self.write_json(&req).await
    }

    pub async fn write_response(&mut self, resp: Response) -> io::Result<()> {
        self.write_json(&resp).await
    }

    /// Server→client health ping. The peer is expected to answer before
    /// the next ping tick.
    pub async fn ping(&mut self) -> io::Result<()> {
        let payload = ClientPingInfo {
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let params = serde_json::to_string(&payload).map_err(invalid_data)?;
        let req = Request::new(
            Uuid::now_v7().to_string(),
            protocol::DAEMON_SERVER_PING,
            Some(params),
        );
        self.write_request(req).await
    }

    /// Success reply to an inbound ping, echoing the payload.
    pub async fn pong(&mut self, id: &str, ping: &ClientPingInfo) -> io::Result<()> {
        let result = serde_json::to_string(ping).map_err(invalid_data)?;
        self.write_response(Response::ok(id, result)).await
    }

    pub async fn activate_success(&mut self, id: &str, stats_blob: String) -> io::Result<()> {
        self.write_response(Response::ok(id, stats_blob)).await
    }

    pub async fn activate_fail(&mut self, id: &str, message: &str) -> io::Result<()> {
        self.write_response(Response::err(id, protocol::ERR_LICENSE, message))
            .await
    }

    pub async fn prepare_service_success(&mut self, id: &str, state_blob: String) -> io::Result<()> {
        self.write_response(Response::ok(id, state_blob)).await
    }

    pub async fn sync_service_success(&mut self, id: &str) -> io::Result<()> {
        self.write_response(Response::ok(id, "{}")).await
    }

    pub async fn get_log_service_success(&mut self, id: &str) -> io::Result<()> {
        self.write_response(Response::ok(id, "{}")).await
    }

    pub async fn get_log_service_fail(&mut self, id: &str, message: &str) -> io::Result<()> {
        self.write_response(Response::err(id, protocol::ERR_EXTERNAL, message))
            .await
    }

    pub async fn refresh_url_success(&mut self, id: &str) -> io::Result<()> {
        self.write_response(Response::ok(id, "{}")).await
    }

    pub async fn refresh_url_fail(&mut self, id: &str, message: &str) -> io::Result<()> {
        self.write_response(Response::err(id, protocol::ERR_EXTERNAL, message))
            .await
    }

    pub async fn stop_success(&mut self, id: &str) -> io::Result<()> {
        self.write_response(Response::ok(id, "{}")).await
    }

    /// Match an inbound response to its originating request.
    pub fn pop_request_by_id(&mut self, id: &str) -> Option<String> {
        self.pending.remove(id).map(|p| p.method)
    }

    /// True if a server ping is still waiting for its response.
    pub fn has_pending_ping(&self) -> bool {
        self.pending
            .values()
            .any(|p| p.method == protocol::DAEMON_SERVER_PING)
    }

    /// Drop pending entries older than `max_age`. Keeps the table
    /// bounded when a peer never answers broadcasts.
    pub fn evict_stale_pending(&mut self, max_age: Duration) {
        self.pending.retain(|_, p| p.created_at.elapsed() < max_age);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Record a malformed inbound frame; returns the strike count so the
    /// caller can escalate on recurrence.
    pub fn note_parse_error(&mut self) -> u32 {
        self.parse_strikes += 1;
        self.parse_strikes
    }

    pub fn clear_parse_errors(&mut self) {
        self.parse_strikes = 0;
    }

    async fn write_json<T: serde::Serialize>(&mut self, msg: &T) -> io::Result<()> {
        let mut line = serde_json::to_string(msg).map_err(invalid_data)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

fn invalid_data(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
