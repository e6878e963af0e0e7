//! RPC client for connecting to the daemon.
//!
//! Used by the stop CLI and by integration tests. Holds one connection;
//! `call` correlates the response by id and skips server-initiated
//! traffic (pings, statistic broadcasts) arriving in between.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::protocol::{parse_message, Request, Response, RpcError, RpcMessage};

pub struct RpcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

/// Error returned by RPC client operations.
#[derive(Debug)]
pub enum ClientError {
    /// Failed to connect to daemon
    Connect(std::io::Error),
    /// Failed to send/receive data
    Io(std::io::Error),
    /// Failed to serialize request
    Serialize(serde_json::Error),
    /// Failed to parse response
    Parse(serde_json::Error),
    /// Daemon closed the connection before responding
    Closed,
    /// Daemon returned an error
    Rpc(RpcError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Connect(e) => write!(f, "Failed to connect to daemon: {}", e),
            ClientError::Io(e) => write!(f, "Communication error: {}", e),
            ClientError::Serialize(e) => write!(f, "Failed to serialize request: {}", e),
            ClientError::Parse(e) => write!(f, "Failed to parse response: {}", e),
            ClientError::Closed => write!(f, "Connection closed by daemon"),
            ClientError::Rpc(e) => write!(f, "RPC error {}: {}", e.code, e.message),
        }
    }
}

impl std::error::Error for ClientError {}

impl RpcClient {
    /// Connect to the daemon at `addr` (`host:port`).
    pub async fn connect(addr: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(ClientError::Connect)?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer,
            next_id: 0,
        })
    }

    /// Send a request without waiting for a response. The stop CLI uses
    /// this: a successful send is a successful stop.
    pub async fn send(&mut self, method: &str, params: Option<String>) -> Result<(), ClientError> {
        let id = self.fresh_id();
        self.write_request(Request::new(id, method, params)).await
    }

    /// Call a method and wait for its response, returning the raw result
    /// blob. Server-initiated requests arriving first are skipped.
    pub async fn call(
        &mut self,
        method: &str,
        params: Option<String>,
    ) -> Result<String, ClientError> {
        let id = self.fresh_id();
        self.write_request(Request::new(id.clone(), method, params))
            .await?;

        loop {
            let resp = self.read_response().await?;
            if resp.id != id {
                continue;
            }
            if let Some(err) = resp.error {
                return Err(ClientError::Rpc(err));
            }
            return Ok(resp.result.unwrap_or_default());
        }
    }

    /// Read frames until the next response, ignoring requests.
    pub async fn read_response(&mut self) -> Result<Response, ClientError> {
        loop {
            if let RpcMessage::Response(resp) = self.read_message().await? {
                return Ok(resp);
            }
        }
    }

    /// Read the next frame, request or response.
    pub async fn read_message(&mut self) -> Result<RpcMessage, ClientError> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(ClientError::Io)?;
            if n == 0 {
                return Err(ClientError::Closed);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return parse_message(trimmed).map_err(ClientError::Parse);
        }
    }

    /// Answer a server-initiated request (e.g. the health ping) with a
    /// success response.
    pub async fn respond_ok(&mut self, id: &str, result: &str) -> Result<(), ClientError> {
        let mut json = serde_json::to_string(&Response::ok(id, result))
            .map_err(ClientError::Serialize)?;
        json.push('\n');
        self.writer
            .write_all(json.as_bytes())
            .await
            .map_err(ClientError::Io)
    }

    fn fresh_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    async fn write_request(&mut self, req: Request) -> Result<(), ClientError> {
        let mut json = serde_json::to_string(&req).map_err(ClientError::Serialize)?;
        json.push('\n');
        self.writer
            .write_all(json.as_bytes())
            .await
            .map_err(ClientError::Io)
    }
}
