//! The daemon core: one task owns every piece of mutable state.
//!
//! `Daemon::run` multiplexes the listener, per-peer reader tasks, the
//! EPG directory watcher, and the three periodic timers over a single
//! `select!` loop. Peer sessions live in a table keyed by handle;
//! workers (URL refresh, log upload) deliver completions through the
//! event channel and the loop re-checks the peer still exists before
//! replying.

pub mod stats;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::epg::{fetch, splitter, FetchError, SplitSummary};
use crate::license;
use crate::rpc::commands::{
    ActivateInfo, ClientPingInfo, FullServiceInfo, GetLogInfo, PrepareInfo, RefreshUrlInfo,
    StateInfo, StopInfo, SyncInfo,
};
use crate::rpc::peer::{PeerId, PeerSession};
use crate::rpc::protocol::{self, parse_message, Request, Response, RpcMessage};
use crate::watcher::{self, DirectoryWatcher};
use crate::{PROJECT_NAME, PROJECT_VERSION};

/// Statistics broadcast period.
pub const NODE_STATS_SEND_SECONDS: u64 = 10;
/// Health ping period; a verified peer not answering within one period
/// is closed on the next tick.
pub const PING_CLIENTS_SECONDS: u64 = 60;
/// License check period.
pub const CHECK_LICENSE_SECONDS: u64 = 300;

/// Consecutive malformed frames tolerated before the peer is closed.
const PARSE_ERROR_STRIKES: u32 = 3;

/// Everything that reaches the loop from outside: peer traffic, watcher
/// notifications, and worker completions.
enum Event {
    PeerLine {
        peer: PeerId,
        line: String,
    },
    PeerClosed {
        peer: PeerId,
    },
    RefreshUrlDone {
        peer: PeerId,
        request_id: String,
        result: Result<SplitSummary, FetchError>,
    },
    LogUploadDone {
        peer: PeerId,
        request_id: String,
        result: Result<(), FetchError>,
    },
}

/// Handler outcome the loop acts on: `Invalid` produces an error
/// response and keeps the peer, `Fatal` closes it.
enum HandlerError {
    Invalid(&'static str),
    Fatal(std::io::Error),
}

pub struct Daemon {
    listener: TcpListener,
    events_rx: mpsc::UnboundedReceiver<Event>,
    watch_rx: mpsc::UnboundedReceiver<PathBuf>,
    watcher: DirectoryWatcher,
    core: Core,
}

struct Core {
    config: Config,
    peers: HashMap<PeerId, PeerSession>,
    next_peer_id: PeerId,
    node_stats: stats::NodeStats,
    events_tx: mpsc::UnboundedSender<Event>,
    stop: bool,
}

impl Daemon {
    /// Bind the listener, start the directory watch, and prepare the
    /// loop state. `run` does the rest.
    pub async fn bind(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.epg_in_directory).with_context(|| {
            format!(
                "Failed to create epg input directory {}",
                config.epg_in_directory.display()
            )
        })?;
        std::fs::create_dir_all(&config.epg_out_directory).with_context(|| {
            format!(
                "Failed to create epg output directory {}",
                config.epg_out_directory.display()
            )
        })?;

        let listener = TcpListener::bind(config.listen_addr())
            .await
            .with_context(|| format!("Failed to bind {}", config.listen_addr()))?;
        info!(addr = %listener.local_addr()?, "Daemon listening");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let watcher = watcher::watch(&config.epg_in_directory, watch_tx).with_context(|| {
            format!(
                "Failed to watch epg input directory {}",
                config.epg_in_directory.display()
            )
        })?;

        Ok(Self {
            listener,
            events_rx,
            watch_rx,
            watcher,
            core: Core {
                config,
                peers: HashMap::new(),
                next_peer_id: 0,
                node_stats: stats::NodeStats::new(),
                events_tx,
                stop: false,
            },
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Dispatch events until a stop command or license failure. Peers in
    /// flight finish their current handler, then the loop returns.
    pub async fn run(self) -> Result<()> {
        let Daemon {
            listener,
            mut events_rx,
            mut watch_rx,
            watcher: _watcher,
            mut core,
        } = self;

        let stats_period = Duration::from_secs(NODE_STATS_SEND_SECONDS);
        let ping_period = Duration::from_secs(PING_CLIENTS_SECONDS);
        let license_period = Duration::from_secs(CHECK_LICENSE_SECONDS);
        let mut stats_tick = interval_at(Instant::now() + stats_period, stats_period);
        let mut ping_tick = interval_at(Instant::now() + ping_period, ping_period);
        let mut license_tick = interval_at(Instant::now() + license_period, license_period);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => core.accept_peer(stream, addr),
                    Err(err) => error!(error = %err, "Failed to accept connection"),
                },
                Some(event) = events_rx.recv() => core.handle_event(event).await,
                Some(path) = watch_rx.recv() => core.handle_epg_file(&path),
                _ = stats_tick.tick() => core.broadcast_stats().await,
                _ = ping_tick.tick() => core.ping_peers().await,
                _ = license_tick.tick() => core.check_license(),
            }

            if core.stop {
                break;
            }
        }

        info!("Daemon stopped");
        Ok(())
    }
}

impl Core {
    fn accept_peer(&mut self, stream: TcpStream, addr: SocketAddr) {
        let id = self.next_peer_id;
        self.next_peer_id += 1;

        let (read, write) = stream.into_split();
        let mut session = PeerSession::new(id, addr, write);
        session.attach_reader(tokio::spawn(read_loop(id, read, self.events_tx.clone())));
        self.peers.insert(id, session);
        debug!(peer = id, addr = %addr, "Client connected");
    }

    fn close_peer(&mut self, id: PeerId) {
        if self.peers.remove(&id).is_some() {
            debug!(peer = id, "Client disconnected");
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::PeerLine { peer, line } => self.handle_line(peer, &line).await,
            Event::PeerClosed { peer } => self.close_peer(peer),
            Event::RefreshUrlDone {
                peer,
                request_id,
                result,
            } => self.finish_refresh_url(peer, &request_id, result).await,
            Event::LogUploadDone {
                peer,
                request_id,
                result,
            } => self.finish_log_upload(peer, &request_id, result).await,
        }
    }

    async fn handle_line(&mut self, peer_id: PeerId, line: &str) {
        let message = match parse_message(line) {
            Ok(message) => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.clear_parse_errors();
                }
                message
            }
            Err(err) => {
                warn!(peer = peer_id, error = %err, "Malformed frame");
                let strikes = match self.peers.get_mut(&peer_id) {
                    Some(peer) => peer.note_parse_error(),
                    None => return,
                };
                if strikes >= PARSE_ERROR_STRIKES {
                    warn!(peer = peer_id, "Parse errors recurring, closing peer");
                    self.close_peer(peer_id);
                }
                return;
            }
        };

        match message {
            RpcMessage::Request(req) => {
                debug!(peer = peer_id, method = %req.method, "Received daemon request");
                self.handle_request(peer_id, req).await;
            }
            RpcMessage::Response(resp) => {
                debug!(peer = peer_id, id = %resp.id, "Received daemon response");
                self.handle_response(peer_id, resp);
            }
        }
    }

    async fn handle_request(&mut self, peer_id: PeerId, req: Request) {
        let outcome = match req.method.as_str() {
            protocol::DAEMON_ACTIVATE => self.handle_activate(peer_id, &req).await,
            protocol::DAEMON_STOP_SERVICE => self.handle_stop_service(peer_id, &req).await,
            protocol::DAEMON_PING_SERVICE => self.handle_ping_service(peer_id, &req).await,
            protocol::DAEMON_PREPARE_SERVICE => self.handle_prepare_service(peer_id, &req).await,
            protocol::DAEMON_SYNC_SERVICE => self.handle_sync_service(peer_id, &req).await,
            protocol::DAEMON_GET_LOG_SERVICE => self.handle_get_log_service(peer_id, &req).await,
            protocol::DAEMON_REFRESH_URL => self.handle_refresh_url(peer_id, &req).await,
            _ => {
                warn!(method = %req.method, "Received unknown method");
                Ok(())
            }
        };

        match outcome {
            Ok(()) => {}
            Err(HandlerError::Invalid(reason)) => {
                warn!(peer = peer_id, method = %req.method, reason, "Request rejected");
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    let resp = Response::err(req.id.clone(), protocol::ERR_INVALID, reason);
                    if peer.write_response(resp).await.is_err() {
                        self.close_peer(peer_id);
                    }
                }
            }
            Err(HandlerError::Fatal(err)) => {
                warn!(peer = peer_id, error = %err, "Peer write failed");
                self.close_peer(peer_id);
            }
        }
    }

    /// Inbound responses only matter for the server's own ping; anything
    /// else is logged and dropped.
    fn handle_response(&mut self, peer_id: PeerId, resp: Response) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        if !peer.is_verified() {
            warn!(peer = peer_id, "Response from unverified peer dropped");
            return;
        }
        let Some(method) = peer.pop_request_by_id(&resp.id) else {
            debug!(peer = peer_id, id = %resp.id, "Response without pending request");
            return;
        };

        if method == protocol::DAEMON_SERVER_PING {
            let payload = resp.result.as_deref().unwrap_or_default();
            if serde_json::from_str::<ClientPingInfo>(payload).is_err() {
                warn!(peer = peer_id, "Invalid ping response payload");
            }
        } else {
            warn!(peer = peer_id, method = %method, "Response for unhandled command");
        }
    }

    async fn handle_activate(&mut self, peer_id: PeerId, req: &Request) -> Result<(), HandlerError> {
        let params = req
            .params
            .as_deref()
            .ok_or(HandlerError::Invalid("Invalid input"))?;
        let info: ActivateInfo = serde_json::from_str(params)
            .map_err(|_| HandlerError::Invalid("Invalid activate payload"))?;

        let Some(expiry) = license::decode(PROJECT_NAME, &info.license_key) else {
            if let Some(peer) = self.peers.get_mut(&peer_id) {
                peer.activate_fail(&req.id, "Invalid expire key")
                    .await
                    .map_err(HandlerError::Fatal)?;
            }
            return Ok(());
        };

        let stats_blob = self.make_service_stats(expiry);
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return Ok(());
        };
        peer.activate_success(&req.id, stats_blob)
            .await
            .map_err(HandlerError::Fatal)?;
        peer.set_verified(expiry);
        info!(peer = peer_id, expiry, "Peer activated");
        Ok(())
    }

    async fn handle_stop_service(
        &mut self,
        peer_id: PeerId,
        req: &Request,
    ) -> Result<(), HandlerError> {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return Ok(());
        };
        if !peer.is_verified() {
            let host = peer.addr();
            info!(host = %host, "Stop request from host");
            if !host.ip().is_loopback() {
                return Err(HandlerError::Invalid("Invalid input"));
            }
        }

        let params = req
            .params
            .as_deref()
            .ok_or(HandlerError::Invalid("Invalid input"))?;
        serde_json::from_str::<StopInfo>(params)
            .map_err(|_| HandlerError::Invalid("Invalid stop payload"))?;

        peer.stop_success(&req.id).await.map_err(HandlerError::Fatal)?;
        self.stop = true;
        Ok(())
    }

    async fn handle_ping_service(
        &mut self,
        peer_id: PeerId,
        req: &Request,
    ) -> Result<(), HandlerError> {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return Ok(());
        };
        if !peer.is_verified() {
            return Err(HandlerError::Invalid("Service not verified"));
        }

        let params = req
            .params
            .as_deref()
            .ok_or(HandlerError::Invalid("Invalid input"))?;
        let ping: ClientPingInfo = serde_json::from_str(params)
            .map_err(|_| HandlerError::Invalid("Invalid ping payload"))?;

        peer.pong(&req.id, &ping).await.map_err(HandlerError::Fatal)
    }

    async fn handle_prepare_service(
        &mut self,
        peer_id: PeerId,
        req: &Request,
    ) -> Result<(), HandlerError> {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return Ok(());
        };
        if !peer.is_verified() {
            return Err(HandlerError::Invalid("Service not verified"));
        }

        let params = req
            .params
            .as_deref()
            .ok_or(HandlerError::Invalid("Invalid input"))?;
        serde_json::from_str::<PrepareInfo>(params)
            .map_err(|_| HandlerError::Invalid("Invalid prepare payload"))?;

        let state = serde_json::to_string(&StateInfo::default()).unwrap_or_else(|_| "{}".into());
        peer.prepare_service_success(&req.id, state)
            .await
            .map_err(HandlerError::Fatal)
    }

    async fn handle_sync_service(
        &mut self,
        peer_id: PeerId,
        req: &Request,
    ) -> Result<(), HandlerError> {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return Ok(());
        };
        if !peer.is_verified() {
            return Err(HandlerError::Invalid("Service not verified"));
        }

        let params = req
            .params
            .as_deref()
            .ok_or(HandlerError::Invalid("Invalid input"))?;
        serde_json::from_str::<SyncInfo>(params)
            .map_err(|_| HandlerError::Invalid("Invalid sync payload"))?;

        peer.sync_service_success(&req.id)
            .await
            .map_err(HandlerError::Fatal)
    }

    async fn handle_get_log_service(
        &mut self,
        peer_id: PeerId,
        req: &Request,
    ) -> Result<(), HandlerError> {
        {
            let Some(peer) = self.peers.get(&peer_id) else {
                return Ok(());
            };
            if !peer.is_verified() {
                return Err(HandlerError::Invalid("Service not verified"));
            }
        }

        let params = req
            .params
            .as_deref()
            .ok_or(HandlerError::Invalid("Invalid input"))?;
        let info: GetLogInfo = serde_json::from_str(params)
            .map_err(|_| HandlerError::Invalid("Invalid get log payload"))?;

        if !info.path.starts_with("http://") && !info.path.starts_with("https://") {
            if let Some(peer) = self.peers.get_mut(&peer_id) {
                peer.get_log_service_fail(&req.id, "Not supported protocol")
                    .await
                    .map_err(HandlerError::Fatal)?;
            }
            return Ok(());
        }

        let tx = self.events_tx.clone();
        let log_path = self.config.log_path.clone();
        let request_id = req.id.clone();
        tokio::spawn(async move {
            let result = fetch::post_file(&log_path, &info.path).await;
            let _ = tx.send(Event::LogUploadDone {
                peer: peer_id,
                request_id,
                result,
            });
        });
        Ok(())
    }

    /// The fetch runs on a worker so network I/O never stalls the loop;
    /// the reply happens in `finish_refresh_url` once the completion
    /// event arrives.
    async fn handle_refresh_url(
        &mut self,
        peer_id: PeerId,
        req: &Request,
    ) -> Result<(), HandlerError> {
        let params = req
            .params
            .as_deref()
            .ok_or(HandlerError::Invalid("Invalid input"))?;
        let info: RefreshUrlInfo = serde_json::from_str(params)
            .map_err(|_| HandlerError::Invalid("Invalid refresh url payload"))?;

        let tx = self.events_tx.clone();
        let out_dir = self.config.epg_out_directory.clone();
        let request_id = req.id.clone();
        tokio::spawn(async move {
            let result = fetch::refresh_from_url(&info.url, &out_dir).await;
            let _ = tx.send(Event::RefreshUrlDone {
                peer: peer_id,
                request_id,
                result,
            });
        });
        Ok(())
    }

    async fn finish_refresh_url(
        &mut self,
        peer_id: PeerId,
        request_id: &str,
        result: Result<SplitSummary, FetchError>,
    ) {
        // The peer may have gone away while the worker ran.
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            debug!(peer = peer_id, "Refresh finished for a retired peer");
            return;
        };

        let write = match result {
            Ok(summary) => {
                info!(
                    channels = summary.channels,
                    programmes = summary.programmes,
                    "Epg url refresh finished"
                );
                peer.refresh_url_success(request_id).await
            }
            Err(err) => {
                warn!(error = %err, "Epg url refresh failed");
                peer.refresh_url_fail(request_id, &err.to_string()).await
            }
        };
        if write.is_err() {
            self.close_peer(peer_id);
        }
    }

    async fn finish_log_upload(
        &mut self,
        peer_id: PeerId,
        request_id: &str,
        result: Result<(), FetchError>,
    ) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            debug!(peer = peer_id, "Log upload finished for a retired peer");
            return;
        };

        let write = match result {
            Ok(()) => peer.get_log_service_success(request_id).await,
            Err(err) => {
                warn!(error = %err, "Log upload failed");
                peer.get_log_service_fail(request_id, &err.to_string()).await
            }
        };
        if write.is_err() {
            self.close_peer(peer_id);
        }
    }

    fn handle_epg_file(&mut self, path: &Path) {
        info!(path = %path.display(), "New epg file notification");
        match splitter::split_file(path, &self.config.epg_out_directory) {
            Ok(summary) => info!(
                channels = summary.channels,
                programmes = summary.programmes,
                "Epg file processing finished"
            ),
            Err(err) => warn!(path = %path.display(), error = %err, "Invalid epg file"),
        }
    }

    async fn broadcast_stats(&mut self) {
        let blob = self.make_service_stats(0);
        let req = Request::new(
            Uuid::now_v7().to_string(),
            protocol::DAEMON_STATISTIC_SERVICE,
            Some(blob),
        );

        let ids: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.is_verified())
            .map(|p| p.id())
            .collect();
        for id in ids {
            let Some(peer) = self.peers.get_mut(&id) else {
                continue;
            };
            if let Err(err) = peer.write_request(req.clone()).await {
                warn!(peer = id, error = %err, "Broadcast write failed");
            }
        }
    }

    async fn ping_peers(&mut self) {
        let ids: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.is_verified())
            .map(|p| p.id())
            .collect();
        let connected = ids.len();

        for id in ids {
            let Some(peer) = self.peers.get_mut(&id) else {
                continue;
            };
            if peer.has_pending_ping() {
                info!(peer = id, "Ping unanswered since last tick, closing peer");
                self.close_peer(id);
                continue;
            }
            match peer.ping().await {
                Ok(()) => info!(peer = id, connected, "Sent ping to client"),
                Err(err) => {
                    warn!(peer = id, error = %err, "Ping write failed");
                    self.close_peer(id);
                }
            }
        }

        let max_age = Duration::from_secs(2 * PING_CLIENTS_SECONDS);
        for peer in self.peers.values_mut() {
            peer.evict_stale_pending(max_age);
        }
    }

    fn check_license(&mut self) {
        let key = self.config.license_key.as_deref();
        match license::check(PROJECT_NAME, key, Utc::now().timestamp_millis()) {
            license::LicenseStatus::Valid(_) => {}
            license::LicenseStatus::Missing | license::LicenseStatus::Invalid => {
                warn!("You have an invalid license, service stopped");
                self.stop = true;
            }
            license::LicenseStatus::Expired => {
                warn!("Your license have expired, service stopped");
                self.stop = true;
            }
        }
    }

    /// Serialized stats blob: the plain snapshot for broadcasts, the
    /// full payload (identity + os + expiration) when `expiration_ms`
    /// is non-zero (Activate).
    fn make_service_stats(&mut self, expiration_ms: i64) -> String {
        let online = self.peers.values().filter(|p| p.is_verified()).count();
        let stats = self.node_stats.sample(online);

        let blob = if expiration_ms != 0 {
            serde_json::to_string(&FullServiceInfo {
                expiration_time: expiration_ms,
                project: PROJECT_NAME.to_string(),
                version: PROJECT_VERSION.to_string(),
                os: self.node_stats.os_snapshot(),
                stats,
            })
        } else {
            serde_json::to_string(&stats)
        };

        match blob {
            Ok(blob) => blob,
            Err(err) => {
                warn!(error = %err, "Failed to generate node statistic");
                "{}".to_string()
            }
        }
    }
}

/// Drain one connection's read half into loop events. Lives as long as
/// the session; aborted when the session is dropped.
async fn read_loop(peer: PeerId, read: OwnedReadHalf, tx: mpsc::UnboundedSender<Event>) {
    let mut reader = BufReader::new(read);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let event = Event::PeerLine {
                    peer,
                    line: trimmed.to_string(),
                };
                if tx.send(event).is_err() {
                    return;
                }
            }
            Err(err) => {
                debug!(peer, error = %err, "Read error");
                break;
            }
        }
    }
    let _ = tx.send(Event::PeerClosed { peer });
}
