//! Node health sampling.
//!
//! `NodeStats` keeps the sysinfo handles plus the previous network
//! totals and timestamp, and turns a tick into a `ServerInfo` snapshot.
//! Owned by the daemon loop; never touched from another task.

use chrono::Utc;
use sysinfo::{Disks, Networks, System};

use crate::rpc::commands::{OnlineUsers, OsInfo, ServerInfo};

pub struct NodeStats {
    sys: System,
    networks: Networks,
    disks: Disks,
    prev_recv: u64,
    prev_send: u64,
    prev_timestamp_ms: i64,
}

impl NodeStats {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let networks = Networks::new_with_refreshed_list();
        let disks = Disks::new_with_refreshed_list();

        let (prev_recv, prev_send) = net_totals(&networks);
        Self {
            sys,
            networks,
            disks,
            prev_recv,
            prev_send,
            prev_timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Take a snapshot, computing bandwidth from the delta against the
    /// previous call.
    pub fn sample(&mut self, online_daemons: usize) -> ServerInfo {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        self.networks.refresh(true);
        self.disks.refresh(true);

        let (recv, send) = net_totals(&self.networks);
        let now_ms = Utc::now().timestamp_millis();
        let elapsed_secs = (now_ms - self.prev_timestamp_ms) / 1000;

        let bandwidth_in = per_second(recv.saturating_sub(self.prev_recv), elapsed_secs);
        let bandwidth_out = per_second(send.saturating_sub(self.prev_send), elapsed_secs);
        self.prev_recv = recv;
        self.prev_send = send;
        self.prev_timestamp_ms = now_ms;

        let (hdd_total, hdd_free) = disk_totals(&self.disks);
        let load = System::load_average();

        ServerInfo {
            cpu: f64::from(self.sys.global_cpu_usage()) / 100.0,
            uptime: format!("{:.2} {:.2} {:.2}", load.one, load.five, load.fifteen),
            memory_total: self.sys.total_memory(),
            memory_free: self.sys.available_memory(),
            hdd_total,
            hdd_free,
            bandwidth_in,
            bandwidth_out,
            uptime_seconds: System::uptime(),
            timestamp: now_ms,
            net_total_bytes_recv: recv,
            net_total_bytes_send: send,
            online_users: OnlineUsers {
                daemon: online_daemons,
            },
        }
    }

    /// Static machine description for the full stats payload. Call after
    /// `sample` so the memory numbers are fresh.
    pub fn os_snapshot(&self) -> OsInfo {
        OsInfo {
            name: System::name().unwrap_or_else(|| "unknown".to_string()),
            version: System::os_version().unwrap_or_else(|| "unknown".to_string()),
            arch: std::env::consts::ARCH.to_string(),
            ram_bytes_total: self.sys.total_memory(),
            ram_bytes_free: self.sys.available_memory(),
        }
    }
}

impl Default for NodeStats {
    fn default() -> Self {
        Self::new()
    }
}

fn net_totals(networks: &Networks) -> (u64, u64) {
    let mut recv = 0u64;
    let mut send = 0u64;
    for (_, data) in networks {
        recv += data.total_received();
        send += data.total_transmitted();
    }
    (recv, send)
}

fn disk_totals(disks: &Disks) -> (u64, u64) {
    let mut total = 0u64;
    let mut free = 0u64;
    for disk in disks {
        total += disk.total_space();
        free += disk.available_space();
    }
    (total, free)
}

/// Bytes per second with the elapsed floor of one second, so two samples
/// in the same second never divide by zero.
fn per_second(delta_bytes: u64, elapsed_secs: i64) -> u64 {
    delta_bytes / elapsed_secs.max(1) as u64
}
