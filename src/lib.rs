pub mod config;
pub mod daemon;
pub mod epg;
pub mod license;
pub mod logging;
pub mod rpc;
pub mod watcher;

/// Project identifier: the docker-convention host literal, the license
/// key namespace, and the `project` field of the full stats payload.
pub const PROJECT_NAME: &str = "epgd";

/// Crate version reported in the full stats payload.
pub const PROJECT_VERSION: &str = env!("CARGO_PKG_VERSION");
