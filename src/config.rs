//! Flat-file configuration for the daemon.
//!
//! The config is line-oriented `key=value`. Unknown keys are ignored so
//! deployments can share one file across service generations. The only
//! required key is `license_key`; everything else has a default.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::PROJECT_NAME;

/// Default TCP port the daemon listens on.
pub const DEFAULT_CLIENT_PORT: u16 = 4317;

const DEFAULT_LOG_PATH: &str = "/dev/null";
const DEFAULT_EPG_IN_DIR: &str = "/var/lib/epgd/epg/in";
const DEFAULT_EPG_OUT_DIR: &str = "/var/lib/epgd/epg/out";

const LOG_PATH_FIELD: &str = "log_path";
const LOG_LEVEL_FIELD: &str = "log_level";
const HOST_FIELD: &str = "host";
const EPG_IN_DIR_FIELD: &str = "epg_in_directory";
const EPG_OUT_DIR_FIELD: &str = "epg_out_directory";
const LICENSE_KEY_FIELD: &str = "license_key";

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen host literal. May be a hostname; if it equals the project
    /// name (docker convention) clients connect back via loopback.
    pub host: String,
    pub port: u16,
    pub log_path: PathBuf,
    pub log_level: String,
    pub epg_in_directory: PathBuf,
    pub epg_out_directory: PathBuf,
    pub license_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_CLIENT_PORT,
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            log_level: "INFO".to_string(),
            epg_in_directory: PathBuf::from(DEFAULT_EPG_IN_DIR),
            epg_out_directory: PathBuf::from(DEFAULT_EPG_OUT_DIR),
            license_key: None,
        }
    }
}

impl Config {
    /// Address the daemon binds. The host literal passes through
    /// untouched so hostname resolution happens at bind time.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Address a client (the stop CLI) connects to. A host literal equal
    /// to the project name is the docker image's own name and is only
    /// reachable from inside, so substitute loopback.
    pub fn connect_addr(&self) -> String {
        if self.host == PROJECT_NAME {
            format!("127.0.0.1:{}", self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Load a config file, applying defaults for absent keys.
///
/// A missing `license_key` is a fatal error: the daemon would stop on
/// its first license tick anyway, better to refuse at startup.
pub fn load(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let config = parse(&content)?;
    if config.license_key.is_none() {
        bail!("{} field in config required", LICENSE_KEY_FIELD);
    }
    Ok(config)
}

fn parse(content: &str) -> Result<Config> {
    let mut config = Config::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some(kv) => kv,
            None => continue,
        };

        match key {
            LOG_PATH_FIELD => config.log_path = PathBuf::from(value),
            LOG_LEVEL_FIELD => config.log_level = value.to_string(),
            HOST_FIELD => {
                if let Some((host, port)) = parse_host_port(value) {
                    config.host = host;
                    config.port = port;
                }
            }
            EPG_IN_DIR_FIELD => config.epg_in_directory = PathBuf::from(value),
            EPG_OUT_DIR_FIELD => config.epg_out_directory = PathBuf::from(value),
            LICENSE_KEY_FIELD => {
                if !value.is_empty() {
                    config.license_key = Some(value.to_string());
                }
            }
            _ => {}
        }
    }

    Ok(config)
}

fn parse_host_port(value: &str) -> Option<(String, u16)> {
    let (host, port) = value.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some((host.to_string(), port))
}
