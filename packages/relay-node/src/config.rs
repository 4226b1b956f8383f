//! Environment-derived runtime configuration. Everything has a default so a
//! bare container boots; the paths still have to point at a real proxy-core
//! install for a session to start.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub service_port: u16,
    pub node_host: Ipv4Addr,
    pub singbox_executable_path: PathBuf,
    pub singbox_assets_path: PathBuf,
    pub generated_config_dir: PathBuf,
    pub log_buffer_size: usize,
    pub api_key: Option<Uuid>,
    pub debug: bool,
}

impl NodeConfig {
    pub fn from_env() -> Self {
        Self {
            service_port: env_parse("SERVICE_PORT", 62050),
            node_host: node_host_from_env(),
            singbox_executable_path: env_path("SINGBOX_EXECUTABLE_PATH", "/usr/local/bin/sing-box"),
            singbox_assets_path: env_path("SINGBOX_ASSETS_PATH", "/usr/local/share/sing-box"),
            generated_config_dir: env_path("GENERATED_CONFIG_PATH", "/var/lib/relay-node/generated"),
            log_buffer_size: env_parse("LOG_BUFFER_SIZE", 1000),
            api_key: api_key_from_env(),
            debug: env_parse("DEBUG", false),
        }
    }

    /// Config pointed at a scratch directory and a caller-supplied core
    /// binary; used by the test suites.
    pub fn for_tests(executable: &Path, scratch_dir: &Path) -> Self {
        Self {
            service_port: 0,
            node_host: Ipv4Addr::LOCALHOST,
            singbox_executable_path: executable.to_path_buf(),
            singbox_assets_path: scratch_dir.to_path_buf(),
            generated_config_dir: scratch_dir.join("generated"),
            log_buffer_size: 64,
            api_key: None,
            debug: false,
        }
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

fn env_path(key: &str, fallback: &str) -> PathBuf {
    PathBuf::from(env_or(key, fallback))
}

fn env_parse<T: FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(fallback)
}

fn node_host_from_env() -> Ipv4Addr {
    let raw = env_or("NODE_HOST", "0.0.0.0");
    match raw.parse() {
        Ok(host) => host,
        Err(_) => {
            tracing::warn!(host = %raw, "NODE_HOST is not a valid IPv4 address, binding 127.0.0.1");
            Ipv4Addr::LOCALHOST
        }
    }
}

fn api_key_from_env() -> Option<Uuid> {
    let raw = std::env::var("API_KEY").ok()?;
    match Uuid::parse_str(raw.trim()) {
        Ok(key) => Some(key),
        Err(err) => {
            tracing::warn!(error = %err, "failed to parse API_KEY, requests will not be authenticated");
            None
        }
    }
}
