//! Host and process inspection via `/proc`. Leaf module; every sampler is a
//! plain synchronous read so callers decide how often to poll.

use serde::{Deserialize, Serialize};

use relay_node_error::NodeError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStats {
    pub mem_total_bytes: u64,
    pub mem_available_bytes: u64,
    pub load_avg_1m: f64,
    pub load_avg_5m: f64,
    pub load_avg_15m: f64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessMemory {
    pub rss_bytes: u64,
    pub vms_bytes: u64,
}

#[cfg(unix)]
pub fn sample_system_stats() -> Result<SystemStats, NodeError> {
    let meminfo = std::fs::read_to_string("/proc/meminfo")?;
    let mem_total_bytes = meminfo_field(&meminfo, "MemTotal:");
    let mem_available_bytes = meminfo_field(&meminfo, "MemAvailable:");

    let loadavg = std::fs::read_to_string("/proc/loadavg")?;
    let mut loads = loadavg
        .split_whitespace()
        .take(3)
        .map(|field| field.parse::<f64>().unwrap_or_default());

    let uptime = std::fs::read_to_string("/proc/uptime")?;
    let uptime_secs = uptime
        .split_whitespace()
        .next()
        .and_then(|field| field.parse::<f64>().ok())
        .unwrap_or_default() as u64;

    Ok(SystemStats {
        mem_total_bytes,
        mem_available_bytes,
        load_avg_1m: loads.next().unwrap_or_default(),
        load_avg_5m: loads.next().unwrap_or_default(),
        load_avg_15m: loads.next().unwrap_or_default(),
        uptime_secs,
    })
}

/// RSS and virtual size of one process, from `/proc/<pid>/statm`.
#[cfg(unix)]
pub fn process_memory(pid: u32) -> Result<ProcessMemory, NodeError> {
    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).map_err(|err| {
        NodeError::ProcessUnavailable {
            message: format!("cannot inspect pid {pid}: {err}"),
        }
    })?;

    let mut fields = statm
        .split_whitespace()
        .map(|field| field.parse::<u64>().unwrap_or_default());
    let size_pages = fields.next().unwrap_or_default();
    let resident_pages = fields.next().unwrap_or_default();

    let page_size = page_size_bytes();
    Ok(ProcessMemory {
        rss_bytes: resident_pages.saturating_mul(page_size),
        vms_bytes: size_pages.saturating_mul(page_size),
    })
}

#[cfg(not(unix))]
pub fn sample_system_stats() -> Result<SystemStats, NodeError> {
    Err(NodeError::ProcessUnavailable {
        message: "host stats are only available on unix".to_string(),
    })
}

#[cfg(not(unix))]
pub fn process_memory(_pid: u32) -> Result<ProcessMemory, NodeError> {
    Err(NodeError::ProcessUnavailable {
        message: "process stats are only available on unix".to_string(),
    })
}

#[cfg(unix)]
fn page_size_bytes() -> u64 {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size > 0 {
        page_size as u64
    } else {
        4096
    }
}

/// `/proc/meminfo` reports kB values: `MemTotal:  1634256 kB`.
#[cfg(unix)]
fn meminfo_field(meminfo: &str, key: &str) -> u64 {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|field| field.parse::<u64>().ok())
        .map(|kilobytes| kilobytes * 1024)
        .unwrap_or_default()
}
