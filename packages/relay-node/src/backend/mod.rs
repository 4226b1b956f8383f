//! Backend facade: one supervised proxy-core subprocess bound to its
//! configuration synchronizer, behind a uniform set of operations.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use relay_node_error::NodeError;

use crate::user::User;

pub mod singbox;

use singbox::SingBoxBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    SingBox,
}

impl FromStr for BackendType {
    type Err = NodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sing_box" | "sing-box" | "singbox" => Ok(Self::SingBox),
            other => Err(NodeError::InvalidBackendType {
                backend: other.to_string(),
            }),
        }
    }
}

/// Process-level resource usage of the supervised subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStats {
    pub rss_bytes: u64,
    pub vms_bytes: u64,
    pub uptime_secs: u64,
}

/// Closed tagged variant over the supported proxy cores. The controller owns
/// at most one of these at a time.
pub enum Backend {
    SingBox(SingBoxBackend),
}

impl Backend {
    pub fn version(&self) -> String {
        match self {
            Self::SingBox(backend) => backend.version().to_string(),
        }
    }

    pub async fn started(&self) -> bool {
        match self {
            Self::SingBox(backend) => backend.started().await,
        }
    }

    pub fn logs(&self) -> broadcast::Receiver<String> {
        match self {
            Self::SingBox(backend) => backend.logs(),
        }
    }

    pub async fn restart(&self) -> Result<(), NodeError> {
        match self {
            Self::SingBox(backend) => backend.restart().await,
        }
    }

    /// Idempotent teardown of the subprocess.
    pub async fn shutdown(&self) {
        match self {
            Self::SingBox(backend) => backend.shutdown().await,
        }
    }

    pub async fn sync_user(&self, user: &User) -> Result<(), NodeError> {
        match self {
            Self::SingBox(backend) => backend.sync_user(user).await,
        }
    }

    pub async fn sync_users(&self, users: &[User]) -> Result<(), NodeError> {
        match self {
            Self::SingBox(backend) => backend.sync_users(users).await,
        }
    }

    pub async fn sys_stats(&self) -> Result<BackendStats, NodeError> {
        match self {
            Self::SingBox(backend) => backend.sys_stats().await,
        }
    }

    /// Traffic counters; no current backend implements them. The distinct
    /// error lets callers tell "unsupported" apart from "no data".
    pub fn stats(&self) -> Result<(), NodeError> {
        match self {
            Self::SingBox(_) => Err(NodeError::Unimplemented {
                what: "traffic statistics",
            }),
        }
    }

    pub fn online_stats(&self) -> Result<(), NodeError> {
        match self {
            Self::SingBox(_) => Err(NodeError::Unimplemented {
                what: "online statistics",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_backend_types() {
        assert_eq!("sing_box".parse::<BackendType>().unwrap(), BackendType::SingBox);
        assert_eq!("sing-box".parse::<BackendType>().unwrap(), BackendType::SingBox);
    }

    #[test]
    fn unknown_backend_type_is_rejected() {
        let err = "wireguard".parse::<BackendType>().unwrap_err();
        assert_eq!(
            err.error_type(),
            relay_node_error::ErrorType::InvalidBackendType
        );
    }
}
