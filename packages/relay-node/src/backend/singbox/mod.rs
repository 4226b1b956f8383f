//! sing-box backend: binds one [`CoreProcess`] supervisor to one
//! [`SingBoxConfig`] synchronizer. Construction implies launch; every user
//! change is realized by a full restart of the subprocess.

use std::path::Path;
use std::path::PathBuf;

use tokio::sync::broadcast;

use relay_node_error::NodeError;

use crate::config::NodeConfig;
use crate::host;
use crate::user::User;

use super::BackendStats;

mod config;
mod core;

pub use config::{Account, Inbound, SingBoxConfig};
pub use core::CoreProcess;

pub struct SingBoxBackend {
    config: SingBoxConfig,
    core: CoreProcess,
    debug: bool,
}

impl SingBoxBackend {
    /// Builds the supervisor, seeds the config with the initial user list,
    /// and launches the subprocess. Any failure leaves nothing behind.
    pub async fn start(
        node: &NodeConfig,
        config: SingBoxConfig,
        users: &[User],
    ) -> Result<Self, NodeError> {
        config.sync_users(users);

        let core = CoreProcess::new(
            absolute(&node.singbox_executable_path)?,
            absolute(&node.singbox_assets_path)?,
            absolute(&node.generated_config_dir)?,
            node.log_buffer_size,
        )
        .await?;
        core.start(&config, node.debug).await?;

        let backend = Self {
            config,
            core,
            debug: node.debug,
        };
        tracing::info!(version = backend.core.version(), "sing-box backend started");
        Ok(backend)
    }

    pub fn version(&self) -> &str {
        self.core.version()
    }

    pub async fn started(&self) -> bool {
        self.core.started().await
    }

    pub fn logs(&self) -> broadcast::Receiver<String> {
        self.core.logs()
    }

    pub async fn restart(&self) -> Result<(), NodeError> {
        self.core.restart(&self.config, self.debug).await
    }

    pub async fn shutdown(&self) {
        self.core.stop().await;
    }

    pub async fn sync_user(&self, user: &User) -> Result<(), NodeError> {
        self.config.upsert_user(user);
        self.core.restart(&self.config, self.debug).await
    }

    pub async fn sync_users(&self, users: &[User]) -> Result<(), NodeError> {
        self.config.sync_users(users);
        self.core.restart(&self.config, self.debug).await
    }

    pub async fn sys_stats(&self) -> Result<BackendStats, NodeError> {
        let pid = self.core.pid().await;
        if pid == 0 {
            return Err(NodeError::ProcessUnavailable {
                message: "sing-box process is not available".to_string(),
            });
        }

        let memory = host::process_memory(pid)?;
        let uptime = self.core.uptime().await.unwrap_or_default();

        Ok(BackendStats {
            rss_bytes: memory.rss_bytes,
            vms_bytes: memory.vms_bytes,
            uptime_secs: uptime.as_secs(),
        })
    }
}

fn absolute(path: &Path) -> Result<PathBuf, NodeError> {
    Ok(std::path::absolute(path)?)
}
