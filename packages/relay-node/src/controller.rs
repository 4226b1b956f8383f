//! Session ownership and bookkeeping: exactly one remote client owns the
//! node's backend at a time. The controller arbitrates takeover, tracks
//! keepalive expiry, and samples host stats in the background.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use relay_node_error::NodeError;

use crate::backend::singbox::{SingBoxBackend, SingBoxConfig};
use crate::backend::{Backend, BackendType};
use crate::config::NodeConfig;
use crate::host::{self, SystemStats};
use crate::tools;
use crate::user::User;

pub const NODE_VERSION: &str = env!("CARGO_PKG_VERSION");

const KEEPALIVE_POLL_INTERVAL: Duration = Duration::from_secs(5);
const STATS_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseInfo {
    pub started: bool,
    pub core_version: String,
    pub node_version: String,
}

pub struct Controller {
    cfg: NodeConfig,
    inner: RwLock<ControllerInner>,
}

struct ControllerInner {
    backend: Option<Arc<Backend>>,
    api_port: u16,
    client_id: String,
    last_request: Instant,
    stats: Option<SystemStats>,
    session_scope: CancellationToken,
}

impl Controller {
    pub fn new(cfg: NodeConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            inner: RwLock::new(ControllerInner {
                backend: None,
                api_port: tools::find_free_port(),
                client_id: String::new(),
                last_request: Instant::now(),
                stats: None,
                session_scope: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.cfg
    }

    /// Records the new owner and spawns the session's background tasks under
    /// a fresh cancellation scope. `keep_alive_secs == 0` disables the
    /// watchdog; the session then stays open until stopped or replaced.
    pub fn connect(self: &Arc<Self>, client_id: String, keep_alive_secs: u64) {
        let scope = CancellationToken::new();
        {
            let mut inner = self.write();
            inner.session_scope.cancel();
            inner.session_scope = scope.clone();
            inner.client_id = client_id;
            inner.last_request = Instant::now();
        }

        let controller = Arc::clone(self);
        let stats_scope = scope.clone();
        tokio::spawn(async move { controller.record_system_stats(stats_scope).await });

        if keep_alive_secs > 0 {
            let controller = Arc::clone(self);
            let keep_alive = Duration::from_secs(keep_alive_secs);
            tokio::spawn(async move { controller.keepalive_watchdog(scope, keep_alive).await });
        }
    }

    /// Cancels the session scope, then shuts the backend down outside of the
    /// controller lock: teardown can take seconds and status reads must stay
    /// responsive meanwhile. Always succeeds; safe to call repeatedly.
    pub async fn disconnect(&self) {
        let backend = {
            let mut inner = self.write();
            inner.session_scope.cancel();
            inner.backend.take()
        };

        if let Some(backend) = backend {
            backend.shutdown().await;
        }

        let mut inner = self.write();
        inner.client_id.clear();
        inner.api_port = tools::find_free_port();
    }

    pub async fn start_backend(
        &self,
        kind: BackendType,
        config: SingBoxConfig,
        users: &[User],
    ) -> Result<(), NodeError> {
        match kind {
            BackendType::SingBox => {
                let backend = SingBoxBackend::start(&self.cfg, config, users).await?;
                self.write().backend = Some(Arc::new(Backend::SingBox(backend)));
            }
        }
        Ok(())
    }

    /// Heartbeat; the transport layer calls this on every request aimed at
    /// the active session.
    pub fn new_request(&self) {
        self.write().last_request = Instant::now();
    }

    pub fn backend(&self) -> Option<Arc<Backend>> {
        self.read().backend.clone()
    }

    pub fn client_id(&self) -> String {
        self.read().client_id.clone()
    }

    pub fn api_port(&self) -> u16 {
        self.read().api_port
    }

    pub fn system_stats(&self) -> Option<SystemStats> {
        self.read().stats.clone()
    }

    pub async fn base_info(&self) -> BaseInfo {
        let backend = self.backend();
        let mut info = BaseInfo {
            started: false,
            core_version: String::new(),
            node_version: NODE_VERSION.to_string(),
        };
        if let Some(backend) = backend {
            info.started = backend.started().await;
            info.core_version = backend.version();
        }
        info
    }

    async fn keepalive_watchdog(
        self: Arc<Self>,
        scope: CancellationToken,
        keep_alive: Duration,
    ) {
        let mut ticker = tokio::time::interval(KEEPALIVE_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = scope.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let last_request = self.read().last_request;
            if last_request.elapsed() >= keep_alive {
                tracing::info!("disconnecting automatically after keepalive timeout");
                self.disconnect().await;
                return;
            }
        }
    }

    async fn record_system_stats(self: Arc<Self>, scope: CancellationToken) {
        let mut ticker = tokio::time::interval(STATS_SAMPLE_INTERVAL);
        loop {
            tokio::select! {
                _ = scope.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match host::sample_system_stats() {
                Ok(stats) => self.write().stats = Some(stats),
                Err(err) => tracing::warn!(error = %err, "failed to sample system stats"),
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ControllerInner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, ControllerInner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn test_controller() -> Arc<Controller> {
        Controller::new(NodeConfig::for_tests(
            Path::new("/nonexistent/sing-box"),
            Path::new("/tmp"),
        ))
    }

    #[tokio::test]
    async fn base_info_reports_not_started_without_backend() {
        let controller = test_controller();
        let info = controller.base_info().await;
        assert!(!info.started);
        assert_eq!(info.node_version, NODE_VERSION);
        assert!(info.core_version.is_empty());
    }

    #[tokio::test]
    async fn disconnect_without_session_is_a_noop() {
        let controller = test_controller();
        controller.disconnect().await;
        controller.disconnect().await;
        assert!(controller.backend().is_none());
    }

    #[tokio::test]
    async fn connect_records_client_and_disconnect_clears_it() {
        let controller = test_controller();
        controller.connect("10.0.0.9".to_string(), 0);
        assert_eq!(controller.client_id(), "10.0.0.9");

        let port_before = controller.api_port();
        controller.disconnect().await;
        assert!(controller.client_id().is_empty());
        assert_ne!(controller.api_port(), 0);
        let _ = port_before;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn stats_sampler_populates_snapshot() {
        let controller = test_controller();
        controller.connect("10.0.0.9".to_string(), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(controller.system_stats().is_some());
        controller.disconnect().await;
    }

    #[tokio::test]
    async fn keepalive_watchdog_disconnects_idle_session() {
        let controller = test_controller();
        controller.connect("10.0.0.9".to_string(), 1);
        // First expiry check happens on the 5s watchdog tick.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(controller.client_id().is_empty());
    }
}
