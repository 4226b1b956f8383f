//! Supervisor for the sing-box subprocess: start/stop/restart lifecycle,
//! log capture, and version/pid/uptime bookkeeping.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use relay_node_error::NodeError;

use super::config::SingBoxConfig;

pub(crate) const CONFIG_FILE_NAME: &str = "sing-box.json";
const ASSETS_ENV_VAR: &str = "SING_BOX_LOCATION_ASSET";
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct CoreProcess {
    executable_path: PathBuf,
    assets_path: PathBuf,
    config_dir: PathBuf,
    version: String,
    log_tx: broadcast::Sender<String>,
    state: Arc<Mutex<CoreState>>,
}

#[derive(Debug, Default)]
struct CoreState {
    child: Option<Child>,
    /// Set by the reaper once the child's exit has been observed. The child
    /// handle stays in place until `stop` clears the bookkeeping.
    exited: bool,
    restarting: bool,
    run_scope: Option<CancellationToken>,
    started_at: Option<Instant>,
}

impl CoreProcess {
    /// Probes the executable for its version; failure to run the binary at
    /// all makes supervisor construction fail.
    pub async fn new(
        executable_path: PathBuf,
        assets_path: PathBuf,
        config_dir: PathBuf,
        log_buffer_size: usize,
    ) -> Result<Self, NodeError> {
        let version = probe_version(&executable_path).await?;
        let (log_tx, _) = broadcast::channel(log_buffer_size.max(1));

        Ok(Self {
            executable_path,
            assets_path,
            config_dir,
            version,
            log_tx,
            state: Arc::new(Mutex::new(CoreState::default())),
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Passive liveness: a child handle exists and its exit has not been
    /// reaped. There is no active health check.
    pub async fn started(&self) -> bool {
        let state = self.state.lock().await;
        state.child.is_some() && !state.exited
    }

    /// Subscribe to the bounded log-line stream. Slow subscribers lose the
    /// oldest lines rather than stalling capture.
    pub fn logs(&self) -> broadcast::Receiver<String> {
        self.log_tx.subscribe()
    }

    pub async fn pid(&self) -> u32 {
        let state = self.state.lock().await;
        state
            .child
            .as_ref()
            .and_then(Child::id)
            .unwrap_or_default()
    }

    pub async fn uptime(&self) -> Option<Duration> {
        let state = self.state.lock().await;
        state.started_at.map(|started_at| started_at.elapsed())
    }

    /// Serializes the config, writes it under the config directory, and
    /// launches the subprocess. Fails if a subprocess handle is already
    /// live; callers must `stop` first.
    pub async fn start(&self, config: &SingBoxConfig, _debug: bool) -> Result<(), NodeError> {
        let rendered = config.to_pretty_json()?;
        let config_path = self.write_config_file(&rendered).await?;

        let mut state = self.state.lock().await;
        if state.child.is_some() {
            return Err(NodeError::AlreadyRunning {
                core: "sing-box".to_string(),
            });
        }

        let mut child = Command::new(&self.executable_path)
            .arg("run")
            .arg("-c")
            .arg(&config_path)
            .env(ASSETS_ENV_VAR, &self.assets_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| NodeError::LaunchFailed {
                core: "sing-box".to_string(),
                message: err.to_string(),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| NodeError::LaunchFailed {
            core: "sing-box".to_string(),
            message: "failed to capture stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| NodeError::LaunchFailed {
            core: "sing-box".to_string(),
            message: "failed to capture stderr".to_string(),
        })?;

        let scope = CancellationToken::new();
        tokio::spawn(capture_lines(scope.clone(), stdout, self.log_tx.clone()));
        tokio::spawn(capture_lines(scope.clone(), stderr, self.log_tx.clone()));
        tokio::spawn(reap_exit(scope.clone(), self.state.clone()));

        state.child = Some(child);
        state.exited = false;
        state.run_scope = Some(scope);
        state.started_at = Some(Instant::now());

        Ok(())
    }

    /// Best-effort terminate: cancels the run scope, kills the child, and
    /// waits up to the stop timeout. Bookkeeping is cleared even when the
    /// OS process outlives the deadline; that case is logged as a warning.
    /// A no-op when no subprocess is tracked.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;

        if let Some(scope) = state.run_scope.take() {
            scope.cancel();
        }

        let Some(mut child) = state.child.take() else {
            return;
        };
        let pid = child.id();

        let _ = child.start_kill();
        if tokio::time::timeout(STOP_TIMEOUT, child.wait())
            .await
            .is_err()
        {
            tracing::warn!(pid, "sing-box process did not stop within timeout");
        }

        state.exited = false;
        state.started_at = None;
    }

    /// `stop` then `start`, serialized against other restarts: a second
    /// restart while one is in flight is rejected rather than queued.
    pub async fn restart(&self, config: &SingBoxConfig, debug: bool) -> Result<(), NodeError> {
        {
            let mut state = self.state.lock().await;
            if state.restarting {
                return Err(NodeError::AlreadyRestarting {
                    core: "sing-box".to_string(),
                });
            }
            state.restarting = true;
        }

        self.stop().await;
        let result = self.start(config, debug).await;

        self.state.lock().await.restarting = false;
        result
    }

    async fn write_config_file(&self, rendered: &str) -> Result<PathBuf, NodeError> {
        tokio::fs::create_dir_all(&self.config_dir).await?;
        let config_path = self.config_dir.join(CONFIG_FILE_NAME);
        tokio::fs::write(&config_path, rendered).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        Ok(config_path)
    }
}

async fn probe_version(executable: &Path) -> Result<String, NodeError> {
    let output = Command::new(executable)
        .arg("version")
        .output()
        .await
        .map_err(|err| NodeError::LaunchFailed {
            core: "sing-box".to_string(),
            message: format!("version probe failed: {err}"),
        })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(extract_version(&combined))
}

/// First dotted-triple numeric substring, falling back to the trimmed raw
/// output when none is present.
fn extract_version(output: &str) -> String {
    if let Ok(pattern) = regress::Regex::new(r"\d+\.\d+\.\d+") {
        if let Some(matched) = pattern.find(output) {
            return output[matched.range()].to_string();
        }
    }
    output.trim().to_string()
}

/// Reads one stream line-by-line until end-of-input or cancellation. Every
/// line goes to the operational log and into the bounded subscriber queue.
async fn capture_lines(
    scope: CancellationToken,
    reader: impl AsyncRead + Unpin,
    log_tx: broadcast::Sender<String>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = scope.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    tracing::info!(target: "singbox", "{line}");
                    let _ = log_tx.send(line);
                }
                Ok(None) | Err(_) => break,
            },
        }
    }
}

/// Observes the child's exit without blocking callers. Only flips the
/// `exited` flag; it never clears the handle or restarts anything.
async fn reap_exit(scope: CancellationToken, state: Arc<Mutex<CoreState>>) {
    loop {
        tokio::select! {
            _ = scope.cancelled() => break,
            _ = tokio::time::sleep(REAP_POLL_INTERVAL) => {}
        }

        let mut state = state.lock().await;
        let Some(child) = state.child.as_mut() else {
            break;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::warn!(code = status.code(), "sing-box process exited");
                state.exited = true;
                break;
            }
            Ok(None) => {}
            Err(_) => break,
        }
    }
}
