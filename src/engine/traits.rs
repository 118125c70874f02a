//! C1: the operation set every concrete engine handler implements, and the
//! types that cross that boundary.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("container not ready: {0}")]
    NotReady(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("port conflict on {0}")]
    PortConflict(u16),

    #[error("command timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("canceled")]
    Canceled,

    #[error("engine command failed: {0}")]
    CommandFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed engine output: {0}")]
    MalformedOutput(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Input to `RunContainer` (§4.1).
#[derive(Debug, Clone)]
pub struct RunContainerOptions {
    pub workspace_id: u64,
    pub workspace_path: String,
    pub port: u16,
    pub image: String,
    pub install_command: Option<String>,
    pub start_command: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
    pub env_vars: Vec<(String, String)>,
    pub force_recreate: bool,
    pub skip_install: bool,
    /// Whether a conflicting container on `port` may be stopped to free it.
    pub auto_kill_port: bool,
}

/// Output of a successful `RunContainer` call.
#[derive(Debug, Clone)]
pub struct RunContainerResult {
    pub container_name: String,
    pub port: u16,
}

/// Output of `GetContainerStatus` (§4.1). `port` is read back from the
/// engine's live port mapping, which is authoritative over any in-memory map.
#[derive(Debug, Clone, Default)]
pub struct ContainerStatus {
    pub is_running: bool,
    pub is_ready: bool,
    pub has_dependencies_installed: bool,
    pub container_name: Option<String>,
    pub port: Option<u16>,
    pub status: String,
}

/// One entry of a boot-time container discovery scan (§4.4).
#[derive(Debug, Clone)]
pub struct DiscoveredContainer {
    pub workspace_id: u64,
    pub is_running: bool,
    pub port: Option<u16>,
}

/// Output of `ExecInContainer`.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// One increment of `FollowContainerLogs` (§4.6.3): either a line of
/// forwarded output, or the container's real exit code once it terminates
/// within the watch window.
#[derive(Debug, Clone)]
pub enum ContainerLogEvent {
    Output(String),
    Closed(i32),
}

/// The contract shared by every concrete engine handler (C3 Docker, C4
/// Podman). Handlers hold no cross-workspace state; all per-workspace
/// bookkeeping lives in the lifecycle manager (C7).
#[async_trait]
pub trait EngineHandler: Send + Sync {
    /// Probes for the engine binary; fails with `Unavailable` if not present.
    async fn initialize(&self) -> EngineResult<()>;

    /// Non-throwing probe (timeout <= 2s).
    async fn is_available(&self) -> bool;

    async fn version(&self) -> EngineResult<String>;

    async fn run_container(&self, opts: RunContainerOptions) -> EngineResult<RunContainerResult>;

    /// Idempotent; no-op if absent.
    async fn stop_container(&self, workspace_id: u64) -> EngineResult<()>;

    async fn get_container_status(&self, workspace_id: u64) -> EngineResult<ContainerStatus>;

    async fn container_exists(&self, workspace_id: u64) -> EngineResult<bool>;

    async fn is_container_running(&self, workspace_id: u64) -> EngineResult<bool>;

    /// True when logs contain a dev-server-ready marker or a TCP probe on the
    /// published port succeeds.
    async fn is_container_ready(&self, workspace_id: u64, port: u16) -> EngineResult<bool>;

    /// True when `/app/node_modules` exists inside the container.
    async fn has_dependencies_installed(&self, workspace_id: u64) -> EngineResult<bool>;

    /// With a bind-mount this is a no-op except for logging; kept for engines
    /// where copy-in is required.
    async fn sync_files_to_container(&self, workspace_id: u64, file_paths: &[String]) -> EngineResult<()>;

    async fn exec_in_container(&self, workspace_id: u64, argv: &[String]) -> EngineResult<ExecResult>;

    async fn get_container_logs(&self, workspace_id: u64, lines: Option<u32>) -> EngineResult<String>;

    /// Tails stdout/stderr live for up to `window`, forwarding each line as
    /// `ContainerLogEvent::Output` and, only if the container actually exits
    /// inside that window, a final `ContainerLogEvent::Closed` with its real
    /// exit code (§4.6.3's `docker:output`/`docker:closed`). Returns once the
    /// window elapses or the container closes, whichever is first; never
    /// blocks past `window`.
    async fn follow_container_logs(
        &self,
        workspace_id: u64,
        window: Duration,
        tx: mpsc::UnboundedSender<ContainerLogEvent>,
    ) -> EngineResult<()>;

    async fn remove_container(&self, workspace_id: u64, force: bool) -> EngineResult<()>;

    async fn cleanup_volumes(&self, workspace_id: u64) -> EngineResult<()>;

    fn get_container_name(&self, workspace_id: u64) -> String {
        format!("dyad-app-{}", workspace_id)
    }

    fn get_volume_name(&self, workspace_id: u64) -> String {
        format!("dyad-app-{}-data", workspace_id)
    }

    /// Lists currently known ports across all `dyad-app-*` containers,
    /// excluding `workspace_id`, keyed by workspace id. Used by the port
    /// pool's availability check (§4.4).
    async fn list_managed_ports(&self, exclude: Option<u64>) -> EngineResult<Vec<(u64, u16)>>;

    /// Lists every `dyad-app-*` container with its running state and
    /// published port, for lifecycle's boot-time `Discover` (§4.4).
    async fn discover_containers(&self) -> EngineResult<Vec<DiscoveredContainer>>;

    /// CPU percent and cumulative rx+tx bytes since container start, used by
    /// the reaper's activity heuristic (§4.4).
    async fn container_stats(&self, workspace_id: u64) -> EngineResult<(f64, u64)>;

    /// Free-form engine metadata.
    async fn get_engine_info(&self) -> EngineResult<String>;
}
