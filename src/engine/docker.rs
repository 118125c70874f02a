//! C3: the Docker handler. Differs from Podman only in mount syntax and
//! rootless defaults (§4.1) — everything else lives in `abstract_handler`.

use async_trait::async_trait;

use super::abstract_handler::AbstractHandler;
use super::command::TokioCommandRunner;
use super::traits::{
    ContainerLogEvent, ContainerStatus, DiscoveredContainer, EngineHandler, EngineResult, ExecResult,
    RunContainerOptions, RunContainerResult,
};

pub struct DockerHandler {
    inner: AbstractHandler<TokioCommandRunner>,
}

impl DockerHandler {
    pub fn new() -> Self {
        Self {
            inner: AbstractHandler {
                binary: "docker".to_string(),
                runner: TokioCommandRunner,
                mount_suffix: String::new(),
                extra_run_flags: Vec::new(),
            },
        }
    }
}

impl Default for DockerHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineHandler for DockerHandler {
    async fn initialize(&self) -> EngineResult<()> {
        self.inner.initialize().await
    }

    async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }

    async fn version(&self) -> EngineResult<String> {
        self.inner.version().await
    }

    async fn run_container(&self, opts: RunContainerOptions) -> EngineResult<RunContainerResult> {
        self.inner.run_container(opts).await
    }

    async fn stop_container(&self, workspace_id: u64) -> EngineResult<()> {
        self.inner.stop_container(workspace_id).await
    }

    async fn get_container_status(&self, workspace_id: u64) -> EngineResult<ContainerStatus> {
        self.inner.get_container_status(workspace_id).await
    }

    async fn container_exists(&self, workspace_id: u64) -> EngineResult<bool> {
        self.inner.container_exists(workspace_id).await
    }

    async fn is_container_running(&self, workspace_id: u64) -> EngineResult<bool> {
        self.inner.is_container_running(workspace_id).await
    }

    async fn is_container_ready(&self, workspace_id: u64, port: u16) -> EngineResult<bool> {
        self.inner.is_container_ready(workspace_id, port).await
    }

    async fn has_dependencies_installed(&self, workspace_id: u64) -> EngineResult<bool> {
        self.inner.has_dependencies_installed(workspace_id).await
    }

    async fn sync_files_to_container(&self, workspace_id: u64, file_paths: &[String]) -> EngineResult<()> {
        self.inner.sync_files_to_container(workspace_id, file_paths).await
    }

    async fn exec_in_container(&self, workspace_id: u64, argv: &[String]) -> EngineResult<ExecResult> {
        self.inner.exec_in_container(workspace_id, argv).await
    }

    async fn get_container_logs(&self, workspace_id: u64, lines: Option<u32>) -> EngineResult<String> {
        self.inner.get_container_logs(workspace_id, lines).await
    }

    async fn follow_container_logs(
        &self,
        workspace_id: u64,
        window: std::time::Duration,
        tx: tokio::sync::mpsc::UnboundedSender<ContainerLogEvent>,
    ) -> EngineResult<()> {
        self.inner.follow_container_logs(workspace_id, window, tx).await
    }

    async fn remove_container(&self, workspace_id: u64, force: bool) -> EngineResult<()> {
        self.inner.remove_container(workspace_id, force).await
    }

    async fn cleanup_volumes(&self, workspace_id: u64) -> EngineResult<()> {
        self.inner.cleanup_volumes(workspace_id).await
    }

    fn get_container_name(&self, workspace_id: u64) -> String {
        self.inner.container_name(workspace_id)
    }

    fn get_volume_name(&self, workspace_id: u64) -> String {
        self.inner.volume_name(workspace_id)
    }

    async fn list_managed_ports(&self, exclude: Option<u64>) -> EngineResult<Vec<(u64, u16)>> {
        self.inner.list_managed_ports(exclude).await
    }

    async fn discover_containers(&self) -> EngineResult<Vec<DiscoveredContainer>> {
        self.inner.discover_containers().await
    }

    async fn container_stats(&self, workspace_id: u64) -> EngineResult<(f64, u64)> {
        self.inner.container_stats(workspace_id).await
    }

    async fn get_engine_info(&self) -> EngineResult<String> {
        self.inner.get_engine_info().await
    }
}
