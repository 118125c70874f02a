//! The facade itself (§4.3): one method per handler operation, gated on
//! `enabled`, wrapping engine exceptions into a uniform result, and the sole
//! touchpoint that feeds `Lifecycle.RecordActivity`.

use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::ContainerizationConfig;
use crate::cron::Scheduler;
use crate::engine::{EngineFactory, EngineHandler, EngineResult, ExecResult, RunContainerOptions, RunContainerResult};
use crate::lifecycle::{is_container_actively_used, Lifecycle};

/// Uniform envelope every facade operation returns; handler exceptions are
/// caught here rather than propagated, per §4.3.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationResult {
    fn ok(message: impl Into<String>, data: Option<Value>) -> Self {
        Self { success: true, message: message.into(), data, error: None }
    }

    fn disabled() -> Self {
        Self {
            success: false,
            message: "containerization disabled".into(),
            data: None,
            error: None,
        }
    }

    fn failed(e: EngineResult<impl Into<Value>>) -> Self {
        match e {
            Ok(v) => Self::ok("ok", Some(v.into())),
            Err(err) => {
                warn!(error = %err, "engine operation failed");
                Self {
                    success: false,
                    message: "engine operation failed".into(),
                    data: None,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceStatus {
    pub enabled: bool,
    pub engine: &'static str,
    pub engine_available: bool,
}

pub struct ContainerizationService {
    config: ContainerizationConfig,
    factory: EngineFactory,
    lifecycle: Arc<Lifecycle>,
}

impl ContainerizationService {
    pub fn new(config: ContainerizationConfig, lifecycle: Arc<Lifecycle>) -> Self {
        let factory = EngineFactory::new(&config);
        Self { config, factory, lifecycle }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn config(&self) -> &ContainerizationConfig {
        &self.config
    }

    async fn handler(&self) -> Arc<dyn EngineHandler> {
        self.factory.current_handler().await
    }

    pub async fn get_service_status(&self) -> ServiceStatus {
        let engine_available = if self.config.enabled {
            self.handler().await.is_available().await
        } else {
            false
        };
        ServiceStatus {
            enabled: self.config.enabled,
            engine: self.config.engine.as_str(),
            engine_available,
        }
    }

    /// Runs (or confirms) the container for `workspace_id`. Defaults missing
    /// image/limits from config.
    pub async fn run_container(
        &self,
        workspace_id: u64,
        workspace_path: &str,
        port: u16,
        force_recreate: bool,
        skip_install: bool,
    ) -> OperationResult {
        if !self.is_enabled() {
            return OperationResult::disabled();
        }

        let handler = self.handler().await;
        let opts = RunContainerOptions {
            workspace_id,
            workspace_path: workspace_path.to_string(),
            port,
            image: self.config.active_image().to_string(),
            install_command: None,
            start_command: None,
            cpu_limit: self.config.limits.cpu_limit.clone(),
            memory_limit: self.config.limits.memory_limit.clone(),
            env_vars: Vec::new(),
            force_recreate,
            skip_install,
            auto_kill_port: self.config.auto_kill_port,
        };

        let result = handler.run_container(opts).await;
        if result.is_ok() {
            self.lifecycle.record_activity(workspace_id);
            info!(workspace_id, "container running");
        }
        OperationResult::failed(result.map(run_result_to_value))
    }

    pub async fn stop_container(&self, workspace_id: u64) -> OperationResult {
        if !self.is_enabled() {
            return OperationResult::disabled();
        }
        let handler = self.handler().await;
        let result = handler.stop_container(workspace_id).await;
        if result.is_ok() {
            self.lifecycle.release_port(workspace_id);
        }
        OperationResult::failed(result.map(|_| Value::Null))
    }

    pub async fn get_container_status(&self, workspace_id: u64) -> OperationResult {
        if !self.is_enabled() {
            return OperationResult::disabled();
        }
        let handler = self.handler().await;
        let result = handler.get_container_status(workspace_id).await;
        if let Ok(status) = &result {
            if status.is_running {
                self.lifecycle.record_activity(workspace_id);
            }
        }
        OperationResult::failed(result.map(|s| {
            serde_json::json!({
                "isRunning": s.is_running,
                "isReady": s.is_ready,
                "hasDependenciesInstalled": s.has_dependencies_installed,
                "containerName": s.container_name,
                "port": s.port,
                "status": s.status,
            })
        }))
    }

    pub async fn exec_in_container(&self, workspace_id: u64, argv: &[String]) -> OperationResult {
        if !self.is_enabled() {
            return OperationResult::disabled();
        }
        let handler = self.handler().await;
        let result = handler.exec_in_container(workspace_id, argv).await;
        if result.is_ok() {
            self.lifecycle.record_activity(workspace_id);
        }
        OperationResult::failed(result.map(exec_result_to_value))
    }

    pub async fn get_container_logs(&self, workspace_id: u64, lines: Option<u32>) -> OperationResult {
        if !self.is_enabled() {
            return OperationResult::disabled();
        }
        let handler = self.handler().await;
        let result = handler.get_container_logs(workspace_id, lines).await;
        if result.is_ok() {
            self.lifecycle.record_activity(workspace_id);
        }
        OperationResult::failed(result.map(Value::String))
    }

    pub async fn remove_container(&self, workspace_id: u64, force: bool) -> OperationResult {
        if !self.is_enabled() {
            return OperationResult::disabled();
        }
        let handler = self.handler().await;
        let result = handler.remove_container(workspace_id, force).await;
        if result.is_ok() {
            self.lifecycle.release_port(workspace_id);
        }
        let _ = handler.cleanup_volumes(workspace_id).await;
        OperationResult::failed(result.map(|_| Value::Null))
    }

    pub async fn exec_raw(&self, workspace_id: u64, argv: &[String]) -> EngineResult<ExecResult> {
        self.handler().await.exec_in_container(workspace_id, argv).await
    }

    pub async fn current_engine_handler(&self) -> Arc<dyn EngineHandler> {
        self.handler().await
    }

    /// Runs discovery against the live engine once on process start (§4.4).
    pub async fn discover(&self) {
        if !self.is_enabled() {
            return;
        }
        let handler = self.handler().await;
        if let Err(e) = self.lifecycle.discover(handler.as_ref()).await {
            error!(error = %e, "boot-time container discovery failed");
        }
    }

    /// Registers the periodic reaper job against the given scheduler (§4.4).
    /// Returns the job handle so the caller can cancel it on shutdown.
    pub async fn start_reaper(self: &Arc<Self>, scheduler: &Scheduler) -> crate::cron::JobHandle {
        let service = Arc::clone(self);
        let interval = self.lifecycle.check_interval();
        scheduler
            .schedule("lifecycle_reaper", interval, move || {
                let service = Arc::clone(&service);
                async move {
                    service.reap_tick().await;
                }
            })
            .await
    }

    async fn reap_tick(&self) {
        if !self.is_enabled() {
            return;
        }
        let handler = self.handler().await;
        let timeout = self.lifecycle.inactivity_timeout();

        for (workspace_id, inactive) in self.lifecycle.inactivity_snapshot() {
            if inactive < timeout {
                continue;
            }
            if is_container_actively_used(handler.as_ref(), workspace_id).await {
                self.lifecycle.refresh_on_active_use(workspace_id);
                continue;
            }
            info!(workspace_id, ?inactive, "reaping idle container");
            if let Err(e) = handler.stop_container(workspace_id).await {
                warn!(workspace_id, error = %e, "reaper failed to stop container");
                continue;
            }
            self.lifecycle.reap_one(workspace_id);
        }
    }
}

fn run_result_to_value(r: RunContainerResult) -> Value {
    serde_json::json!({ "containerName": r.container_name, "port": r.port })
}

fn exec_result_to_value(r: ExecResult) -> Value {
    serde_json::json!({ "exitCode": r.exit_code, "stdout": r.stdout, "stderr": r.stderr })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DockerConfig, EngineKind, PodmanConfig, ResourceLimits};
    use crate::config::LifecycleConfig;

    fn disabled_service() -> ContainerizationService {
        let config = ContainerizationConfig {
            enabled: false,
            engine: EngineKind::Docker,
            docker: DockerConfig { image: "node:20".into(), default_port: 32100 },
            podman: PodmanConfig { image: "node:20".into(), default_port: 32100 },
            limits: ResourceLimits::default(),
            auto_kill_port: false,
        };
        ContainerizationService::new(config, Arc::new(Lifecycle::new(LifecycleConfig::default())))
    }

    #[tokio::test]
    async fn disabled_service_returns_uniform_disabled_result_without_error() {
        let service = disabled_service();
        let result = service.run_container(1, "/w/1", 32100, false, false).await;
        assert!(!result.success);
        assert!(result.error.is_none());

        let status = service.get_service_status().await;
        assert!(!status.enabled);
        assert!(!status.engine_available);
    }
}
