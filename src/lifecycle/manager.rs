//! The `Lifecycle` singleton itself: port pool + activity map + starting
//! set (§4.4 state). Port allocation is the primary critical section and is
//! serialized through `alloc_lock` so read+choose+reserve is atomic even
//! though the maps themselves are concurrent (§5).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::LifecycleConfig;
use crate::engine::EngineHandler;

use super::errors::LifecycleError;

pub struct Lifecycle {
    config: LifecycleConfig,
    activity: DashMap<u64, Instant>,
    ports: DashMap<u64, u16>,
    starting: Mutex<HashSet<u64>>,
    alloc_lock: Mutex<()>,
}

impl Lifecycle {
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            config,
            activity: DashMap::new(),
            ports: DashMap::new(),
            starting: Mutex::new(HashSet::new()),
            alloc_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// `RecordActivity(wid)` — sets `activity[wid] = now()`. Never decreases
    /// an existing timestamp (P3), though in practice `Instant::now()` is
    /// monotonic so this is automatic; the explicit check documents the
    /// invariant rather than relying on that alone.
    pub fn record_activity(&self, workspace_id: u64) {
        let now = Instant::now();
        self.activity
            .entry(workspace_id)
            .and_modify(|existing| {
                if now > *existing {
                    *existing = now;
                }
            })
            .or_insert(now);
    }

    pub fn last_activity(&self, workspace_id: u64) -> Option<Instant> {
        self.activity.get(&workspace_id).map(|v| *v)
    }

    pub fn get_port(&self, workspace_id: u64) -> Option<u16> {
        self.ports.get(&workspace_id).map(|v| *v)
    }

    pub fn release_port(&self, workspace_id: u64) {
        self.ports.remove(&workspace_id);
    }

    pub async fn mark_starting(&self, workspace_id: u64) -> bool {
        self.starting.lock().await.insert(workspace_id)
    }

    pub async fn mark_started(&self, workspace_id: u64) {
        self.starting.lock().await.remove(&workspace_id);
    }

    pub async fn clear_starting(&self, workspace_id: u64) {
        self.starting.lock().await.remove(&workspace_id);
    }

    pub async fn is_starting(&self, workspace_id: u64) -> bool {
        self.starting.lock().await.contains(&workspace_id)
    }

    /// `AllocatePort(wid, forceNew)` (§4.4). The whole read+choose+reserve
    /// sequence runs under `alloc_lock` so two concurrent callers never pick
    /// the same free port.
    pub async fn allocate_port(
        &self,
        workspace_id: u64,
        force_new: bool,
        handler: &dyn EngineHandler,
    ) -> Result<u16, LifecycleError> {
        let _guard = self.alloc_lock.lock().await;

        let live_ports = handler.list_managed_ports(Some(workspace_id)).await?;
        let in_use: HashSet<u16> = live_ports.iter().map(|(_, p)| *p).collect();

        if !force_new {
            if let Some(existing) = self.get_port(workspace_id) {
                if !in_use.contains(&existing) {
                    return Ok(existing);
                }
                debug!(workspace_id, existing, "previously allocated port no longer free, reallocating");
                self.ports.remove(&workspace_id);
            }
        }

        let already_allocated: HashSet<u16> = self.ports.iter().map(|e| *e.value()).collect();

        for candidate in self.config.port_base..=self.config.port_max {
            if in_use.contains(&candidate) || already_allocated.contains(&candidate) {
                continue;
            }
            self.ports.insert(workspace_id, candidate);
            info!(workspace_id, port = candidate, "allocated port");
            return Ok(candidate);
        }

        Err(LifecycleError::NoPortsAvailable)
    }

    /// `Discover()` — invoked once on process start (§4.4).
    pub async fn discover(&self, handler: &dyn EngineHandler) -> Result<(), LifecycleError> {
        let containers = handler.discover_containers().await?;
        let inactivity_timeout = Duration::from_millis(self.config.inactivity_timeout_ms);
        let now = Instant::now();
        let stale = now.checked_sub(inactivity_timeout).unwrap_or(now);

        for container in containers {
            if container.is_running {
                self.activity.insert(container.workspace_id, now);
                if let Some(port) = container.port {
                    self.ports.insert(container.workspace_id, port);
                }
            } else {
                // Candidate for cleanup on the next reaper tick unless reactivated.
                self.activity.insert(container.workspace_id, stale);
            }
        }

        info!(discovered = self.activity.len(), "lifecycle discovery complete");
        Ok(())
    }

    /// Snapshot of `(workspace_id, inactive_duration)` for every tracked
    /// workspace, used by the reaper.
    pub fn inactivity_snapshot(&self) -> Vec<(u64, Duration)> {
        let now = Instant::now();
        self.activity
            .iter()
            .map(|entry| (*entry.key(), now.saturating_duration_since(*entry.value())))
            .collect()
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.config.inactivity_timeout_ms)
    }

    pub fn preview_inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.config.preview_inactivity_timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.config.check_interval_ms)
    }

    pub fn reap_one(&self, workspace_id: u64) {
        self.activity.remove(&workspace_id);
        self.ports.remove(&workspace_id);
    }

    pub fn refresh_on_active_use(&self, workspace_id: u64) {
        self.record_activity(workspace_id);
    }
}

/// `IsContainerActivelyUsed(wid)` (§4.4): CPU > 1% OR net I/O delta > 10 KB
/// since the handler's own baseline. On a stats failure, bias toward
/// keeping the container alive.
pub async fn is_container_actively_used(handler: &dyn EngineHandler, workspace_id: u64) -> bool {
    match handler.container_stats(workspace_id).await {
        Ok((cpu_percent, net_bytes)) => {
            const ACTIVE_CPU_THRESHOLD: f64 = 1.0;
            const ACTIVE_NET_THRESHOLD_BYTES: u64 = 10 * 1024;
            cpu_percent > ACTIVE_CPU_THRESHOLD || net_bytes > ACTIVE_NET_THRESHOLD_BYTES
        }
        Err(e) => {
            warn!(workspace_id, error = %e, "stats probe failed, assuming active");
            true
        }
    }
}

pub type SharedLifecycle = Arc<Lifecycle>;

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    use crate::engine::{ContainerStatus, DiscoveredContainer, EngineResult, ExecResult, RunContainerOptions, RunContainerResult};

    #[derive(Default)]
    struct StubHandler {
        managed_ports: StdMutex<Vec<(u64, u16)>>,
    }

    #[async_trait]
    impl EngineHandler for StubHandler {
        async fn initialize(&self) -> EngineResult<()> {
            Ok(())
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn version(&self) -> EngineResult<String> {
            Ok("stub".into())
        }
        async fn run_container(&self, _opts: RunContainerOptions) -> EngineResult<RunContainerResult> {
            unimplemented!()
        }
        async fn stop_container(&self, _workspace_id: u64) -> EngineResult<()> {
            Ok(())
        }
        async fn get_container_status(&self, _workspace_id: u64) -> EngineResult<ContainerStatus> {
            Ok(ContainerStatus::default())
        }
        async fn container_exists(&self, _workspace_id: u64) -> EngineResult<bool> {
            Ok(false)
        }
        async fn is_container_running(&self, _workspace_id: u64) -> EngineResult<bool> {
            Ok(false)
        }
        async fn is_container_ready(&self, _workspace_id: u64, _port: u16) -> EngineResult<bool> {
            Ok(false)
        }
        async fn has_dependencies_installed(&self, _workspace_id: u64) -> EngineResult<bool> {
            Ok(false)
        }
        async fn sync_files_to_container(&self, _workspace_id: u64, _file_paths: &[String]) -> EngineResult<()> {
            Ok(())
        }
        async fn exec_in_container(&self, _workspace_id: u64, _argv: &[String]) -> EngineResult<ExecResult> {
            Ok(ExecResult { exit_code: 0, stdout: String::new(), stderr: String::new() })
        }
        async fn get_container_logs(&self, _workspace_id: u64, _lines: Option<u32>) -> EngineResult<String> {
            Ok(String::new())
        }
        async fn follow_container_logs(
            &self,
            _workspace_id: u64,
            _window: std::time::Duration,
            _tx: tokio::sync::mpsc::UnboundedSender<crate::engine::ContainerLogEvent>,
        ) -> EngineResult<()> {
            Ok(())
        }
        async fn remove_container(&self, _workspace_id: u64, _force: bool) -> EngineResult<()> {
            Ok(())
        }
        async fn cleanup_volumes(&self, _workspace_id: u64) -> EngineResult<()> {
            Ok(())
        }
        async fn list_managed_ports(&self, exclude: Option<u64>) -> EngineResult<Vec<(u64, u16)>> {
            Ok(self
                .managed_ports
                .lock()
                .unwrap()
                .iter()
                .cloned()
                .filter(|(wid, _)| Some(*wid) != exclude)
                .collect())
        }
        async fn discover_containers(&self) -> EngineResult<Vec<DiscoveredContainer>> {
            Ok(vec![])
        }
        async fn container_stats(&self, _workspace_id: u64) -> EngineResult<(f64, u64)> {
            Ok((0.0, 0))
        }
        async fn get_engine_info(&self) -> EngineResult<String> {
            Ok(String::new())
        }
    }

    fn lifecycle() -> Lifecycle {
        Lifecycle::new(LifecycleConfig {
            port_base: 32100,
            port_max: 32102,
            ..LifecycleConfig::default()
        })
    }

    #[tokio::test]
    async fn allocate_port_stays_within_bounds() {
        let lc = lifecycle();
        let handler = StubHandler::default();
        let p = lc.allocate_port(1, false, &handler).await.unwrap();
        assert!((32100..=32102).contains(&p));
    }

    #[tokio::test]
    async fn allocate_port_never_double_books() {
        let lc = lifecycle();
        let handler = StubHandler::default();
        let p1 = lc.allocate_port(1, false, &handler).await.unwrap();
        let p2 = lc.allocate_port(2, false, &handler).await.unwrap();
        let p3 = lc.allocate_port(3, false, &handler).await.unwrap();
        assert_ne!(p1, p2);
        assert_ne!(p2, p3);
        assert_ne!(p1, p3);
        // Pool of 3 ports is now exhausted.
        assert!(matches!(
            lc.allocate_port(4, false, &handler).await,
            Err(LifecycleError::NoPortsAvailable)
        ));
    }

    #[tokio::test]
    async fn allocate_port_reuses_existing_when_still_free() {
        let lc = lifecycle();
        let handler = StubHandler::default();
        let first = lc.allocate_port(1, false, &handler).await.unwrap();
        let second = lc.allocate_port(1, false, &handler).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn allocate_port_reallocates_when_conflict_reported() {
        let lc = lifecycle();
        let handler = StubHandler::default();
        let first = lc.allocate_port(1, false, &handler).await.unwrap();
        // Simulate the engine now reporting that port bound to a different workspace.
        handler.managed_ports.lock().unwrap().push((99, first));
        let second = lc.allocate_port(1, false, &handler).await.unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn record_activity_never_moves_backward() {
        let lc = lifecycle();
        lc.record_activity(1);
        let first = lc.last_activity(1).unwrap();
        lc.record_activity(1);
        let second = lc.last_activity(1).unwrap();
        assert!(second >= first);
    }

    #[tokio::test]
    async fn starting_flag_prevents_concurrent_marks() {
        let lc = lifecycle();
        assert!(lc.mark_starting(1).await);
        assert!(!lc.mark_starting(1).await);
        lc.clear_starting(1).await;
        assert!(lc.mark_starting(1).await);
    }
}
