//! C5: instantiates and caches one handler per engine kind, selected from
//! config. Switching engines requires a restart; this factory does not
//! hot-swap (§4.2).

use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::config::{ContainerizationConfig, EngineKind};

use super::docker::DockerHandler;
use super::podman::PodmanHandler;
use super::traits::EngineHandler;

pub struct EngineFactory {
    engine: EngineKind,
    docker: OnceCell<Arc<dyn EngineHandler>>,
    podman: OnceCell<Arc<dyn EngineHandler>>,
}

impl EngineFactory {
    pub fn new(config: &ContainerizationConfig) -> Self {
        Self {
            engine: config.engine,
            docker: OnceCell::new(),
            podman: OnceCell::new(),
        }
    }

    /// Returns the handler for the configured engine, instantiating and
    /// caching it on first use.
    pub async fn current_handler(&self) -> Arc<dyn EngineHandler> {
        match self.engine {
            EngineKind::Docker => {
                self.docker
                    .get_or_init(|| async { Arc::new(DockerHandler::new()) as Arc<dyn EngineHandler> })
                    .await
                    .clone()
            }
            EngineKind::Podman => {
                self.podman
                    .get_or_init(|| async { Arc::new(PodmanHandler::new()) as Arc<dyn EngineHandler> })
                    .await
                    .clone()
            }
        }
    }

    pub fn engine_kind(&self) -> EngineKind {
        self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DockerConfig, PodmanConfig, ResourceLimits};

    fn test_config(engine: EngineKind) -> ContainerizationConfig {
        ContainerizationConfig {
            enabled: true,
            engine,
            docker: DockerConfig {
                image: "node:20".into(),
                default_port: 32100,
            },
            podman: PodmanConfig {
                image: "node:20".into(),
                default_port: 32100,
            },
            limits: ResourceLimits::default(),
            auto_kill_port: false,
        }
    }

    #[tokio::test]
    async fn caches_the_same_handler_instance_per_kind() {
        let factory = EngineFactory::new(&test_config(EngineKind::Docker));
        let a = factory.current_handler().await;
        let b = factory.current_handler().await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn returns_the_configured_engine_kind() {
        let factory = EngineFactory::new(&test_config(EngineKind::Podman));
        assert_eq!(factory.engine_kind(), EngineKind::Podman);
    }
}
