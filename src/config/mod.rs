//! Environment-variable-driven configuration.
//!
//! Unlike the rest of this daemon family, this binary has no YAML/TOML
//! config file: every setting is read from the environment with a typed
//! default, following the nested-struct-with-defaults shape the daemon's
//! file-based config used, just expressed as `env::var(...).ok()` chains.

use std::env;
use std::net::SocketAddr;

/// Which engine family the factory should instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Docker,
    Podman,
}

impl EngineKind {
    fn from_env_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Some(EngineKind::Docker),
            "podman" => Some(EngineKind::Podman),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Docker => "docker",
            EngineKind::Podman => "podman",
        }
    }
}

/// Settings specific to the Docker handler.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub image: String,
    pub default_port: u16,
}

/// Settings specific to the Podman handler.
#[derive(Debug, Clone)]
pub struct PodmanConfig {
    pub image: String,
    pub default_port: u16,
}

/// Resource limits passed through to `RunContainer`, engine-native syntax.
#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
}

/// Config for the containerization subsystem (C3-C6).
#[derive(Debug, Clone)]
pub struct ContainerizationConfig {
    pub enabled: bool,
    pub engine: EngineKind,
    pub docker: DockerConfig,
    pub podman: PodmanConfig,
    pub limits: ResourceLimits,
    pub auto_kill_port: bool,
}

impl ContainerizationConfig {
    /// The image and default port for whichever engine is active.
    pub fn active_image(&self) -> &str {
        match self.engine {
            EngineKind::Docker => &self.docker.image,
            EngineKind::Podman => &self.podman.image,
        }
    }

    pub fn active_default_port(&self) -> u16 {
        match self.engine {
            EngineKind::Docker => self.docker.default_port,
            EngineKind::Podman => self.podman.default_port,
        }
    }

    fn from_env() -> Self {
        Self {
            enabled: env_bool("CONTAINERIZATION_ENABLED", true),
            engine: env::var("CONTAINERIZATION_ENGINE")
                .ok()
                .and_then(|v| EngineKind::from_env_str(&v))
                .unwrap_or(EngineKind::Docker),
            docker: DockerConfig {
                image: env::var("DOCKER_IMAGE").unwrap_or_else(|_| "node:20-bookworm".to_string()),
                default_port: env_u16("DOCKER_DEFAULT_PORT", 32100),
            },
            podman: PodmanConfig {
                image: env::var("PODMAN_IMAGE").unwrap_or_else(|_| "node:20-bookworm".to_string()),
                default_port: env_u16("PODMAN_DEFAULT_PORT", 32100),
            },
            limits: ResourceLimits {
                cpu_limit: env::var("CONTAINER_CPU_LIMIT").ok(),
                memory_limit: env::var("CONTAINER_MEMORY_LIMIT").ok(),
            },
            auto_kill_port: env_bool("AUTO_KILL_PORT", false),
        }
    }
}

/// Config for the lifecycle & port manager (C7).
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub inactivity_timeout_ms: u64,
    pub preview_inactivity_timeout_ms: u64,
    pub check_interval_ms: u64,
    pub port_base: u16,
    pub port_max: u16,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: 600_000,
            preview_inactivity_timeout_ms: 900_000,
            check_interval_ms: 120_000,
            port_base: 32100,
            port_max: 32200,
        }
    }
}

impl LifecycleConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            inactivity_timeout_ms: env_u64(
                "CONTAINER_INACTIVITY_TIMEOUT",
                defaults.inactivity_timeout_ms,
            ),
            ..defaults
        }
    }
}

/// Top-level configuration for the daemon.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub bind_addr: SocketAddr,
    pub apps_base_dir: String,
    pub containerization: ContainerizationConfig,
    pub lifecycle: LifecycleConfig,
}

impl Configuration {
    /// Load configuration from the process environment, falling back to
    /// documented defaults for anything unset.
    pub fn from_env() -> Self {
        let bind_addr = env::var("BIND_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| "0.0.0.0:8080".parse().unwrap());

        Self {
            bind_addr,
            apps_base_dir: env::var("APPS_BASE_DIR").unwrap_or_else(|_| "/apps".to_string()),
            containerization: ContainerizationConfig::from_env(),
            lifecycle: LifecycleConfig::from_env(),
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_u16(key: &str, default: u16) -> u16 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_kind_parses_case_insensitively() {
        assert_eq!(EngineKind::from_env_str("Docker"), Some(EngineKind::Docker));
        assert_eq!(EngineKind::from_env_str("PODMAN"), Some(EngineKind::Podman));
        assert_eq!(EngineKind::from_env_str("other"), None);
    }

    #[test]
    fn lifecycle_defaults_match_spec() {
        let cfg = LifecycleConfig::default();
        assert_eq!(cfg.inactivity_timeout_ms, 600_000);
        assert_eq!(cfg.preview_inactivity_timeout_ms, 900_000);
        assert_eq!(cfg.check_interval_ms, 120_000);
        assert_eq!(cfg.port_base, 32100);
        assert_eq!(cfg.port_max, 32200);
    }
}
