use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("port conflict: {0}")]
    PortConflict(u16),

    #[error("no ports available")]
    NoPortsAvailable,

    #[error(transparent)]
    Engine(#[from] crate::engine::EngineError),
}
