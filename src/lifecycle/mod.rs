//! C7: the process-wide port pool and activity tracker. A single `Lifecycle`
//! instance is owned by the composition root and shared (via `Arc`) with the
//! containerization facade and the preview router — there is no global
//! mutable state beyond that one instance (§9).

mod errors;
mod manager;

pub use errors::LifecycleError;
pub use manager::{is_container_actively_used, Lifecycle};
