//! C6: the containerization facade. The single entry point every other
//! subsystem (stream processor, preview router, HTTP diagnostics) goes
//! through to reach the engine — never the engine handlers directly.

mod service;

pub use service::{ContainerizationService, OperationResult, ServiceStatus};
