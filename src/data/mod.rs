//! Core data model (§3) plus the narrow traits the stream processor depends
//! on instead of a concrete CRUD layer: `WorkspaceRepository`, `ChatRepository`,
//! and (in `model_provider`) `ModelProvider`. Production wiring of these
//! traits against the real schema and model SDKs is out of scope; each trait
//! ships an in-memory fixture implementation sufficient to drive the core's
//! own tests.

mod model_provider;
mod models;
mod repository;

pub use model_provider::{FixtureModelProvider, ModelChunk, ModelProvider};
pub use models::{Chat, FileOperation, Message, MessageRole, Workspace};
pub use repository::{ChatRepository, InMemoryChatRepository, InMemoryWorkspaceRepository, WorkspaceRepository};
