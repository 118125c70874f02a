//! Entities described in §3: `Workspace`, `Chat`, `Message`, `FileOperation`.
//! `ContainerRecord` and `PortPool` are owned by the lifecycle manager and
//! live in the `lifecycle` module instead, since nothing outside it touches
//! them directly.

use serde::{Deserialize, Serialize};

/// A workspace: one directory on disk backing one sandboxed application.
///
/// Invariant: `path` exists on disk for the lifetime of the workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: u64,
    pub name: String,
    pub path: String,
    pub owner_id: u64,
    pub install_command: Option<String>,
    pub start_command: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One turn in a chat. The core writes one assistant message per stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub chat_id: u64,
    pub role: MessageRole,
    pub content: String,
    pub model: Option<String>,
    pub streaming: bool,
}

/// A chat anchors a sequence of messages to one workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: u64,
    pub workspace_id: u64,
    pub messages: Vec<Message>,
}

/// A file-operation tag parsed from model output (§6 tag language),
/// pending application at stream completion (§4.6.1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileOperation {
    Write { path: String, content: String },
    Rename { from: String, to: String },
    Delete { path: String },
    SearchReplace { path: String, find: String, replace: String },
    AddDependencies { packages: Vec<String> },
}
