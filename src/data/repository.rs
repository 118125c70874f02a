use async_trait::async_trait;
use dashmap::DashMap;

use super::models::{Chat, Message, Workspace};

/// Resolves a workspace id to its path and overrides. Production wiring
/// against the real CRUD schema is out of scope; see `InMemoryWorkspaceRepository`
/// for the fixture this core tests against.
#[async_trait]
pub trait WorkspaceRepository: Send + Sync {
    async fn get(&self, workspace_id: u64) -> Option<Workspace>;
}

/// Loads chat history and appends messages produced by a stream.
#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn get_chat(&self, chat_id: u64) -> Option<Chat>;
    async fn append_message(&self, chat_id: u64, message: Message) -> Option<Message>;
}

/// In-memory `WorkspaceRepository` used by tests and as a development
/// fallback before the real CRUD layer is wired in.
#[derive(Default)]
pub struct InMemoryWorkspaceRepository {
    workspaces: DashMap<u64, Workspace>,
}

impl InMemoryWorkspaceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, workspace: Workspace) {
        self.workspaces.insert(workspace.id, workspace);
    }
}

#[async_trait]
impl WorkspaceRepository for InMemoryWorkspaceRepository {
    async fn get(&self, workspace_id: u64) -> Option<Workspace> {
        self.workspaces.get(&workspace_id).map(|w| w.clone())
    }
}

/// In-memory `ChatRepository` used by tests.
#[derive(Default)]
pub struct InMemoryChatRepository {
    chats: DashMap<u64, Chat>,
    next_message_id: std::sync::atomic::AtomicU64,
}

impl InMemoryChatRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_chat(&self, chat: Chat) {
        self.chats.insert(chat.id, chat);
    }
}

#[async_trait]
impl ChatRepository for InMemoryChatRepository {
    async fn get_chat(&self, chat_id: u64) -> Option<Chat> {
        self.chats.get(&chat_id).map(|c| c.clone())
    }

    async fn append_message(&self, chat_id: u64, mut message: Message) -> Option<Message> {
        let mut chat = self.chats.get_mut(&chat_id)?;
        message.id = self
            .next_message_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        message.chat_id = chat_id;
        chat.messages.push(message.clone());
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::models::MessageRole;

    #[tokio::test]
    async fn workspace_repository_roundtrip() {
        let repo = InMemoryWorkspaceRepository::new();
        repo.insert(Workspace {
            id: 1,
            name: "demo".into(),
            path: "/w/1".into(),
            owner_id: 1,
            install_command: None,
            start_command: None,
        });

        let found = repo.get(1).await.unwrap();
        assert_eq!(found.path, "/w/1");
        assert!(repo.get(2).await.is_none());
    }

    #[tokio::test]
    async fn chat_repository_appends_and_assigns_ids() {
        let repo = InMemoryChatRepository::new();
        repo.insert_chat(Chat {
            id: 1,
            workspace_id: 1,
            messages: vec![],
        });

        let appended = repo
            .append_message(
                1,
                Message {
                    id: 0,
                    chat_id: 0,
                    role: MessageRole::User,
                    content: "hello".into(),
                    model: None,
                    streaming: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(appended.chat_id, 1);

        let chat = repo.get_chat(1).await.unwrap();
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].content, "hello");
    }
}
