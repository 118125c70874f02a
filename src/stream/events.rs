//! SSE event types emitted by the stream processor (§6).

use axum::response::sse::Event;
use serde_json::{json, Value};

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Connected { timestamp: i64 },
    ChatStart { chat_id: u64, message_id: u64 },
    ChatChunk { chat_id: u64, chunk: String, full_text: String },
    ChatComplete { chat_id: u64, message_id: u64, content: String, changed_files: Vec<String> },
    DependenciesInstalling { chat_id: u64, packages: Vec<String> },
    DependenciesInstalled { chat_id: u64, packages: Vec<String> },
    DockerStarting { chat_id: u64, app_id: u64 },
    DockerStarted { chat_id: u64, app_id: u64, port: u16, url: String },
    DockerOutput { app_id: u64, output: String },
    DockerError { app_id: u64, error: String },
    DockerClosed { app_id: u64, exit_code: i32 },
    ChatError { chat_id: u64, error: String },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Connected { .. } => "connected",
            StreamEvent::ChatStart { .. } => "chat:start",
            StreamEvent::ChatChunk { .. } => "chat:chunk",
            StreamEvent::ChatComplete { .. } => "chat:complete",
            StreamEvent::DependenciesInstalling { .. } => "dependencies:installing",
            StreamEvent::DependenciesInstalled { .. } => "dependencies:installed",
            StreamEvent::DockerStarting { .. } => "docker:starting",
            StreamEvent::DockerStarted { .. } => "docker:started",
            StreamEvent::DockerOutput { .. } => "docker:output",
            StreamEvent::DockerError { .. } => "docker:error",
            StreamEvent::DockerClosed { .. } => "docker:closed",
            StreamEvent::ChatError { .. } => "chat:error",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            StreamEvent::Connected { timestamp } => json!({ "timestamp": timestamp }),
            StreamEvent::ChatStart { chat_id, message_id } => json!({ "chatId": chat_id, "messageId": message_id }),
            StreamEvent::ChatChunk { chat_id, chunk, full_text } => {
                json!({ "chatId": chat_id, "chunk": chunk, "fullText": full_text })
            }
            StreamEvent::ChatComplete { chat_id, message_id, content, changed_files } => json!({
                "chatId": chat_id,
                "messageId": message_id,
                "content": content,
                "changedFiles": changed_files,
            }),
            StreamEvent::DependenciesInstalling { chat_id, packages } => {
                json!({ "chatId": chat_id, "packages": packages })
            }
            StreamEvent::DependenciesInstalled { chat_id, packages } => {
                json!({ "chatId": chat_id, "packages": packages })
            }
            StreamEvent::DockerStarting { chat_id, app_id } => json!({ "chatId": chat_id, "appId": app_id }),
            StreamEvent::DockerStarted { chat_id, app_id, port, url } => {
                json!({ "chatId": chat_id, "appId": app_id, "port": port, "url": url })
            }
            StreamEvent::DockerOutput { app_id, output } => json!({ "appId": app_id, "output": output }),
            StreamEvent::DockerError { app_id, error } => json!({ "appId": app_id, "error": error }),
            StreamEvent::DockerClosed { app_id, exit_code } => json!({ "appId": app_id, "exitCode": exit_code }),
            StreamEvent::ChatError { chat_id, error } => json!({ "chatId": chat_id, "error": error }),
        }
    }

    pub fn into_sse(self) -> Event {
        Event::default().event(self.name()).json_data(self.payload()).expect("event payload is always valid JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_match_wire_contract() {
        assert_eq!(StreamEvent::Connected { timestamp: 0 }.name(), "connected");
        assert_eq!(StreamEvent::ChatError { chat_id: 1, error: "canceled".into() }.name(), "chat:error");
        assert_eq!(
            StreamEvent::DockerStarted { chat_id: 1, app_id: 1, port: 32100, url: "http://localhost:32100".into() }
                .name(),
            "docker:started"
        );
    }

    #[test]
    fn chat_complete_payload_carries_changed_files() {
        let event = StreamEvent::ChatComplete {
            chat_id: 1,
            message_id: 2,
            content: "done".into(),
            changed_files: vec!["src/index.html".into()],
        };
        let payload = event.payload();
        assert_eq!(payload["changedFiles"][0], "src/index.html");
    }
}
