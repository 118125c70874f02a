//! C9: the stream/response processor. Runs one stream per request (§4.6) as
//! a spawned task writing into an mpsc channel; the router adapts the
//! resulting `ReceiverStream` into an SSE body.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::containerization::ContainerizationService;
use crate::data::{Chat, ChatRepository, Message, MessageRole, ModelChunk, ModelProvider, Workspace, WorkspaceRepository};
use crate::engine::{detect_package_manager, install_argv, ContainerLogEvent};

use super::context::{build_codebase_context, inline_file_references};
use super::errors::StreamError;
use super::events::StreamEvent;
use super::file_ops::apply_operations;
use super::registry::StreamRegistry;
use super::tag_parser::{ParseEvent, TagParser};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How long `restart_if_needed` keeps tailing the restarted container's logs
/// before giving up on it (§4.6.3's `docker:output`/`docker:closed` events).
/// Long enough to catch a crash-on-boot, short enough not to hold the SSE
/// channel open for the dev server's whole lifetime.
const LOG_FOLLOW_WINDOW: Duration = Duration::from_secs(10);

/// Body of `POST /api/stream/chat` (§6).
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStreamRequest {
    pub chat_id: u64,
    pub prompt: Option<String>,
    pub message_id: Option<u64>,
    pub attachments: Option<Vec<String>>,
    pub selected_component: Option<String>,
    #[serde(default)]
    pub redo: bool,
}

#[derive(Clone)]
pub struct StreamProcessor {
    workspaces: Arc<dyn WorkspaceRepository>,
    chats: Arc<dyn ChatRepository>,
    model: Arc<dyn ModelProvider>,
    containerization: Arc<ContainerizationService>,
    registry: Arc<StreamRegistry>,
}

impl StreamProcessor {
    pub fn new(
        workspaces: Arc<dyn WorkspaceRepository>,
        chats: Arc<dyn ChatRepository>,
        model: Arc<dyn ModelProvider>,
        containerization: Arc<ContainerizationService>,
    ) -> Self {
        Self { workspaces, chats, model, containerization, registry: Arc::new(StreamRegistry::new()) }
    }

    /// Aborts the active stream for `chat_id`, per the cancel endpoint (§6).
    pub fn cancel(&self, chat_id: u64) -> bool {
        self.registry.cancel(chat_id)
    }

    /// Starts a new stream and returns the event source the router adapts
    /// into an SSE response. The pipeline runs on a spawned task so it keeps
    /// making progress even if the SSE body is polled slowly.
    pub fn start(&self, request: ChatStreamRequest) -> ReceiverStream<StreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let this = self.clone();
        tokio::spawn(async move { this.run(request, tx).await });
        ReceiverStream::new(rx)
    }

    async fn run(&self, request: ChatStreamRequest, tx: mpsc::Sender<StreamEvent>) {
        let chat_id = request.chat_id;
        let token = self.registry.register(chat_id);
        if let Err(e) = self.run_inner(request, &tx, &token).await {
            if !matches!(e, StreamError::Canceled) {
                let _ = tx.send(StreamEvent::ChatError { chat_id, error: e.to_string() }).await;
            }
        }
        self.registry.unregister(chat_id);
    }

    async fn run_inner(
        &self,
        request: ChatStreamRequest,
        tx: &mpsc::Sender<StreamEvent>,
        token: &tokio_util::sync::CancellationToken,
    ) -> Result<(), StreamError> {
        let chat = self
            .chats
            .get_chat(request.chat_id)
            .await
            .ok_or_else(|| StreamError::Model(format!("chat {} not found", request.chat_id)))?;
        let workspace = self
            .workspaces
            .get(chat.workspace_id)
            .await
            .ok_or_else(|| StreamError::Model(format!("workspace {} not found", chat.workspace_id)))?;

        send(tx, StreamEvent::Connected { timestamp: chrono::Utc::now().timestamp() }).await;

        let mut message_id = request.message_id.unwrap_or(0);
        let prompt = request.prompt.clone().unwrap_or_default();
        if !request.redo && request.prompt.is_some() {
            let user_message = Message {
                id: 0,
                chat_id: chat.id,
                role: MessageRole::User,
                content: prompt.clone(),
                model: None,
                streaming: false,
            };
            if let Some(saved) = self.chats.append_message(chat.id, user_message).await {
                message_id = saved.id;
            }
        }
        send(tx, StreamEvent::ChatStart { chat_id: chat.id, message_id }).await;

        let mut system_context = build_codebase_context(&workspace.path, &chat.messages);
        if let Some(component) = &request.selected_component {
            debug!(component, "prompt scoped to selected component");
        }
        if let Some(attachments) = &request.attachments {
            for attachment in attachments {
                if let Ok(content) = tokio::fs::read_to_string(Path::new(&workspace.path).join(attachment)).await {
                    system_context.push_str(&format!("\n--- attachment {} ---\n{}\n", attachment, content));
                }
            }
        }
        let prompt = inline_file_references(&prompt, &workspace.path);

        let (full_text, pending_ops, canceled) = self.consume_model_stream(&chat, &system_context, &prompt, tx, token).await?;

        if canceled {
            self.persist_assistant_message(&chat, &full_text).await;
            send(tx, StreamEvent::ChatError { chat_id: chat.id, error: "canceled".into() }).await;
            return Err(StreamError::Canceled);
        }

        let saved_assistant = self.persist_assistant_message(&chat, &full_text).await;
        let final_message_id = saved_assistant.map(|m| m.id).unwrap_or(message_id);

        let outcome = apply_operations(Path::new(&workspace.path), &pending_ops).await?;
        for issue in &outcome.issues {
            warn!(chat_id = chat.id, issue, "file operation issue");
        }

        let needs_install = !outcome.pending_dependencies.is_empty() || outcome.package_json_changed();
        if needs_install {
            send(tx, StreamEvent::DependenciesInstalling { chat_id: chat.id, packages: outcome.pending_dependencies.clone() }).await;
            self.run_install(&workspace, &outcome.pending_dependencies).await;
            send(tx, StreamEvent::DependenciesInstalled { chat_id: chat.id, packages: outcome.pending_dependencies.clone() }).await;
        }

        if self.containerization.is_enabled() && !outcome.changed_files.is_empty() {
            self.restart_if_needed(&chat, &workspace, needs_install, tx).await;
        }

        send(
            tx,
            StreamEvent::ChatComplete {
                chat_id: chat.id,
                message_id: final_message_id,
                content: full_text,
                changed_files: outcome.changed_files,
            },
        )
        .await;
        Ok(())
    }

    /// Consumes the model's chunk stream, feeding text into the tag parser
    /// and forwarding plain-text fragments as `chat:chunk` events (§4.6
    /// steps 4-5). Returns the accumulated text, the queued operations, and
    /// whether cancellation interrupted consumption.
    async fn consume_model_stream(
        &self,
        chat: &Chat,
        system_context: &str,
        prompt: &str,
        tx: &mpsc::Sender<StreamEvent>,
        token: &tokio_util::sync::CancellationToken,
    ) -> Result<(String, Vec<crate::data::FileOperation>, bool), StreamError> {
        let mut model_stream = self.model.stream(system_context, prompt).await;
        let mut parser = TagParser::new();
        let mut full_text = String::new();
        let mut pending_ops = Vec::new();

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok((full_text, pending_ops, true)),
                chunk = model_stream.next() => {
                    let Some(chunk) = chunk else { break };
                    match chunk {
                        ModelChunk::Error(message) => return Err(StreamError::Model(message)),
                        ModelChunk::Text(text) | ModelChunk::Reasoning(text) | ModelChunk::Thinking(text) => {
                            for event in parser.feed(&text)? {
                                match event {
                                    ParseEvent::Text(text) => {
                                        full_text.push_str(&text);
                                        send(tx, StreamEvent::ChatChunk { chat_id: chat.id, chunk: text, full_text: full_text.clone() }).await;
                                    }
                                    ParseEvent::Operation(op) => pending_ops.push(op),
                                }
                            }
                        }
                        ModelChunk::ToolCall { name, .. } | ModelChunk::ToolResult { name, .. } => {
                            debug!(tool = %name, "model tool activity (no SSE surface defined for it)");
                        }
                    }
                }
            }
        }

        for event in parser.finish()? {
            match event {
                ParseEvent::Text(text) => {
                    full_text.push_str(&text);
                    send(tx, StreamEvent::ChatChunk { chat_id: chat.id, chunk: text, full_text: full_text.clone() }).await;
                }
                ParseEvent::Operation(op) => pending_ops.push(op),
            }
        }

        Ok((full_text, pending_ops, false))
    }

    async fn persist_assistant_message(&self, chat: &Chat, content: &str) -> Option<Message> {
        self.chats
            .append_message(
                chat.id,
                Message { id: 0, chat_id: chat.id, role: MessageRole::Assistant, content: content.to_string(), model: None, streaming: false },
            )
            .await
    }

    /// §4.6.2: inside a running container via `exec`, otherwise a local
    /// subprocess.
    async fn run_install(&self, workspace: &Workspace, packages: &[String]) {
        let pm = detect_package_manager(&workspace.path);
        let argv = install_argv(pm, packages);

        if self.containerization.is_enabled() {
            let handler = self.containerization.current_engine_handler().await;
            if handler.is_container_running(workspace.id).await.unwrap_or(false) {
                if let Err(e) = self.containerization.exec_raw(workspace.id, &argv).await {
                    warn!(workspace_id = workspace.id, error = %e, "dependency install exec failed");
                }
                return;
            }
        }

        let Some((program, args)) = argv.split_first() else { return };
        match tokio::process::Command::new(program).args(args).current_dir(&workspace.path).status().await {
            Ok(status) if !status.success() => {
                warn!(workspace_id = workspace.id, ?status, "local dependency install exited non-zero");
            }
            Err(e) => warn!(workspace_id = workspace.id, error = %e, "failed to spawn local dependency install"),
            Ok(_) => {}
        }
    }

    /// §4.6.3: no-op when already running with no dependency/package.json
    /// change; otherwise stop, reallocate a port, and start fresh.
    async fn restart_if_needed(&self, chat: &Chat, workspace: &Workspace, force: bool, tx: &mpsc::Sender<StreamEvent>) {
        let status = self.containerization.get_container_status(workspace.id).await;
        let already_running = status.data.as_ref().and_then(|d| d.get("isRunning")).and_then(|v| v.as_bool()).unwrap_or(false);
        if already_running && !force {
            debug!(workspace_id = workspace.id, "bind-mounted change, relying on dev-server file watcher");
            return;
        }

        send(tx, StreamEvent::DockerStarting { chat_id: chat.id, app_id: workspace.id }).await;
        if already_running {
            let _ = self.containerization.stop_container(workspace.id).await;
        }

        let lifecycle = self.containerization.lifecycle().clone();
        let handler = self.containerization.current_engine_handler().await;
        let port = match lifecycle.allocate_port(workspace.id, false, handler.as_ref()).await {
            Ok(port) => port,
            Err(e) => {
                send(tx, StreamEvent::DockerError { app_id: workspace.id, error: e.to_string() }).await;
                return;
            }
        };

        let result = self.containerization.run_container(workspace.id, &workspace.path, port, true, false).await;
        if !result.success {
            send(tx, StreamEvent::DockerError { app_id: workspace.id, error: result.error.unwrap_or(result.message) }).await;
            return;
        }

        let url = format!("http://localhost:{}", port);
        info!(workspace_id = workspace.id, port, "container restarted after stream");
        send(tx, StreamEvent::DockerStarted { chat_id: chat.id, app_id: workspace.id, port, url }).await;

        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let app_id = workspace.id;
        tokio::spawn(async move {
            if let Err(e) = handler.follow_container_logs(app_id, LOG_FOLLOW_WINDOW, log_tx).await {
                warn!(workspace_id = app_id, error = %e, "log follow failed to start");
            }
        });
        let tx_follow = tx.clone();
        tokio::spawn(forward_log_events(log_rx, tx_follow, app_id));
    }
}

/// Relays the engine's raw log/exit-code feed into the chat's SSE channel as
/// `docker:output`/`docker:closed` events, until the feed closes (window
/// elapsed or container exited) or the SSE receiver is gone.
async fn forward_log_events(mut rx: mpsc::UnboundedReceiver<ContainerLogEvent>, tx: mpsc::Sender<StreamEvent>, app_id: u64) {
    while let Some(event) = rx.recv().await {
        let mapped = match event {
            ContainerLogEvent::Output(output) => StreamEvent::DockerOutput { app_id, output },
            ContainerLogEvent::Closed(exit_code) => StreamEvent::DockerClosed { app_id, exit_code },
        };
        if tx.send(mapped).await.is_err() {
            break;
        }
    }
}

async fn send(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) {
    if tx.send(event).await.is_err() {
        debug!("stream receiver dropped, client likely disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContainerizationConfig, DockerConfig, EngineKind, LifecycleConfig, PodmanConfig, ResourceLimits};
    use crate::data::{FixtureModelProvider, InMemoryChatRepository, InMemoryWorkspaceRepository};
    use crate::lifecycle::Lifecycle;
    use tempfile::TempDir;

    fn disabled_containerization() -> Arc<ContainerizationService> {
        let config = ContainerizationConfig {
            enabled: false,
            engine: EngineKind::Docker,
            docker: DockerConfig { image: "node:20".into(), default_port: 32100 },
            podman: PodmanConfig { image: "node:20".into(), default_port: 32100 },
            limits: ResourceLimits::default(),
            auto_kill_port: false,
        };
        Arc::new(ContainerizationService::new(config, Arc::new(Lifecycle::new(LifecycleConfig::default()))))
    }

    async fn seeded(temp: &TempDir) -> (Arc<InMemoryWorkspaceRepository>, Arc<InMemoryChatRepository>) {
        let workspaces = Arc::new(InMemoryWorkspaceRepository::new());
        workspaces.insert(Workspace {
            id: 1,
            name: "demo".into(),
            path: temp.path().to_string_lossy().to_string(),
            owner_id: 1,
            install_command: None,
            start_command: None,
        });
        let chats = Arc::new(InMemoryChatRepository::new());
        chats.insert_chat(Chat { id: 1, workspace_id: 1, messages: vec![] });
        (workspaces, chats)
    }

    #[tokio::test]
    async fn write_tag_round_trips_into_changed_files_event() {
        let temp = TempDir::new().unwrap();
        let (workspaces, chats) = seeded(&temp).await;
        let model = Arc::new(FixtureModelProvider::writing_file("src/index.html", "hello"));
        let processor = StreamProcessor::new(workspaces, chats, model, disabled_containerization());

        let mut events = processor.start(ChatStreamRequest {
            chat_id: 1,
            prompt: Some("write src/index.html".into()),
            ..Default::default()
        });

        let mut complete = None;
        while let Some(event) = events.next().await {
            if let StreamEvent::ChatComplete { changed_files, .. } = &event {
                complete = Some(changed_files.clone());
            }
        }
        assert_eq!(complete, Some(vec!["src/index.html".to_string()]));
        assert!(temp.path().join("src/index.html").exists());
    }

    #[tokio::test]
    async fn cancel_mid_stream_emits_terminal_chat_error_and_applies_no_writes() {
        let temp = TempDir::new().unwrap();
        let (workspaces, chats) = seeded(&temp).await;
        let model = Arc::new(FixtureModelProvider::writing_file("never.txt", "nope"));
        let processor = StreamProcessor::new(workspaces, chats, model, disabled_containerization());

        // Drive `run_inner` directly with a token canceled up front, rather
        // than racing the real registry against a spawned task.
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let request = ChatStreamRequest { chat_id: 1, prompt: Some("hi".into()), ..Default::default() };
        let result = processor.run_inner(request, &tx, &token).await;
        drop(tx);

        assert!(matches!(result, Err(StreamError::Canceled)));
        let mut saw_terminal_error = false;
        while let Some(event) = rx.recv().await {
            if matches!(event, StreamEvent::ChatError { ref error, .. } if error == "canceled") {
                saw_terminal_error = true;
            }
        }
        assert!(saw_terminal_error);
        assert!(!temp.path().join("never.txt").exists());
    }

    #[tokio::test]
    async fn log_follow_events_map_onto_docker_output_and_closed() {
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        log_tx.send(ContainerLogEvent::Output("Local: http://localhost:32100".into())).unwrap();
        log_tx.send(ContainerLogEvent::Closed(1)).unwrap();
        drop(log_tx);

        forward_log_events(log_rx, tx, 7).await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(&events[0], StreamEvent::DockerOutput { app_id: 7, output } if output.contains("Local:")));
        assert!(matches!(events[1], StreamEvent::DockerClosed { app_id: 7, exit_code: 1 }));
    }

    #[tokio::test]
    async fn unknown_chat_emits_chat_error() {
        let temp = TempDir::new().unwrap();
        let (workspaces, chats) = seeded(&temp).await;
        let model = Arc::new(FixtureModelProvider::new(vec![]));
        let processor = StreamProcessor::new(workspaces, chats, model, disabled_containerization());

        let mut events = processor.start(ChatStreamRequest { chat_id: 999, prompt: Some("hi".into()), ..Default::default() });
        let mut saw_error = false;
        while let Some(event) = events.next().await {
            if matches!(event, StreamEvent::ChatError { .. }) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }
}
