//! Builds the serialized codebase block prepended to the first user message
//! (§4.6 step 3): walk the workspace, bias toward files recently mentioned
//! in chat history, and bound total size so the prompt stays sane.

use std::path::Path;

use crate::data::Message;

const MAX_FILES: usize = 200;
const MAX_FILE_BYTES: u64 = 64 * 1024;
const SKIP_DIRS: &[&str] = &["node_modules", ".git", "dist", "build", ".next"];

/// Collects workspace file contents, files referenced in `recent_messages`
/// first, into one text block suitable for prepending to a prompt.
pub fn build_codebase_context(workspace_path: &str, recent_messages: &[Message]) -> String {
    let root = Path::new(workspace_path);
    if !root.is_dir() {
        return String::new();
    }

    let mentioned = mentioned_paths(recent_messages);
    let mut files = list_workspace_files(root);

    // Smart-context filtering: files mentioned in recent messages sort first
    // so they survive the `MAX_FILES` cap even in a large workspace.
    files.sort_by_key(|p| !mentioned.iter().any(|m| p.contains(m.as_str())));
    files.truncate(MAX_FILES);

    let mut block = String::new();
    for relative in files {
        let full = root.join(&relative);
        let Ok(metadata) = std::fs::metadata(&full) else { continue };
        if metadata.len() > MAX_FILE_BYTES {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(&full) else { continue };
        block.push_str(&format!("--- {} ---\n{}\n\n", relative, content));
    }
    block
}

fn list_workspace_files(root: &Path) -> Vec<String> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| {
            e.file_name()
                .to_str()
                .map(|name| !SKIP_DIRS.contains(&name))
                .unwrap_or(true)
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(root)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect()
}

/// Inlines the content of any `{file:RELATIVE_PATH}` reference found in the
/// prompt (§4.6 step 1), appended after the prompt text itself.
pub fn inline_file_references(prompt: &str, workspace_path: &str) -> String {
    let root = Path::new(workspace_path);
    let mut inlined = String::new();
    let mut rest = prompt;
    while let Some(start) = rest.find("{file:") {
        let Some(end) = rest[start..].find('}') else { break };
        let path = &rest[start + 6..start + end];
        if let Ok(content) = std::fs::read_to_string(root.join(path)) {
            inlined.push_str(&format!("\n--- attachment {} ---\n{}\n", path, content));
        }
        rest = &rest[start + end + 1..];
    }
    if inlined.is_empty() {
        prompt.to_string()
    } else {
        format!("{}\n{}", prompt, inlined)
    }
}

/// Extracts path-shaped tokens (containing a `/` or a recognizable
/// extension) out of recent message content, newest first.
fn mentioned_paths(recent_messages: &[Message]) -> Vec<String> {
    let mut found = Vec::new();
    for message in recent_messages.iter().rev() {
        for token in message.content.split_whitespace() {
            let cleaned = token.trim_matches(|c: char| !c.is_alphanumeric() && c != '/' && c != '.' && c != '_' && c != '-');
            if cleaned.contains('/') && cleaned.contains('.') {
                found.push(cleaned.to_string());
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MessageRole;
    use tempfile::TempDir;

    fn msg(content: &str) -> Message {
        Message { id: 1, chat_id: 1, role: MessageRole::User, content: content.into(), model: None, streaming: false }
    }

    #[test]
    fn walks_workspace_and_skips_node_modules() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("package.json"), "{}").unwrap();
        std::fs::create_dir(temp.path().join("node_modules")).unwrap();
        std::fs::write(temp.path().join("node_modules/ignored.js"), "nope").unwrap();

        let block = build_codebase_context(temp.path().to_str().unwrap(), &[]);
        assert!(block.contains("package.json"));
        assert!(!block.contains("ignored.js"));
    }

    #[test]
    fn missing_workspace_path_yields_empty_context() {
        assert_eq!(build_codebase_context("/does/not/exist", &[]), "");
    }

    #[test]
    fn mentioned_paths_extracts_path_like_tokens() {
        let messages = vec![msg("please update src/index.html for me")];
        let found = mentioned_paths(&messages);
        assert_eq!(found, vec!["src/index.html".to_string()]);
    }

    #[test]
    fn inlines_referenced_file_attachment() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("notes.txt"), "todo list").unwrap();
        let prompt = "summarize {file:notes.txt} please";
        let result = inline_file_references(prompt, temp.path().to_str().unwrap());
        assert!(result.contains("todo list"));
        assert!(result.contains(prompt));
    }

    #[test]
    fn missing_attachment_is_skipped_silently() {
        let temp = TempDir::new().unwrap();
        let prompt = "summarize {file:missing.txt} please";
        let result = inline_file_references(prompt, temp.path().to_str().unwrap());
        assert_eq!(result, prompt);
    }
}
