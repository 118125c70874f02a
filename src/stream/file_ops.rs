//! Applies a stream's queued `FileOperation`s against a workspace (§4.6.1).
//!
//! Every path resolves through `SafePath` (I4); anything that would escape
//! the workspace root is a hard `PathViolation`. Individual operation
//! failures that are not path violations (missing rename source, missing
//! delete target, a `SearchReplace` whose `find` does not match exactly
//! once) fail softly: they are recorded as issues and do not abort the rest
//! of the batch.

use std::path::Path;

use tracing::{debug, warn};

use crate::data::FileOperation;
use crate::filesystem::SafePath;

use super::errors::{StreamError, StreamResult};

/// Outcome of applying one stream's pending operations.
#[derive(Debug, Default, Clone)]
pub struct ApplyOutcome {
    /// Paths touched by write/rename/delete/search-replace, for `chat:complete`.
    pub changed_files: Vec<String>,
    /// Soft failures (missing rename source, zero/multiple `SearchReplace`
    /// matches) that did not abort the batch.
    pub issues: Vec<String>,
    /// Packages named by `AddDependencies` tags, collected for §4.6.2.
    pub pending_dependencies: Vec<String>,
}

impl ApplyOutcome {
    pub fn package_json_changed(&self) -> bool {
        self.changed_files.iter().any(|p| p == "package.json")
    }
}

/// Applies `ops` in order, dependencies first per §4.6.1's stated ordering
/// rationale (so writes in the same cycle can import freshly-added packages).
pub async fn apply_operations(workspace_root: &Path, ops: &[FileOperation]) -> StreamResult<ApplyOutcome> {
    let mut outcome = ApplyOutcome::default();

    for op in ops {
        if let FileOperation::AddDependencies { packages } = op {
            outcome.pending_dependencies.extend(packages.iter().cloned());
        }
    }

    for op in ops {
        match op {
            FileOperation::AddDependencies { .. } => {} // handled above
            FileOperation::Write { path, content } => apply_write(workspace_root, path, content, &mut outcome).await?,
            FileOperation::Rename { from, to } => apply_rename(workspace_root, from, to, &mut outcome).await?,
            FileOperation::Delete { path } => apply_delete(workspace_root, path, &mut outcome).await?,
            FileOperation::SearchReplace { path, find, replace } => {
                apply_search_replace(workspace_root, path, find, replace, &mut outcome).await?
            }
        }
    }

    Ok(outcome)
}

async fn apply_write(root: &Path, path: &str, content: &str, outcome: &mut ApplyOutcome) -> StreamResult<()> {
    let target = SafePath::new(root, path)?;
    if let Some(parent) = target.resolved().parent() {
        tokio::fs::create_dir_all(parent).await.map_err(crate::filesystem::FilesystemError::from)?;
    }
    tokio::fs::write(target.resolved(), content).await.map_err(crate::filesystem::FilesystemError::from)?;
    debug!(path, bytes = content.len(), "applied write");
    outcome.changed_files.push(path.to_string());
    Ok(())
}

async fn apply_rename(root: &Path, from: &str, to: &str, outcome: &mut ApplyOutcome) -> StreamResult<()> {
    let source = SafePath::new(root, from)?;
    if !source.exists() {
        warn!(from, "rename source missing, skipping");
        outcome.issues.push(format!("rename source not found: {}", from));
        return Ok(());
    }
    let dest = SafePath::new(root, to)?;
    if let Some(parent) = dest.resolved().parent() {
        tokio::fs::create_dir_all(parent).await.map_err(crate::filesystem::FilesystemError::from)?;
    }
    tokio::fs::rename(source.resolved(), dest.resolved()).await.map_err(crate::filesystem::FilesystemError::from)?;
    debug!(from, to, "applied rename");
    outcome.changed_files.push(from.to_string());
    outcome.changed_files.push(to.to_string());
    Ok(())
}

async fn apply_delete(root: &Path, path: &str, outcome: &mut ApplyOutcome) -> StreamResult<()> {
    let target = SafePath::new(root, path)?;
    if !target.exists() {
        warn!(path, "delete target missing, skipping");
        outcome.issues.push(format!("delete target not found: {}", path));
        return Ok(());
    }
    tokio::fs::remove_file(target.resolved()).await.map_err(crate::filesystem::FilesystemError::from)?;
    debug!(path, "applied delete");
    outcome.changed_files.push(path.to_string());
    Ok(())
}

/// Enforces single-occurrence `find` per the firm reading of §9's open
/// question ("the spec mandates single-occurrence for safety"): zero or
/// more than one match is recorded as an issue rather than guessed at.
async fn apply_search_replace(
    root: &Path,
    path: &str,
    find: &str,
    replace: &str,
    outcome: &mut ApplyOutcome,
) -> StreamResult<()> {
    let target = SafePath::new(root, path)?;
    if !target.exists() {
        outcome.issues.push(format!("search-replace target not found: {}", path));
        return Ok(());
    }
    let content = tokio::fs::read_to_string(target.resolved()).await.map_err(crate::filesystem::FilesystemError::from)?;
    let occurrences = content.matches(find).count();
    if occurrences != 1 {
        outcome
            .issues
            .push(format!("search-replace found {} occurrences in {} (expected exactly 1)", occurrences, path));
        return Ok(());
    }
    let updated = content.replacen(find, replace, 1);
    tokio::fs::write(target.resolved(), updated).await.map_err(crate::filesystem::FilesystemError::from)?;
    debug!(path, "applied search-replace");
    outcome.changed_files.push(path.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_creates_parent_directories() {
        let temp = TempDir::new().unwrap();
        let ops = vec![FileOperation::Write { path: "src/index.html".into(), content: "hello".into() }];
        let outcome = apply_operations(temp.path(), &ops).await.unwrap();
        assert_eq!(outcome.changed_files, vec!["src/index.html"]);
        let written = tokio::fs::read_to_string(temp.path().join("src/index.html")).await.unwrap();
        assert_eq!(written, "hello");
    }

    #[tokio::test]
    async fn delete_missing_target_is_a_soft_issue() {
        let temp = TempDir::new().unwrap();
        let ops = vec![FileOperation::Delete { path: "nope.txt".into() }];
        let outcome = apply_operations(temp.path(), &ops).await.unwrap();
        assert!(outcome.changed_files.is_empty());
        assert_eq!(outcome.issues.len(), 1);
    }

    #[tokio::test]
    async fn search_replace_requires_exactly_one_occurrence() {
        let temp = TempDir::new().unwrap();
        tokio::fs::write(temp.path().join("a.txt"), "foo foo").await.unwrap();
        let ops = vec![FileOperation::SearchReplace { path: "a.txt".into(), find: "foo".into(), replace: "bar".into() }];
        let outcome = apply_operations(temp.path(), &ops).await.unwrap();
        assert!(outcome.changed_files.is_empty());
        assert_eq!(outcome.issues.len(), 1);
        let unchanged = tokio::fs::read_to_string(temp.path().join("a.txt")).await.unwrap();
        assert_eq!(unchanged, "foo foo");
    }

    #[tokio::test]
    async fn search_replace_applies_single_match() {
        let temp = TempDir::new().unwrap();
        tokio::fs::write(temp.path().join("a.txt"), "foo bar").await.unwrap();
        let ops = vec![FileOperation::SearchReplace { path: "a.txt".into(), find: "foo".into(), replace: "baz".into() }];
        let outcome = apply_operations(temp.path(), &ops).await.unwrap();
        assert_eq!(outcome.changed_files, vec!["a.txt"]);
        let updated = tokio::fs::read_to_string(temp.path().join("a.txt")).await.unwrap();
        assert_eq!(updated, "baz bar");
    }

    #[tokio::test]
    async fn path_traversal_is_rejected() {
        let temp = TempDir::new().unwrap();
        let ops = vec![FileOperation::Write { path: "../escape.txt".into(), content: "x".into() }];
        let result = apply_operations(temp.path(), &ops).await;
        assert!(matches!(result, Err(StreamError::Filesystem(crate::filesystem::FilesystemError::PathTraversal))));
    }

    #[tokio::test]
    async fn add_dependencies_collected_without_touching_filesystem() {
        let temp = TempDir::new().unwrap();
        let ops = vec![FileOperation::AddDependencies { packages: vec!["left-pad".into()] }];
        let outcome = apply_operations(temp.path(), &ops).await.unwrap();
        assert_eq!(outcome.pending_dependencies, vec!["left-pad"]);
        assert!(outcome.changed_files.is_empty());
    }
}
