//! C2: shared helpers every concrete handler builds on — running the engine
//! CLI as a child process with captured output and a deadline, polling until
//! a condition holds, and a stubbable `CommandRunner` seam so handler tests
//! don't need a real `docker`/`podman` binary (§10.4).

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;

use super::traits::{EngineError, EngineResult};

/// Captured output of one CLI invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

/// The boundary the engine handlers invoke the CLI through. Production code
/// uses `TokioCommandRunner`; tests substitute a stub that returns canned
/// output without shelling out.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, binary: &str, args: &[String], deadline: Duration) -> EngineResult<CommandOutput>;

    /// Non-throwing probe that `binary` resolves and responds, bounded by
    /// `deadline`.
    async fn binary_available(&self, binary: &str, deadline: Duration) -> bool {
        self.run(binary, &["--version".to_string()], deadline)
            .await
            .map(|o| o.success())
            .unwrap_or(false)
    }
}

/// Runs the engine CLI as a real child process via `tokio::process::Command`.
#[derive(Debug, Default, Clone)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, binary: &str, args: &[String], deadline: Duration) -> EngineResult<CommandOutput> {
        let mut command = Command::new(binary);
        command.args(args);
        command.kill_on_drop(true);

        let fut = command.output();
        let output = match timeout(deadline, fut).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(EngineError::Io(e)),
            Err(_) => return Err(EngineError::Timeout(deadline)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            warn!(binary, code = output.status.code(), stderr = %stderr.trim(), "engine CLI invocation failed");
        }

        Ok(CommandOutput {
            status_code: output.status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

/// The default per-invocation deadline (§5: "engine CLI <= 30s").
pub const DEFAULT_COMMAND_DEADLINE: Duration = Duration::from_secs(30);

/// Polls `check` until it returns `true`, `timeout` elapses, or it errors.
/// Used for readiness polling (overall budget ~60s, §4.1) and for port
/// availability probing.
pub async fn wait_for_condition<F, Fut>(
    mut check: F,
    overall_timeout: Duration,
    poll_interval: Duration,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + overall_timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn wait_for_condition_returns_true_once_satisfied() {
        let calls = AtomicU32::new(0);
        let ok = wait_for_condition(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                n >= 2
            },
            Duration::from_millis(200),
            Duration::from_millis(5),
        )
        .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn wait_for_condition_times_out() {
        let ok = wait_for_condition(
            || async { false },
            Duration::from_millis(30),
            Duration::from_millis(5),
        )
        .await;
        assert!(!ok);
    }

    struct StubRunner {
        output: CommandOutput,
    }

    #[async_trait]
    impl CommandRunner for StubRunner {
        async fn run(&self, _binary: &str, _args: &[String], _deadline: Duration) -> EngineResult<CommandOutput> {
            Ok(self.output.clone())
        }
    }

    #[tokio::test]
    async fn binary_available_follows_exit_code() {
        let runner = StubRunner {
            output: CommandOutput {
                status_code: 0,
                stdout: "Docker version 24.0.0".into(),
                stderr: String::new(),
            },
        };
        assert!(runner.binary_available("docker", Duration::from_secs(1)).await);

        let runner = StubRunner {
            output: CommandOutput {
                status_code: 127,
                stdout: String::new(),
                stderr: "not found".into(),
            },
        };
        assert!(!runner.binary_available("docker", Duration::from_secs(1)).await);
    }
}
