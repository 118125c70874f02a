//! C2 continued: the handler body shared by Docker and Podman. The two
//! concrete handlers (`docker.rs`, `podman.rs`) are thin wrappers around this
//! struct, differing only in binary name, bind-mount suffix, and rootless
//! defaults (§4.1).

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::command::{wait_for_condition, CommandOutput, CommandRunner, DEFAULT_COMMAND_DEADLINE};
use super::startup_script::{detect_package_manager, generate_startup_script};
use super::traits::{
    ContainerLogEvent, ContainerStatus, DiscoveredContainer, EngineError, EngineResult, ExecResult,
    RunContainerOptions, RunContainerResult,
};

const READY_MARKERS: &[&str] = &["Local:", "ready in", "ready on", "started server on", "webpack compiled"];

pub struct AbstractHandler<R: CommandRunner> {
    pub binary: String,
    pub runner: R,
    /// Appended to the bind-mount spec; Podman uses `:Z` for SELinux labeling.
    pub mount_suffix: String,
    /// Extra `docker run` flags appended verbatim (e.g. Podman's `--userns=keep-id`).
    pub extra_run_flags: Vec<String>,
}

impl<R: CommandRunner> AbstractHandler<R> {
    pub fn container_name(&self, workspace_id: u64) -> String {
        format!("dyad-app-{}", workspace_id)
    }

    pub fn volume_name(&self, workspace_id: u64) -> String {
        format!("dyad-app-{}-data", workspace_id)
    }

    async fn run(&self, args: Vec<String>) -> EngineResult<CommandOutput> {
        self.runner.run(&self.binary, &args, DEFAULT_COMMAND_DEADLINE).await
    }

    pub async fn initialize(&self) -> EngineResult<()> {
        if self.is_available().await {
            Ok(())
        } else {
            Err(EngineError::Unavailable(self.binary.clone()))
        }
    }

    pub async fn is_available(&self) -> bool {
        self.runner
            .binary_available(&self.binary, Duration::from_secs(2))
            .await
    }

    pub async fn version(&self) -> EngineResult<String> {
        let out = self.run(vec!["--version".into()]).await?;
        Ok(out.stdout.trim().to_string())
    }

    async fn inspect(&self, name: &str) -> EngineResult<Option<serde_json::Value>> {
        let out = self
            .run(vec!["inspect".into(), name.to_string()])
            .await?;
        if !out.success() {
            return Ok(None);
        }
        let parsed: serde_json::Value = serde_json::from_str(&out.stdout)
            .map_err(|e| EngineError::MalformedOutput(e.to_string()))?;
        Ok(parsed.as_array().and_then(|a| a.first().cloned()))
    }

    pub async fn container_exists(&self, workspace_id: u64) -> EngineResult<bool> {
        Ok(self.inspect(&self.container_name(workspace_id)).await?.is_some())
    }

    pub async fn is_container_running(&self, workspace_id: u64) -> EngineResult<bool> {
        let Some(info) = self.inspect(&self.container_name(workspace_id)).await? else {
            return Ok(false);
        };
        Ok(info
            .pointer("/State/Running")
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    pub async fn get_container_status(&self, workspace_id: u64) -> EngineResult<ContainerStatus> {
        let name = self.container_name(workspace_id);
        let Some(info) = self.inspect(&name).await? else {
            return Ok(ContainerStatus {
                status: "absent".into(),
                ..Default::default()
            });
        };

        let is_running = info
            .pointer("/State/Running")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let status = info
            .pointer("/State/Status")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let port = parse_published_port(&info);

        let is_ready = if is_running {
            match port {
                Some(p) => self.is_container_ready(workspace_id, p).await.unwrap_or(false),
                None => false,
            }
        } else {
            false
        };

        let has_dependencies_installed = if is_running {
            self.has_dependencies_installed(workspace_id).await.unwrap_or(false)
        } else {
            false
        };

        Ok(ContainerStatus {
            is_running,
            is_ready,
            has_dependencies_installed,
            container_name: Some(name),
            port,
            status,
        })
    }

    pub async fn is_container_ready(&self, workspace_id: u64, port: u16) -> EngineResult<bool> {
        let logs = self.get_container_logs(workspace_id, Some(200)).await.unwrap_or_default();
        if READY_MARKERS.iter().any(|m| logs.contains(m)) {
            return Ok(true);
        }
        let connect = timeout(Duration::from_millis(500), TcpStream::connect(("127.0.0.1", port))).await;
        Ok(matches!(connect, Ok(Ok(_))))
    }

    pub async fn has_dependencies_installed(&self, workspace_id: u64) -> EngineResult<bool> {
        let result = self
            .exec_in_container(workspace_id, &["test".into(), "-d".into(), "/app/node_modules".into()])
            .await?;
        Ok(result.exit_code == 0)
    }

    pub async fn sync_files_to_container(&self, workspace_id: u64, file_paths: &[String]) -> EngineResult<()> {
        debug!(workspace_id, count = file_paths.len(), "bind-mounted workspace, no copy-in needed");
        Ok(())
    }

    pub async fn exec_in_container(&self, workspace_id: u64, argv: &[String]) -> EngineResult<ExecResult> {
        let mut args = vec!["exec".to_string(), self.container_name(workspace_id)];
        args.extend(argv.iter().cloned());
        let out = self.run(args).await?;
        Ok(ExecResult {
            exit_code: out.status_code,
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    pub async fn get_container_logs(&self, workspace_id: u64, lines: Option<u32>) -> EngineResult<String> {
        let mut args = vec!["logs".to_string()];
        args.push("--tail".into());
        args.push(lines.unwrap_or(200).to_string());
        args.push(self.container_name(workspace_id));
        let out = self.run(args).await?;
        Ok(format!("{}{}", out.stdout, out.stderr))
    }

    /// Spawns `<binary> logs -f` directly rather than going through
    /// `CommandRunner` (whose `run` waits for full process exit and so can
    /// never model a live tail), plus a concurrent `<binary> wait` to learn
    /// the container's real exit code if it closes inside `window`.
    pub async fn follow_container_logs(
        &self,
        workspace_id: u64,
        window: Duration,
        tx: mpsc::UnboundedSender<ContainerLogEvent>,
    ) -> EngineResult<()> {
        let name = self.container_name(workspace_id);

        let mut logs_child = Command::new(&self.binary)
            .args(["logs", "-f", "--tail", "0", name.as_str()])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(EngineError::Io)?;

        if let Some(stdout) = logs_child.stdout.take() {
            let tx = tx.clone();
            tokio::spawn(forward_lines(stdout, tx));
        }
        if let Some(stderr) = logs_child.stderr.take() {
            let tx = tx.clone();
            tokio::spawn(forward_lines(stderr, tx));
        }

        let mut wait_cmd = Command::new(&self.binary);
        wait_cmd.args(["wait", name.as_str()]);

        let exit_code = tokio::select! {
            biased;
            output = wait_cmd.output() => output.ok().and_then(|o| String::from_utf8_lossy(&o.stdout).trim().parse::<i32>().ok()),
            _ = tokio::time::sleep(window) => {
                debug!(workspace_id, "log follow window elapsed, container still running");
                None
            }
        };

        let _ = logs_child.start_kill();
        let _ = logs_child.wait().await;

        if let Some(code) = exit_code {
            let _ = tx.send(ContainerLogEvent::Closed(code));
        }
        Ok(())
    }

    pub async fn stop_container(&self, workspace_id: u64) -> EngineResult<()> {
        let name = self.container_name(workspace_id);
        if self.inspect(&name).await?.is_none() {
            return Ok(());
        }
        self.run(vec!["stop".into(), name]).await?;
        Ok(())
    }

    pub async fn remove_container(&self, workspace_id: u64, force: bool) -> EngineResult<()> {
        let name = self.container_name(workspace_id);
        if self.inspect(&name).await?.is_none() {
            return Ok(());
        }
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".into());
        }
        args.push(name);
        self.run(args).await?;
        Ok(())
    }

    pub async fn cleanup_volumes(&self, workspace_id: u64) -> EngineResult<()> {
        let vol = self.volume_name(workspace_id);
        let _ = self.run(vec!["volume".into(), "rm".into(), vol]).await;
        Ok(())
    }

    async fn ensure_volume(&self, workspace_id: u64) -> EngineResult<()> {
        let vol = self.volume_name(workspace_id);
        let out = self.run(vec!["volume".into(), "inspect".into(), vol.clone()]).await?;
        if out.success() {
            return Ok(());
        }
        self.run(vec!["volume".into(), "create".into(), vol]).await?;
        Ok(())
    }

    pub async fn list_managed_ports(&self, exclude: Option<u64>) -> EngineResult<Vec<(u64, u16)>> {
        let out = self
            .run(vec![
                "ps".into(),
                "-a".into(),
                "--filter".into(),
                "name=dyad-app-".into(),
                "--format".into(),
                "{{.Names}}\t{{.Ports}}".into(),
            ])
            .await?;

        let mut result = Vec::new();
        for line in out.stdout.lines() {
            let Some((names, ports)) = line.split_once('\t') else { continue };
            let Some(wid) = parse_workspace_id(names) else { continue };
            if exclude == Some(wid) {
                continue;
            }
            if let Some(port) = parse_ports_column(ports) {
                result.push((wid, port));
            }
        }
        Ok(result)
    }

    pub async fn discover_containers(&self) -> EngineResult<Vec<DiscoveredContainer>> {
        let out = self
            .run(vec![
                "ps".into(),
                "-a".into(),
                "--filter".into(),
                "name=dyad-app-".into(),
                "--format".into(),
                "{{.Names}}\t{{.State}}\t{{.Ports}}".into(),
            ])
            .await?;

        let mut result = Vec::new();
        for line in out.stdout.lines() {
            let mut parts = line.splitn(3, '\t');
            let (Some(names), Some(state)) = (parts.next(), parts.next()) else { continue };
            let ports = parts.next().unwrap_or("");
            let Some(wid) = parse_workspace_id(names) else { continue };
            result.push(DiscoveredContainer {
                workspace_id: wid,
                is_running: state.trim().eq_ignore_ascii_case("running"),
                port: parse_ports_column(ports),
            });
        }
        Ok(result)
    }

    pub async fn container_stats(&self, workspace_id: u64) -> EngineResult<(f64, u64)> {
        let name = self.container_name(workspace_id);
        let out = self
            .run(vec![
                "stats".into(),
                "--no-stream".into(),
                "--format".into(),
                "{{.CPUPerc}}\t{{.NetIO}}".into(),
                name,
            ])
            .await?;
        let Some(line) = out.stdout.lines().next() else {
            return Err(EngineError::MalformedOutput("empty stats output".into()));
        };
        let Some((cpu, net)) = line.split_once('\t') else {
            return Err(EngineError::MalformedOutput(line.to_string()));
        };
        Ok((parse_cpu_percent(cpu), parse_net_io(net)))
    }

    pub async fn get_engine_info(&self) -> EngineResult<String> {
        let out = self.run(vec!["info".into(), "--format".into(), "{{json .}}".into()]).await?;
        Ok(out.stdout)
    }

    pub async fn run_container(&self, opts: RunContainerOptions) -> EngineResult<RunContainerResult> {
        let name = self.container_name(opts.workspace_id);
        self.ensure_volume(opts.workspace_id).await?;

        if !opts.force_recreate {
            if let Some(info) = self.inspect(&name).await? {
                let running = info.pointer("/State/Running").and_then(|v| v.as_bool()).unwrap_or(false);
                if running {
                    info!(workspace_id = opts.workspace_id, "container already running, no change");
                    return Ok(RunContainerResult {
                        container_name: name,
                        port: parse_published_port(&info).unwrap_or(opts.port),
                    });
                }
            }
        }

        for (wid, port) in self.list_managed_ports(Some(opts.workspace_id)).await? {
            if port == opts.port {
                if !opts.auto_kill_port {
                    return Err(EngineError::PortConflict(opts.port));
                }
                warn!(conflicting_workspace = wid, port = opts.port, "auto-killing conflicting container");
                self.remove_container(wid, true).await?;
            }
        }

        self.remove_container(opts.workspace_id, true).await?;

        let package_manager = detect_package_manager(&opts.workspace_path);
        let script = generate_startup_script(&opts.workspace_path, opts.port, package_manager, opts.skip_install);

        let mut args = vec![
            "run".to_string(),
            "-d".into(),
            "--name".into(),
            name.clone(),
            "-p".into(),
            format!("{}:{}", opts.port, opts.port),
            "-v".into(),
            format!("{}:/app{}", opts.workspace_path, self.mount_suffix),
            "-v".into(),
            format!("{}:/app/node_modules{}", self.volume_name(opts.workspace_id), self.mount_suffix),
            "-w".into(),
            "/app".into(),
            "-e".into(),
            format!("PORT={}", opts.port),
            "-e".into(),
            "HOST=0.0.0.0".into(),
            "-e".into(),
            "CHOKIDAR_USEPOLLING=true".into(),
        ];
        for (key, value) in &opts.env_vars {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        if let Some(cpu) = &opts.cpu_limit {
            args.push("--cpus".into());
            args.push(cpu.clone());
        }
        if let Some(mem) = &opts.memory_limit {
            args.push("-m".into());
            args.push(mem.clone());
        }
        args.extend(self.extra_run_flags.iter().cloned());
        args.push(opts.image.clone());
        args.push("sh".into());
        args.push("-c".into());
        args.push(script);

        let out = self.run(args).await?;
        if !out.success() {
            return Err(EngineError::CommandFailed(out.stderr));
        }

        let ready = wait_for_condition(
            || async {
                self.is_container_ready(opts.workspace_id, opts.port).await.unwrap_or(false)
            },
            Duration::from_secs(60),
            Duration::from_millis(500),
        )
        .await;

        if !ready {
            let tail = self.get_container_logs(opts.workspace_id, Some(50)).await.unwrap_or_default();
            return Err(EngineError::NotReady(tail));
        }

        Ok(RunContainerResult {
            container_name: name,
            port: opts.port,
        })
    }
}

async fn forward_lines(pipe: impl tokio::io::AsyncRead + Unpin, tx: mpsc::UnboundedSender<ContainerLogEvent>) {
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(ContainerLogEvent::Output(line)).is_err() {
                    break;
                }
            }
            _ => break,
        }
    }
}

fn parse_workspace_id(names: &str) -> Option<u64> {
    names.trim().strip_prefix("dyad-app-")?.parse().ok()
}

fn parse_published_port(info: &serde_json::Value) -> Option<u16> {
    let ports = info.pointer("/NetworkSettings/Ports")?.as_object()?;
    for bindings in ports.values() {
        if let Some(array) = bindings.as_array() {
            for binding in array {
                if let Some(host_port) = binding.get("HostPort").and_then(|v| v.as_str()) {
                    if let Ok(port) = host_port.parse() {
                        return Some(port);
                    }
                }
            }
        }
    }
    None
}

/// Parses the `docker ps` "Ports" column, e.g. `0.0.0.0:32100->32100/tcp`.
fn parse_ports_column(column: &str) -> Option<u16> {
    let first = column.split(',').next()?;
    let (host_part, _container_part) = first.split_once("->")?;
    let port_str = host_part.rsplit(':').next()?;
    port_str.trim().parse().ok()
}

/// Parses a `docker stats` CPUPerc cell like `12.34%`.
fn parse_cpu_percent(cell: &str) -> f64 {
    cell.trim().trim_end_matches('%').parse().unwrap_or(0.0)
}

/// Parses a `docker stats` NetIO cell like `648B / 1.2kB`, returning the sum
/// of both directions in bytes.
fn parse_net_io(cell: &str) -> u64 {
    cell.split('/').map(|part| parse_byte_size(part.trim())).sum()
}

fn parse_byte_size(text: &str) -> u64 {
    let text = text.trim();
    let split_at = text.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(text.len());
    let (number, unit) = text.split_at(split_at);
    let value: f64 = number.parse().unwrap_or(0.0);
    let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
        "b" => 1.0,
        "kb" | "kib" => 1024.0,
        "mb" | "mib" => 1024.0 * 1024.0,
        "gb" | "gib" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    (value * multiplier) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_workspace_id_from_container_name() {
        assert_eq!(parse_workspace_id("dyad-app-42"), Some(42));
        assert_eq!(parse_workspace_id("other-container"), None);
    }

    #[test]
    fn parses_ports_column() {
        assert_eq!(parse_ports_column("0.0.0.0:32100->32100/tcp"), Some(32100));
        assert_eq!(parse_ports_column("0.0.0.0:32100->32100/tcp, :::32100->32100/tcp"), Some(32100));
        assert_eq!(parse_ports_column(""), None);
    }

    #[test]
    fn parses_cpu_percent() {
        assert_eq!(parse_cpu_percent("12.34%"), 12.34);
        assert_eq!(parse_cpu_percent("0.00%"), 0.0);
    }

    #[test]
    fn parses_net_io_sums_both_directions() {
        assert_eq!(parse_net_io("1kB / 1kB"), 2048);
        assert_eq!(parse_net_io("648B / 0B"), 648);
        assert_eq!(parse_net_io("1MB / 1MB"), 2 * 1024 * 1024);
    }
}
