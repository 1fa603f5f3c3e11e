//! Container runtime seam
//!
//! The lifecycle manager never talks to docker directly; it goes through
//! [`ContainerRuntime`]. [`CliRuntime`] drives the `docker` or `podman` CLI.

use async_trait::async_trait;
use clnrm_common::{Error, ResourceUsage, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Command;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;

/// Label put on every container clnrm creates
pub const MANAGED_LABEL: &str = "clnrm.managed";

/// Container CLI flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Podman,
}

impl RuntimeKind {
    /// Detect available container runtime
    pub fn detect() -> Option<Self> {
        // Check podman first (rootless friendly)
        if Command::new("podman").arg("--version").output().is_ok() {
            return Some(Self::Podman);
        }
        if Command::new("docker").arg("--version").output().is_ok() {
            return Some(Self::Docker);
        }
        None
    }

    pub fn from_binary(binary: &str) -> Self {
        if binary.ends_with("podman") {
            Self::Podman
        } else {
            Self::Docker
        }
    }

    /// Get the CLI command name
    pub fn command(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }

    /// Variable the CLI reads its daemon socket from
    fn socket_var(&self) -> &'static str {
        match self {
            Self::Docker => "DOCKER_HOST",
            Self::Podman => "CONTAINER_HOST",
        }
    }
}

/// What to create
#[derive(Debug, Clone, Default)]
pub struct ContainerRequest {
    /// Logical service name, used for the container name prefix
    pub service: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    /// Container ports to publish on ephemeral host ports
    pub ports: Vec<u16>,
    pub labels: Vec<(String, String)>,
}

/// A created, running container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    /// Container port -> published host port
    pub ports: BTreeMap<u16, u16>,
}

/// A container carrying the clnrm label, as listed by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
}

/// Operations the lifecycle manager needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Check the runtime daemon is reachable
    async fn ping(&self) -> Result<()>;

    /// Create and start a container, returning once it is running
    async fn create(&self, request: &ContainerRequest) -> Result<ContainerHandle>;

    /// Command that runs `argv` inside the container when spawned
    fn exec_command(
        &self,
        container_id: &str,
        argv: &[String],
        env: &[(String, String)],
    ) -> AsyncCommand;

    /// Force-remove a container
    async fn remove(&self, container_id: &str) -> Result<()>;

    /// Current usage, None when the runtime cannot tell
    async fn stats(&self, container_id: &str) -> Option<ResourceUsage>;

    /// Containers created by clnrm that still exist
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>> {
        Ok(Vec::new())
    }
}

/// Runtime backed by the docker/podman CLI
pub struct CliRuntime {
    kind: RuntimeKind,
    binary: String,
    socket: Option<String>,
}

impl CliRuntime {
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let (kind, binary) = match &config.binary {
            Some(binary) => (RuntimeKind::from_binary(binary), binary.clone()),
            None => {
                let kind = RuntimeKind::detect().ok_or_else(|| {
                    Error::infrastructure("no container runtime found (tried podman, docker)")
                })?;
                (kind, kind.command().to_string())
            }
        };

        info!("Using container runtime {} ({})", binary, kind.command());
        Ok(Self {
            kind,
            binary,
            socket: config.socket.clone(),
        })
    }

    /// Plain `docker` without detection; every call fails if it is missing
    pub fn fallback(config: &RuntimeConfig) -> Self {
        Self {
            kind: RuntimeKind::Docker,
            binary: RuntimeKind::Docker.command().to_string(),
            socket: config.socket.clone(),
        }
    }

    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    fn command(&self) -> AsyncCommand {
        let mut cmd = AsyncCommand::new(&self.binary);
        if let Some(socket) = &self.socket {
            cmd.env(self.kind.socket_var(), socket);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run a CLI command to completion and return its stdout
    ///
    /// A CLI that cannot be spawned or cannot reach its daemon is
    /// `Infrastructure`; any other non-zero exit is `Runtime`.
    async fn output(&self, args: &[&str]) -> Result<String> {
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .map_err(|e| Error::infrastructure(format!("{} {}: {}", self.binary, args[0], e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = format!("{} {} failed: {}", self.binary, args[0], stderr.trim());
            if daemon_unreachable(&stderr) {
                return Err(Error::infrastructure(message));
            }
            return Err(Error::Runtime(message));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn published_port(&self, container_id: &str, port: u16) -> Result<u16> {
        let out = self.output(&["port", container_id, &port.to_string()]).await?;
        parse_port_output(&out).ok_or_else(|| {
            Error::Runtime(format!(
                "container {} did not publish port {} ({})",
                short_id(container_id),
                port,
                out.trim()
            ))
        })
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    fn name(&self) -> &str {
        self.kind.command()
    }

    async fn ping(&self) -> Result<()> {
        match self.output(&["version", "--format", "{{.Server.Version}}"]).await {
            Ok(_) => Ok(()),
            Err(Error::Runtime(message)) => Err(Error::Infrastructure(message)),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, request: &ContainerRequest) -> Result<ContainerHandle> {
        let name = format!(
            "clnrm-{}-{}",
            request.service,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name,
            "--label".into(),
            format!("{}=true", MANAGED_LABEL),
        ];
        for (key, value) in &request.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &request.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        for port in &request.ports {
            args.push("-p".into());
            args.push(format!("127.0.0.1::{}", port));
        }
        args.push(request.image.clone());

        debug!("{} {}", self.binary, args.join(" "));
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.output(&arg_refs).await?.trim().to_string();
        if id.is_empty() {
            return Err(Error::Runtime(format!(
                "{} run returned no container id for {}",
                self.binary, request.image
            )));
        }

        let mut ports = BTreeMap::new();
        for port in &request.ports {
            match self.published_port(&id, *port).await {
                Ok(host_port) => {
                    ports.insert(*port, host_port);
                }
                Err(e) => {
                    // Do not leak the container we just made
                    let _ = self.remove(&id).await;
                    return Err(e);
                }
            }
        }

        info!(
            "Created container {} from {} for {}",
            short_id(&id),
            request.image,
            request.service
        );
        Ok(ContainerHandle { id, ports })
    }

    fn exec_command(
        &self,
        container_id: &str,
        argv: &[String],
        env: &[(String, String)],
    ) -> AsyncCommand {
        let mut cmd = self.command();
        cmd.arg("exec").arg("-i");
        for (key, value) in env {
            cmd.arg("-e").arg(format!("{}={}", key, value));
        }
        cmd.arg(container_id).args(argv);
        cmd
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.output(&["rm", "-f", container_id]).await?;
        debug!("Removed container {}", short_id(container_id));
        Ok(())
    }

    async fn stats(&self, container_id: &str) -> Option<ResourceUsage> {
        let out = match self
            .output(&["stats", "--no-stream", "--format", "{{json .}}", container_id])
            .await
        {
            Ok(out) => out,
            Err(e) => {
                warn!("stats unavailable for {}: {}", short_id(container_id), e);
                return None;
            }
        };

        out.lines()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| serde_json::from_str::<DockerStatsJson>(line).ok())
            .map(|stats| {
                ResourceUsage::new(
                    parse_percent(stats.CPUPerc.as_deref().unwrap_or("0")) / 100.0,
                    parse_size(
                        stats
                            .MemUsage
                            .as_deref()
                            .and_then(|m| m.split('/').next())
                            .unwrap_or("0"),
                    ) as f64
                        / (1024.0 * 1024.0),
                )
            })
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>> {
        let filter = format!("label={}=true", MANAGED_LABEL);
        let out = self
            .output(&["ps", "-a", "--filter", &filter, "--format", "{{json .}}"])
            .await?;
        Ok(out.lines().filter_map(parse_ps_line).collect())
    }
}

/// Client-side messages for a daemon that is down or unreachable
fn daemon_unreachable(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    [
        "cannot connect to the docker daemon",
        "is the docker daemon running",
        "cannot connect to podman",
        "error during connect",
    ]
    .iter()
    .any(|needle| stderr.contains(needle))
}

/// First 12 chars of a container id
pub fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

// Internal JSON parsing structs (Docker/Podman output)
#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct DockerStatsJson {
    CPUPerc: Option<String>,
    MemUsage: Option<String>,
}

/// Parse `docker port` output such as `127.0.0.1:49153` (possibly several lines)
fn parse_port_output(out: &str) -> Option<u16> {
    out.lines()
        .filter_map(|line| line.trim().rsplit(':').next())
        .find_map(|port| port.trim().parse().ok())
}

/// One `ps --format '{{json .}}'` line; docker gives `Names` as a string,
/// podman as an array
fn parse_ps_line(line: &str) -> Option<ManagedContainer> {
    let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    let text = |key: &str| match value.get(key) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(","),
        _ => String::new(),
    };

    let id = match text("ID") {
        id if id.is_empty() => text("Id"),
        id => id,
    };
    if id.is_empty() {
        return None;
    }
    let status = match text("Status") {
        status if status.is_empty() => text("State"),
        status => status,
    };
    Some(ManagedContainer {
        id: short_id(&id).to_string(),
        name: text("Names"),
        image: text("Image"),
        status,
    })
}

fn parse_percent(s: &str) -> f64 {
    s.trim().trim_end_matches('%').trim().parse().unwrap_or(0.0)
}

/// Parse human-readable size to bytes
fn parse_size(s: &str) -> i64 {
    let s = s.trim().to_uppercase();
    let re = regex::Regex::new(r"([0-9.]+)\s*([KMGT]?I?B?)").ok();
    if let Some(re) = re {
        if let Some(caps) = re.captures(&s) {
            let num: f64 = caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0.0);
            let unit = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            let multiplier: f64 = match unit.replace('I', "").as_str() {
                "KB" | "K" => 1024.0,
                "MB" | "M" => 1024.0 * 1024.0,
                "GB" | "G" => 1024.0 * 1024.0 * 1024.0,
                "TB" | "T" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
                _ => 1.0,
            };
            return (num * multiplier) as i64;
        }
    }
    0
}
