//! Container runtime client.
//!
//! Wraps the docker/podman CLI. Both runtimes emit JSON with slightly
//! different shapes (array vs. line-delimited, string vs. array names), so
//! the parsers here accept either.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use tokio::process::Command;

use super::container::{
    ContainerInfo, ContainerSpec, ContainerState, ContainerStatsSample, HealthState,
    deserialize_labels,
};
use super::error::{ContainerError, ContainerResult};

/// Supported container runtime binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    Docker,
    Podman,
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

/// The container runtime operations the core consumes.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create a container from a validated spec. Returns the runtime id.
    async fn create(&self, spec: &ContainerSpec) -> ContainerResult<String>;

    /// Start a created or stopped container.
    async fn start(&self, id: &str) -> ContainerResult<()>;

    /// Stop a running container, waiting up to `timeout_secs`.
    async fn stop(&self, id: &str, timeout_secs: u32) -> ContainerResult<()>;

    /// Remove a container.
    async fn remove(&self, id: &str, force: bool) -> ContainerResult<()>;

    /// Inspect one container. `None` when the runtime does not know the id.
    async fn inspect(&self, id: &str) -> ContainerResult<Option<ContainerInfo>>;

    /// List containers carrying the given label.
    async fn list(&self, label: &str) -> ContainerResult<Vec<ContainerInfo>>;

    /// One resource snapshot across all running containers.
    async fn stats(&self) -> ContainerResult<Vec<ContainerStatsSample>>;

    /// Run a shell command inside a running container, returning stdout.
    async fn exec(&self, id: &str, command: &str) -> ContainerResult<String>;

    /// Build an image from a context directory.
    async fn build_image(&self, context_dir: &Path, tag: &str) -> ContainerResult<()>;

    /// Check the runtime daemon is reachable.
    async fn ping(&self) -> ContainerResult<()>;

    /// Whether a container's published endpoint accepts connections yet.
    async fn probe_endpoint(&self, host: &str, port: u16) -> bool {
        tokio::net::TcpStream::connect((host, port)).await.is_ok()
    }
}

/// CLI-backed container runtime.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

impl ContainerRuntime {
    /// Auto-detect the runtime binary on PATH, preferring docker.
    pub fn new() -> Self {
        for (rt, bin) in [(RuntimeType::Docker, "docker"), (RuntimeType::Podman, "podman")] {
            if binary_on_path(bin) {
                return Self::with_type(rt);
            }
        }
        // Nothing found; commands will fail with RuntimeUnavailable.
        Self::with_type(RuntimeType::Docker)
    }

    /// Use a specific runtime type with its default binary name.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            runtime_type,
            binary: runtime_type.to_string(),
        }
    }

    /// Use a specific runtime type with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: String) -> Self {
        Self {
            runtime_type,
            binary,
        }
    }

    /// The detected/configured runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    async fn run(&self, args: &[&str]) -> ContainerResult<String> {
        debug!("{} {}", self.binary, args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ContainerError::RuntimeUnavailable(format!("{}: {e}", self.binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr.trim();
            if message.contains("No such container")
                || message.contains("no such container")
                || message.contains("no container with name or ID")
            {
                let id = args.last().copied().unwrap_or_default();
                return Err(ContainerError::NotFound(id.to_string()));
            }
            return Err(ContainerError::CommandFailed(format!(
                "{} {}: {}",
                self.binary,
                args.first().copied().unwrap_or_default(),
                message
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> ContainerResult<String> {
        spec.validate()?;

        let memory = format!("{}m", spec.memory_limit_mb);
        let cpu_shares = spec.cpu_shares.to_string();
        let publish = format!("{}:22", spec.ssh_host_port);

        let mut args: Vec<String> = vec![
            "create".into(),
            "--memory".into(),
            memory,
            "--cpu-shares".into(),
            cpu_shares,
            "--publish".into(),
            publish,
        ];

        if let Some(ref name) = spec.name {
            args.push("--name".into());
            args.push(name.clone());
        }
        for (key, value) in &spec.env {
            args.push("--env".into());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.run(&arg_refs).await?;

        let id = stdout.trim().lines().last().unwrap_or("").trim().to_string();
        if id.is_empty() {
            return Err(ContainerError::UnexpectedOutput(
                "create returned no container id".to_string(),
            ));
        }
        Ok(id)
    }

    async fn start(&self, id: &str) -> ContainerResult<()> {
        self.run(&["start", id]).await.map(|_| ())
    }

    async fn stop(&self, id: &str, timeout_secs: u32) -> ContainerResult<()> {
        let timeout = timeout_secs.to_string();
        self.run(&["stop", "--time", &timeout, id]).await.map(|_| ())
    }

    async fn remove(&self, id: &str, force: bool) -> ContainerResult<()> {
        if force {
            self.run(&["rm", "--force", id]).await.map(|_| ())
        } else {
            self.run(&["rm", id]).await.map(|_| ())
        }
    }

    async fn inspect(&self, id: &str) -> ContainerResult<Option<ContainerInfo>> {
        let stdout = match self.run(&["inspect", id]).await {
            Ok(out) => out,
            Err(ContainerError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let records: Vec<InspectRecord> = serde_json::from_str(stdout.trim())
            .map_err(|e| ContainerError::UnexpectedOutput(format!("inspect: {e}")))?;

        Ok(records.into_iter().next().map(InspectRecord::into_info))
    }

    async fn list(&self, label: &str) -> ContainerResult<Vec<ContainerInfo>> {
        let filter = format!("label={label}");
        let stdout = self
            .run(&["ps", "--all", "--filter", &filter, "--format", "json"])
            .await?;
        parse_json_rows(&stdout)
    }

    async fn stats(&self) -> ContainerResult<Vec<ContainerStatsSample>> {
        let stdout = self.run(&["stats", "--no-stream", "--format", "json"]).await?;
        parse_json_rows(&stdout)
    }

    async fn exec(&self, id: &str, command: &str) -> ContainerResult<String> {
        self.run(&["exec", id, "sh", "-lc", command]).await
    }

    async fn build_image(&self, context_dir: &Path, tag: &str) -> ContainerResult<()> {
        super::container::validate_image_name(tag)?;
        let context = context_dir.to_string_lossy();
        self.run(&["build", "--tag", tag, context.as_ref()]).await.map(|_| ())
    }

    async fn ping(&self) -> ContainerResult<()> {
        self.run(&["version", "--format", "json"]).await.map(|_| ())?;
        Ok(())
    }
}

/// Parse runtime JSON output that is either one array or one object per line.
fn parse_json_rows<T: serde::de::DeserializeOwned>(stdout: &str) -> ContainerResult<Vec<T>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map_err(|e| ContainerError::UnexpectedOutput(format!("json array: {e}")));
    }

    let mut rows = Vec::new();
    for line in trimmed.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(row) => rows.push(row),
            Err(e) => warn!("skipping unparsable runtime output line: {e}"),
        }
    }
    Ok(rows)
}

fn binary_on_path(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
}

// ============================================================================
// Inspect output (nested shape, unlike `ps`)
// ============================================================================

#[derive(Debug, Deserialize)]
struct InspectRecord {
    #[serde(alias = "Id", alias = "ID")]
    id: String,
    #[serde(default, alias = "Name")]
    name: String,
    #[serde(alias = "State")]
    state: InspectState,
    #[serde(default, alias = "Config")]
    config: Option<InspectConfig>,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(default, alias = "Status")]
    status: ContainerState,
    #[serde(default, alias = "Health")]
    health: Option<InspectHealth>,
}

#[derive(Debug, Deserialize)]
struct InspectHealth {
    #[serde(default, alias = "Status")]
    status: HealthState,
}

#[derive(Debug, Deserialize)]
struct InspectConfig {
    #[serde(default, alias = "Image")]
    image: String,
    #[serde(default, alias = "Labels", deserialize_with = "deserialize_labels")]
    labels: HashMap<String, String>,
}

impl InspectRecord {
    fn into_info(self) -> ContainerInfo {
        let (image, labels) = self
            .config
            .map(|c| (c.image, c.labels))
            .unwrap_or_default();
        ContainerInfo {
            id: self.id,
            names: vec![self.name.trim_start_matches('/').to_string()],
            image,
            state: self.state.status,
            status: self.state.status.to_string(),
            health: self
                .state
                .health
                .map(|h| h.status)
                .unwrap_or(HealthState::None),
            labels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_rows_array() {
        let out = r#"[{"Id":"a1","Names":["warren-1"],"Image":"ubuntu","State":"running","Status":"Up"}]"#;
        let rows: Vec<ContainerInfo> = parse_json_rows(out).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "a1");
        assert!(rows[0].state.is_running());
    }

    #[test]
    fn test_parse_json_rows_lines() {
        let out = "{\"ID\":\"a1\",\"Image\":\"ubuntu\",\"State\":\"running\"}\n{\"ID\":\"b2\",\"Image\":\"ubuntu\",\"State\":\"exited\"}\n";
        let rows: Vec<ContainerInfo> = parse_json_rows(out).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].id, "b2");
        assert_eq!(rows[1].state, ContainerState::Exited);
    }

    #[test]
    fn test_parse_json_rows_empty() {
        let rows: Vec<ContainerInfo> = parse_json_rows("  \n").unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_inspect_record_into_info() {
        let raw = r#"[{
            "Id": "deadbeef",
            "Name": "/warren-pool-1",
            "State": {"Status": "running", "Health": {"Status": "healthy"}},
            "Config": {"Image": "warren-sandbox:latest", "Labels": {"warren.profile": "ssh-terminal"}}
        }]"#;
        let records: Vec<InspectRecord> = serde_json::from_str(raw).unwrap();
        let info = records.into_iter().next().unwrap().into_info();
        assert_eq!(info.id, "deadbeef");
        assert_eq!(info.names[0], "warren-pool-1");
        assert!(info.is_healthy());
        assert_eq!(info.labels.get("warren.profile").unwrap(), "ssh-terminal");
    }

    #[test]
    fn test_docker_ps_row_string_fields() {
        let raw = r#"{"ID":"a1","Names":"warren-pool-1","Image":"ubuntu","State":"running","Labels":"warren.profile=ssh-terminal,io.x=1"}"#;
        let info: ContainerInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.names, vec!["warren-pool-1".to_string()]);
        assert_eq!(info.labels.get("warren.profile").unwrap(), "ssh-terminal");
    }
}
