//! Container types and typed creation configuration.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::error::{ContainerError, ContainerResult};

/// Typed configuration for creating a sandbox container.
///
/// Every field is named and defaulted; validation runs before any runtime
/// call so malformed input never reaches the container daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSpec {
    /// Docker/OCI image to run.
    pub image: String,
    /// Container name (generated when empty).
    pub name: Option<String>,
    /// Memory limit in megabytes.
    pub memory_limit_mb: u64,
    /// Relative CPU shares.
    pub cpu_shares: u64,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Labels attached to the container.
    pub labels: HashMap<String, String>,
    /// Host port published to the container's SSH daemon (22/tcp).
    pub ssh_host_port: u16,
}

impl Default for ContainerSpec {
    fn default() -> Self {
        Self {
            image: "warren-sandbox:latest".to_string(),
            name: None,
            memory_limit_mb: 512,
            cpu_shares: 512,
            env: HashMap::new(),
            labels: HashMap::new(),
            ssh_host_port: 0,
        }
    }
}

impl ContainerSpec {
    /// Create a spec for the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Set the container name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the memory limit in megabytes.
    pub fn memory_limit_mb(mut self, limit: u64) -> Self {
        self.memory_limit_mb = limit;
        self
    }

    /// Set the CPU shares.
    pub fn cpu_shares(mut self, shares: u64) -> Self {
        self.cpu_shares = shares;
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set the published SSH host port.
    pub fn ssh_host_port(mut self, port: u16) -> Self {
        self.ssh_host_port = port;
        self
    }

    /// Validate all fields before creating a container.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }

        for key in self.labels.keys() {
            validate_label_key(key)?;
        }

        if self.memory_limit_mb == 0 {
            return Err(ContainerError::InvalidInput(
                "memory limit must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Container state as reported by the runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ContainerState {
    /// Whether a container in this state can serve a lease.
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Removing => "removing",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Health status embedded in inspect output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Starting,
    #[default]
    #[serde(other)]
    None,
}

/// A container the pool or a session owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerHandle {
    /// Runtime-assigned container id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Profile (image/resource class) this container was created for.
    pub profile: String,
    /// Host reachable from the relay.
    pub host: String,
    /// Host port mapped to the container's SSH daemon.
    pub ssh_port: u16,
    /// When the container was created.
    pub created_at: DateTime<Utc>,
}

/// Container information from `ps`/`inspect` (docker and podman JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInfo {
    #[serde(alias = "Id", alias = "ID")]
    pub id: String,

    #[serde(default, deserialize_with = "deserialize_name_list")]
    pub names: Vec<String>,

    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub state: ContainerState,

    /// Status string (e.g., "Up 5 minutes").
    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub health: HealthState,

    #[serde(default, deserialize_with = "deserialize_labels")]
    pub labels: HashMap<String, String>,
}

impl ContainerInfo {
    /// Running and not reported unhealthy.
    pub fn is_healthy(&self) -> bool {
        self.state.is_running() && self.health != HealthState::Unhealthy
    }
}

/// One resource sample for a container (`stats --no-stream` JSON).
///
/// Docker and podman both emit percentages and usage as formatted strings;
/// the monitor parses them into numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerStatsSample {
    #[serde(alias = "ContainerID", alias = "Container")]
    pub container_id: String,

    #[serde(default, alias = "Name")]
    pub name: String,

    /// CPU percentage, e.g. "12.34%".
    #[serde(default, alias = "CPUPerc", alias = "CPU")]
    pub cpu_percent: String,

    /// Memory usage, e.g. "128MiB / 2GiB".
    #[serde(default, alias = "MemUsage")]
    pub mem_usage: String,

    /// Memory percentage, e.g. "6.25%".
    #[serde(default, alias = "MemPerc", alias = "Mem")]
    pub mem_percent: String,

    #[serde(default, alias = "PIDs")]
    pub pids: String,
}

// ============================================================================
// Flexible deserializers (docker emits strings where podman emits arrays/maps)
// ============================================================================

/// Names arrive as an array (podman) or a comma-separated string (docker ps).
pub(crate) fn deserialize_name_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct SeqOrString;

    impl<'de> Visitor<'de> for SeqOrString {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a sequence of strings")
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut names = Vec::new();
            while let Some(name) = seq.next_element::<String>()? {
                names.push(name);
            }
            Ok(names)
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value
                .split(',')
                .filter(|n| !n.is_empty())
                .map(|n| n.trim_start_matches('/').to_string())
                .collect())
        }
    }

    deserializer.deserialize_any(SeqOrString)
}

/// Labels arrive as a map (inspect, podman) or a "k=v,k=v" string (docker ps).
pub(crate) fn deserialize_labels<'de, D>(
    deserializer: D,
) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct MapOrString;

    impl<'de> Visitor<'de> for MapOrString {
        type Value = HashMap<String, String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a map or a comma-separated key=value string")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: de::MapAccess<'de>,
        {
            let mut out = HashMap::new();
            while let Some((key, value)) = map.next_entry::<String, Option<String>>()? {
                out.insert(key, value.unwrap_or_default());
            }
            Ok(out)
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let mut out = HashMap::new();
            for pair in value.split(',').filter(|p| !p.is_empty()) {
                let (key, val) = pair.split_once('=').unwrap_or((pair, ""));
                out.insert(key.to_string(), val.to_string());
            }
            Ok(out)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(HashMap::new())
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(HashMap::new())
        }
    }

    deserializer.deserialize_any(MapOrString)
}

// ============================================================================
// Validation
// ============================================================================

/// Validate a Docker/OCI image name: `[registry/][namespace/]name[:tag][@digest]`.
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '/'
            || c == ':'
            || c == '@'
    };
    if !image.chars().all(valid) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{image}' contains invalid characters"
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container name: alphanumeric plus hyphens/underscores, not
/// starting with a hyphen.
fn validate_container_name(name: &str) -> ContainerResult<()> {
    if name.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    }

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }

    let first = name.chars().next().unwrap();
    if !first.is_ascii_alphanumeric() && first != '_' {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    let valid = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{name}' contains invalid characters"
        )));
    }

    Ok(())
}

/// Validate an environment variable key (POSIX shape).
fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    if key.is_empty() {
        return Err(ContainerError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    }

    let first = key.chars().next().unwrap();
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{key}' must start with a letter or underscore"
        )));
    }

    let valid = |c: char| c.is_ascii_alphanumeric() || c == '_';
    if !key.chars().all(valid) {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{key}' contains invalid characters"
        )));
    }

    Ok(())
}

/// Validate a label key: reverse-DNS style, no shell metacharacters.
fn validate_label_key(key: &str) -> ContainerResult<()> {
    if key.is_empty() {
        return Err(ContainerError::InvalidInput(
            "label key cannot be empty".to_string(),
        ));
    }

    let valid = |c: char| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_';
    if !key.chars().all(valid) {
        return Err(ContainerError::InvalidInput(format!(
            "label key '{key}' contains invalid characters"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_image_name_valid() {
        assert!(validate_image_name("ubuntu").is_ok());
        assert!(validate_image_name("ubuntu:22.04").is_ok());
        assert!(validate_image_name("registry.io/warren/sandbox:v1").is_ok());
        assert!(validate_image_name("gcr.io/project/image@sha256:abc123").is_ok());
    }

    #[test]
    fn test_validate_image_name_invalid() {
        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("image with spaces").is_err());
        assert!(validate_image_name("image;rm -rf /").is_err());
        assert!(validate_image_name("../../../etc/passwd").is_err());
    }

    #[test]
    fn test_validate_container_name() {
        assert!(validate_container_name("warren-sandbox-1").is_ok());
        assert!(validate_container_name("_internal").is_ok());
        assert!(validate_container_name("-leading-dash").is_err());
        assert!(validate_container_name("has space").is_err());
        assert!(validate_container_name("$(whoami)").is_err());
    }

    #[test]
    fn test_validate_env_var_key() {
        assert!(validate_env_var_key("PATH").is_ok());
        assert!(validate_env_var_key("_PRIVATE").is_ok());
        assert!(validate_env_var_key("123VAR").is_err());
        assert!(validate_env_var_key("MY-VAR").is_err());
    }

    #[test]
    fn test_spec_validate() {
        let spec = ContainerSpec::new("ubuntu:22.04")
            .name("warren-abc123")
            .memory_limit_mb(256)
            .env("TERM", "xterm-256color")
            .label("warren.profile", "ssh-terminal");
        assert!(spec.validate().is_ok());

        let bad = ContainerSpec::new("bad image").name("ok");
        assert!(bad.validate().is_err());

        let zero_mem = ContainerSpec::new("ubuntu").memory_limit_mb(0);
        assert!(zero_mem.validate().is_err());
    }

    #[test]
    fn test_container_info_health() {
        let info = ContainerInfo {
            id: "abc".into(),
            names: vec!["warren-1".into()],
            image: "ubuntu".into(),
            state: ContainerState::Running,
            status: "Up 5 minutes".into(),
            health: HealthState::None,
            labels: HashMap::new(),
        };
        assert!(info.is_healthy());

        let unhealthy = ContainerInfo {
            health: HealthState::Unhealthy,
            ..info.clone()
        };
        assert!(!unhealthy.is_healthy());

        let exited = ContainerInfo {
            state: ContainerState::Exited,
            ..info
        };
        assert!(!exited.is_healthy());
    }

    #[test]
    fn test_stats_sample_aliases() {
        let docker = r#"{"Container":"abc","Name":"warren-1","CPUPerc":"1.50%","MemUsage":"64MiB / 1GiB","MemPerc":"6.25%","PIDs":"12"}"#;
        let sample: ContainerStatsSample = serde_json::from_str(docker).unwrap();
        assert_eq!(sample.container_id, "abc");
        assert_eq!(sample.cpu_percent, "1.50%");
    }
}
