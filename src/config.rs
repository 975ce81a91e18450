use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the shellbox daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub runtime: RuntimeConfig,
    pub terminal: TerminalConfig,
    pub limits: LimitsConfig,
    /// Closed catalog of supported workspace images. Workspace creation
    /// validates against this list; free-form image references are rejected.
    pub images: Vec<ImageSpec>,
    /// Catalog entry used when a create request does not name an image.
    pub default_image: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            runtime: RuntimeConfig::default(),
            terminal: TerminalConfig::default(),
            limits: LimitsConfig::default(),
            images: default_images(),
            default_image: "ubuntu".into(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.images.is_empty(), "images catalog must not be empty");
        for (i, image) in self.images.iter().enumerate() {
            anyhow::ensure!(!image.name.is_empty(), "images[{}].name must not be empty", i);
            anyhow::ensure!(
                !image.reference.is_empty(),
                "images[{}].reference must not be empty",
                i
            );
            anyhow::ensure!(
                !image.shell.is_empty(),
                "images[{}].shell must not be empty",
                i
            );
            anyhow::ensure!(
                self.images.iter().filter(|other| other.name == image.name).count() == 1,
                "duplicate image name in catalog: {}",
                image.name
            );
        }
        anyhow::ensure!(
            self.image(&self.default_image).is_some(),
            "default_image '{}' is not in the images catalog",
            self.default_image
        );
        anyhow::ensure!(self.server.port != 0, "server.port must not be 0");
        anyhow::ensure!(
            self.limits.max_workspaces >= 1,
            "limits.max_workspaces must be >= 1"
        );
        anyhow::ensure!(
            self.runtime.retry_attempts >= 1,
            "runtime.retry_attempts must be >= 1"
        );
        anyhow::ensure!(
            self.terminal.subscriber_buffer >= 1,
            "terminal.subscriber_buffer must be >= 1"
        );
        anyhow::ensure!(
            self.terminal.default_cols >= 1 && self.terminal.default_rows >= 1,
            "terminal.default_cols and terminal.default_rows must be >= 1"
        );
        Ok(())
    }

    /// Look up a catalog entry by name.
    pub fn image(&self, name: &str) -> Option<&ImageSpec> {
        self.images.iter().find(|i| i.name == name)
    }
}

/// One supported workspace image: a validated, closed configuration rather
/// than a free-form key-value map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSpec {
    /// Catalog name clients refer to (e.g. "python").
    pub name: String,
    /// Container image reference (e.g. "python:3.11").
    pub reference: String,
    /// Shell command spawned for terminal sessions.
    #[serde(default = "default_shell")]
    pub shell: Vec<String>,
    /// Memory limit applied at container creation.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    /// CPU limit applied at container creation.
    #[serde(default = "default_cpus")]
    pub cpus: u32,
}

fn default_shell() -> Vec<String> {
    vec!["/bin/bash".into()]
}

fn default_memory_mb() -> u32 {
    2048
}

fn default_cpus() -> u32 {
    2
}

fn default_images() -> Vec<ImageSpec> {
    vec![
        ImageSpec {
            name: "ubuntu".into(),
            reference: "ubuntu:24.04".into(),
            shell: default_shell(),
            memory_mb: default_memory_mb(),
            cpus: default_cpus(),
        },
        ImageSpec {
            name: "python".into(),
            reference: "python:3.11".into(),
            shell: default_shell(),
            memory_mb: default_memory_mb(),
            cpus: default_cpus(),
        },
        ImageSpec {
            name: "alpine".into(),
            reference: "alpine:3.20".into(),
            shell: vec!["/bin/sh".into()],
            memory_mb: 512,
            cpus: 1,
        },
    ]
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Admin token required on every API request when non-empty. Supplied as
    /// a bearer header, or a `token` query parameter for WebSocket upgrades.
    pub admin_token: String,
    /// Path of the JSON state file backing the workspace registry.
    pub state_file: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 7171,
            admin_token: String::new(),
            state_file: PathBuf::from("/var/lib/shellbox/state.json"),
        }
    }
}

/// Container engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Container engine binary ("docker" works for podman's docker shim too).
    pub engine_binary: String,
    /// Timeout for container creation, which may include an image pull.
    pub create_timeout_secs: u64,
    pub start_timeout_secs: u64,
    /// Grace period the engine gives the container before killing it on stop.
    pub stop_timeout_secs: u64,
    /// Bounded retry count for transient engine failures.
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            engine_binary: "docker".into(),
            create_timeout_secs: 120,
            start_timeout_secs: 30,
            stop_timeout_secs: 30,
            retry_attempts: 3,
            retry_base_delay_ms: 200,
        }
    }
}

impl RuntimeConfig {
    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Terminal session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub default_cols: u16,
    pub default_rows: u16,
    /// Per-subscriber output channel capacity, in chunks. Together with the
    /// adapter's attachment channel this bounds how much shell output can be
    /// in flight toward a slow client before the PTY read side stalls.
    pub subscriber_buffer: usize,
    /// How long an idle session (zero subscribers) survives before teardown.
    pub idle_grace_secs: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            default_cols: 80,
            default_rows: 24,
            subscriber_buffer: 32,
            idle_grace_secs: 30,
        }
    }
}

impl TerminalConfig {
    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace_secs)
    }
}

/// Global resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_workspaces: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { max_workspaces: 32 }
    }
}
