//! Offline subcommands: environment checks and state inspection without a
//! running daemon.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::Config;
use crate::registry::{JsonFileStore, WorkspaceStore};
use crate::runtime::docker::DockerRuntime;

const DEFAULT_CONFIG_PATH: &str = "/etc/shellbox/config.toml";

/// Load configuration from the given path, the default path if it exists, or
/// built-in defaults otherwise.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default.exists() {
                Config::load(&default)
            } else {
                Ok(Config::default())
            }
        }
    }
}

/// Verify the host can run the daemon: valid config, reachable engine.
pub async fn run_check(config: &Config) -> Result<()> {
    config.validate().context("configuration invalid")?;
    println!("config: ok ({} images, default '{}')", config.images.len(), config.default_image);

    let runtime = DockerRuntime::new(config.runtime.engine_binary.clone());
    match runtime.version().await {
        Ok(version) => println!("engine: {} {}", config.runtime.engine_binary, version.trim()),
        Err(e) => anyhow::bail!(
            "engine '{}' is not reachable: {}",
            config.runtime.engine_binary,
            e
        ),
    }

    if let Some(dir) = config.server.state_file.parent() {
        if !dir.exists() {
            println!("note: state directory {} does not exist yet", dir.display());
        }
    }
    println!("check passed");
    Ok(())
}

/// Print the persisted workspace table from the state file.
pub fn run_status(config: &Config) -> Result<()> {
    if !config.server.state_file.exists() {
        println!("no state file at {} (no workspaces yet)", config.server.state_file.display());
        return Ok(());
    }

    let store = JsonFileStore::new(&config.server.state_file);
    let mut workspaces = store.list_all()?;
    workspaces.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    if workspaces.is_empty() {
        println!("no workspaces");
        return Ok(());
    }

    println!(
        "{:<10} {:<20} {:<10} {:<10} {:<14} {}",
        "ID", "NAME", "IMAGE", "STATE", "CONTAINER", "UPDATED"
    );
    for ws in &workspaces {
        let container = ws
            .container_ref
            .as_ref()
            .map(|c| {
                let s = c.0.as_str();
                s[..s.len().min(12)].to_string()
            })
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<10} {:<20} {:<10} {:<10} {:<14} {}",
            ws.short_id(),
            ws.name,
            ws.image,
            ws.state,
            container,
            ws.updated_at.format("%Y-%m-%d %H:%M:%S"),
        );
        if let Some(error) = &ws.last_error {
            println!("           last error: {}", error);
        }
    }
    Ok(())
}
