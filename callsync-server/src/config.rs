//! Server configuration
//!
//! Priority per setting: CLI argument, then environment (both handled by
//! clap), then `~/.config/callsync/server.toml`, then compiled default.

use callsync_common::config::{load_toml, resolve_root_folder};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 5780;
pub const ROOT_ENV_VAR: &str = "CALLSYNC_ROOT";
pub const CONFIG_FILE_NAME: &str = "server.toml";

/// Keys accepted in the TOML config file
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub root_folder: Option<String>,
    pub port: Option<u16>,
    pub base_url: Option<String>,
}

/// Resolved server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub root_folder: PathBuf,
    /// Public origin used to build `recording_url`, without trailing slash
    pub base_url: String,
}

impl ServerConfig {
    pub fn resolve(
        port: Option<u16>,
        root_folder: Option<&str>,
        base_url: Option<&str>,
        config_file: Option<&Path>,
    ) -> Self {
        let file: ServerFileConfig = config_file
            .and_then(|p| match load_toml(p) {
                Ok(cfg) => Some(cfg),
                Err(e) => {
                    tracing::warn!("Ignoring config file: {}", e);
                    None
                }
            })
            .unwrap_or_default();

        let port = port.or(file.port).unwrap_or(DEFAULT_PORT);
        let root_folder = resolve_root_folder(root_folder, ROOT_ENV_VAR, config_file);
        let base_url = base_url
            .map(str::to_string)
            .or(file.base_url)
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", port));

        Self {
            port,
            root_folder,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join("callsync-server.db")
    }
}
