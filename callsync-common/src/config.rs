//! Configuration loading and root folder resolution

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Directory name used under the platform config/data dirs
pub const APP_DIR: &str = "callsync";

/// Root folder resolution, highest priority first:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. `root_folder` key of the TOML config file
/// 4. OS-dependent compiled default
pub fn resolve_root_folder(
    cli_arg: Option<&str>,
    env_var_name: &str,
    config_file: Option<&Path>,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(config_path) = config_file {
        if let Ok(config) = load_toml::<toml::Value>(config_path) {
            if let Some(root_folder) = config.get("root_folder").and_then(|v| v.as_str()) {
                return PathBuf::from(root_folder);
            }
        }
    }

    default_root_folder()
}

/// Parse a TOML file into `T`
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
    toml::from_str(&content).map_err(|e| Error::Config(format!("Invalid TOML in {}: {}", path.display(), e)))
}

/// Per-user config file path, e.g. `~/.config/callsync/server.toml`.
///
/// Returns `None` when the file does not exist.
pub fn user_config_file(file_name: &str) -> Option<PathBuf> {
    let path = dirs::config_dir()?.join(APP_DIR).join(file_name);
    path.exists().then_some(path)
}

/// OS-dependent default root folder
pub fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from("/var/lib/callsync"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/callsync"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\callsync"))
    } else {
        PathBuf::from("./callsync_data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_argument_wins() {
        let root = resolve_root_folder(Some("/srv/calls"), "CALLSYNC_TEST_UNSET_VAR", None);
        assert_eq!(root, PathBuf::from("/srv/calls"));
    }

    #[test]
    fn test_toml_root_folder_used() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("server.toml");
        std::fs::write(&file, "root_folder = \"/data/callsync\"\nport = 6000\n").unwrap();

        let root = resolve_root_folder(None, "CALLSYNC_TEST_UNSET_VAR_2", Some(&file));
        assert_eq!(root, PathBuf::from("/data/callsync"));
    }

    #[test]
    fn test_missing_toml_falls_back_to_default() {
        let root = resolve_root_folder(None, "CALLSYNC_TEST_UNSET_VAR_3", Some(Path::new("/nonexistent/x.toml")));
        assert_eq!(root, default_root_folder());
    }

    #[test]
    fn test_load_toml_reports_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bad.toml");
        std::fs::write(&file, "this is = = not toml").unwrap();
        let err = load_toml::<toml::Value>(&file).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
