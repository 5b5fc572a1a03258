use anyhow::{Context, Result};
use directories_next::ProjectDirs;
use std::path::{Path, PathBuf};

/// Default location of the config file, e.g. `~/.config/portal/config.toml` on Linux.
pub fn default_config_path() -> Result<PathBuf> {
    ProjectDirs::from("", "", "portal")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .context("Could not determine a default config directory for this system")
}

pub fn ensure_directory_exists(file: &Path) -> Result<(), std::io::Error> {
    if let Some(path) = file.parent() {
        if !path.exists() {
            tracing::info!(
                "Parent directory does not exist, creating recursively: {}",
                file.display()
            );
            return std::fs::create_dir_all(path);
        }
    }
    Ok(())
}
