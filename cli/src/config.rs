// Configuration file management for the meshlink CLI
//
// Stored as JSON in:
// - macOS: ~/Library/Application Support/meshlink/config.json
// - Linux: ~/.config/meshlink/config.json
// - Windows: %APPDATA%\meshlink\config.json

use anyhow::{Context, Result};
use meshlink_core::MeshConfig;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "meshlink";
const CONFIG_FILE: &str = "config.json";

/// Get the config directory path (cross-platform)
pub fn config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .context("Failed to determine config directory")?
        .join(APP_DIR))
}

/// Get the config file path
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE))
}

/// Load the config file, or defaults if there is none
pub fn load() -> Result<MeshConfig> {
    load_from(&config_file()?)
}

pub fn load_from(path: &Path) -> Result<MeshConfig> {
    if !path.exists() {
        return Ok(MeshConfig::default());
    }
    MeshConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Write `config` to `path`, creating the parent directory.
/// Refuses to overwrite an existing file unless `force` is set.
pub fn init_at(path: &Path, config: &MeshConfig, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    config
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, MeshConfig::default());
    }

    #[test]
    fn test_init_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let mut config = MeshConfig::default();
        config.routing.default_ttl = 9;
        init_at(&path, &config, false).unwrap();

        assert_eq!(load_from(&path).unwrap().routing.default_ttl, 9);
    }

    #[test]
    fn test_init_refuses_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        init_at(&path, &MeshConfig::default(), false).unwrap();

        assert!(init_at(&path, &MeshConfig::default(), false).is_err());
        assert!(init_at(&path, &MeshConfig::default(), true).is_ok());
    }
}
