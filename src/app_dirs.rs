//! Location of the `.rastertrain` folder holding run logs.
//!
//! Defaults to the OS config directory (e.g. `%APPDATA%` on Windows or
//! `~/.config` on Linux). `RASTERTRAIN_HOME` replaces that base directory.

use std::{
    path::{Path, PathBuf},
    sync::{LazyLock, Mutex},
};

use directories::BaseDirs;
use thiserror::Error;

/// Name of the application directory under the base directory.
pub const APP_DIR_NAME: &str = ".rastertrain";

/// Environment variable replacing the base directory.
pub const HOME_ENV: &str = "RASTERTRAIN_HOME";

const LOGS_DIR_NAME: &str = "logs";

static BASE_OVERRIDE: LazyLock<Mutex<Option<PathBuf>>> = LazyLock::new(|| Mutex::new(None));

#[derive(Debug, Error)]
pub enum AppDirError {
    #[error("No suitable base directory available for application files")]
    NoBaseDir,
    #[error("Failed to create application directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Return the `.rastertrain` directory, creating it if needed.
pub fn app_root_dir() -> Result<PathBuf, AppDirError> {
    let base = base_dir().ok_or(AppDirError::NoBaseDir)?;
    create(base.join(APP_DIR_NAME))
}

/// Return the directory receiving run logs, creating it if needed.
pub fn logs_dir() -> Result<PathBuf, AppDirError> {
    create(app_root_dir()?.join(LOGS_DIR_NAME))
}

fn create(path: PathBuf) -> Result<PathBuf, AppDirError> {
    std::fs::create_dir_all(&path).map_err(|source| AppDirError::CreateDir {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

fn base_dir() -> Option<PathBuf> {
    if let Some(path) = BASE_OVERRIDE.lock().ok().and_then(|guard| guard.clone()) {
        return Some(path);
    }
    base_from_env(std::env::var(HOME_ENV).ok().as_deref())
        .or_else(|| BaseDirs::new().map(|dirs| dirs.config_dir().to_path_buf()))
}

fn base_from_env(value: Option<&str>) -> Option<PathBuf> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| Path::new(value).to_path_buf())
}

#[cfg(test)]
fn set_base_override(path: Option<PathBuf>) {
    *BASE_OVERRIDE.lock().expect("base override mutex poisoned") = path;
}
