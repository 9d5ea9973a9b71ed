//! Configuration module for doggo CLI
//!
//! Preferences live in one JSON file:
//! - `--config <FILE>` or `DOGGO_CONFIG` when given
//! - otherwise `<config dir>/doggo/preferences.json`
//!
//! A missing file means defaults (port 8080, not verbose, a single
//! "Direct" upstream); it is created on the first write.

pub mod store;

use doggo_proxy::{ProxyError, Result};
use std::path::{Path, PathBuf};

pub use store::FilePreferenceStore;

/// File name inside the user config directory.
const PREFERENCES_FILE: &str = "preferences.json";

/// Get the user config directory path
pub fn user_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("doggo"))
}

/// Resolve the preference file path.
///
/// An explicit path must be absolute or relative to the working directory;
/// it is used as-is. Without one, the platform config directory is required.
pub fn preferences_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.as_os_str().is_empty() {
            return Err(ProxyError::Preferences(
                "preference file path is empty".to_string(),
            ));
        }
        return Ok(path.to_path_buf());
    }

    user_config_dir()
        .map(|dir| dir.join(PREFERENCES_FILE))
        .ok_or_else(|| {
            ProxyError::Preferences(
                "cannot determine config directory; pass --config <FILE>".to_string(),
            )
        })
}
