//! JSON file preference store.
//!
//! Every read goes to disk. A running `serve` re-reads the stored selection
//! before each console command and every few seconds, so an edit made by
//! another `doggo` invocation (e.g. `doggo upstream select 1`) reaches new
//! connections. Writes go to a sibling temp file first and are renamed into
//! place, so a crash never leaves a half-written file.

use doggo_proxy::{PreferenceStore, ProxyError, ProxyPreference, Result, UpstreamsPreference};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// On-disk layout of the preference file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub proxy: ProxyPreference,
    #[serde(default)]
    pub upstreams: UpstreamsPreference,
}

/// Preference store backed by a JSON file.
#[derive(Debug)]
pub struct FilePreferenceStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FilePreferenceStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole file, falling back to defaults when it does not exist.
    pub fn load(&self) -> Result<Preferences> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No preference file at {}, using defaults", self.path.display());
                return Ok(Preferences::default());
            }
            Err(e) => {
                return Err(ProxyError::Preferences(format!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        serde_json::from_str(&content).map_err(|e| {
            ProxyError::Preferences(format!("failed to parse {}: {}", self.path.display(), e))
        })
    }

    /// Write the whole file.
    pub fn save(&self, prefs: &Preferences) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    ProxyError::Preferences(format!(
                        "failed to create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let json = serde_json::to_string_pretty(prefs)
            .map_err(|e| ProxyError::Preferences(format!("failed to serialize preferences: {}", e)))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json).map_err(|e| {
            ProxyError::Preferences(format!("failed to write {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            ProxyError::Preferences(format!(
                "failed to replace {}: {}",
                self.path.display(),
                e
            ))
        })?;

        debug!("Saved preferences to {}", self.path.display());
        Ok(())
    }

    /// Load, apply `f`, and save, holding the write lock throughout.
    pub fn update<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Preferences) -> Result<T>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut prefs = self.load()?;
        let value = f(&mut prefs)?;
        self.save(&prefs)?;
        Ok(value)
    }

    pub fn proxy_preference(&self) -> Result<ProxyPreference> {
        Ok(self.load()?.proxy)
    }

    pub fn set_proxy_preference(&self, value: ProxyPreference) -> Result<()> {
        self.update(|prefs| {
            prefs.proxy = value;
            Ok(())
        })
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn upstreams_preference(&self) -> Result<UpstreamsPreference> {
        Ok(self.load()?.upstreams)
    }

    fn set_upstreams_preference(&self, value: &UpstreamsPreference) -> Result<()> {
        self.update(|prefs| {
            prefs.upstreams = value.clone();
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use doggo_proxy::{UpstreamDefinition, UpstreamTarget};
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> FilePreferenceStore {
        FilePreferenceStore::new(dir.path().join("nested").join("preferences.json"))
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let prefs = store.load().unwrap();
        assert_eq!(prefs, Preferences::default());
        assert_eq!(prefs.proxy.port, 8080);
        assert_eq!(prefs.upstreams.upstreams.len(), 1);
        assert!(!store.path().exists());
    }

    #[test]
    fn test_upstreams_persist_across_instances() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let mut pref = store.upstreams_preference().unwrap();
        pref.add(UpstreamDefinition::via(
            "Office",
            UpstreamTarget::new("proxy.example", 3128).with_credentials("alice", "pw"),
        ))
        .unwrap();
        pref.select(1).unwrap();
        store.set_upstreams_preference(&pref).unwrap();

        let reopened = store_in(&dir);
        let loaded = reopened.upstreams_preference().unwrap();
        assert_eq!(loaded, pref);
        assert_eq!(
            loaded.selected_target().unwrap().unwrap().authority(),
            "alice:pw@proxy.example:3128"
        );
    }

    #[test]
    fn test_proxy_and_upstreams_written_independently() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store
            .set_proxy_preference(ProxyPreference {
                port: 9000,
                verbose: true,
            })
            .unwrap();
        let mut pref = store.upstreams_preference().unwrap();
        pref.add(UpstreamDefinition::direct("Home")).unwrap();
        store.set_upstreams_preference(&pref).unwrap();

        let prefs = store.load().unwrap();
        assert_eq!(prefs.proxy.port, 9000);
        assert!(prefs.proxy.verbose);
        assert_eq!(prefs.upstreams.upstreams.len(), 2);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("preferences.json");
        fs::write(&path, r#"{"proxy": {"verbose": true}}"#).unwrap();

        let prefs = FilePreferenceStore::new(&path).load().unwrap();
        assert_eq!(prefs.proxy.port, 8080);
        assert!(prefs.proxy.verbose);
        assert_eq!(prefs.upstreams, UpstreamsPreference::default());
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("preferences.json");
        fs::write(&path, "{not json").unwrap();

        let err = FilePreferenceStore::new(&path).load().unwrap_err();
        assert!(matches!(err, ProxyError::Preferences(_)));
    }

    #[test]
    fn test_failed_update_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.set_proxy_preference(ProxyPreference::default()).unwrap();
        let before = fs::read_to_string(store.path()).unwrap();

        let result: Result<()> = store.update(|prefs| {
            prefs.proxy.port = 1;
            Err(ProxyError::Validation("nope".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_serve_sees_selection_from_another_invocation() {
        use doggo_proxy::{Command, CommandHandler, CommandResponse, ProxyController, UpstreamSelector};
        use std::sync::Arc;

        let dir = TempDir::new().unwrap();
        let controller = Arc::new(ProxyController::new(Arc::new(UpstreamSelector::new())));
        let handler = CommandHandler::new(Arc::clone(&controller), store_in(&dir));
        handler.sync_selected_upstream().unwrap();

        // `doggo upstream add` + `doggo upstream select 1` from another shell.
        let another = store_in(&dir);
        another
            .update(|prefs| {
                prefs.upstreams.add(UpstreamDefinition::via(
                    "Office",
                    UpstreamTarget::new("proxy.example", 3128),
                ))?;
                prefs.upstreams.select(1).map(|_| ())
            })
            .unwrap();

        match handler.handle(Command::Status).await.unwrap() {
            CommandResponse::Status(report) => {
                assert_eq!(report.upstream.as_deref(), Some("proxy.example:3128"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
        assert_eq!(
            controller.selector().authority().as_deref(),
            Some("proxy.example:3128")
        );
    }
}
