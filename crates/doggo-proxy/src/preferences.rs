//! Stored preferences: the named upstream list and the listener settings.
//!
//! Persistence itself lives behind [`PreferenceStore`]; the CLI provides a
//! JSON file implementation and [`InMemoryPreferenceStore`] serves
//! embedding and tests.

use crate::config::DEFAULT_PORT;
use crate::error::{ProxyError, Result};
use crate::upstream::UpstreamTarget;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

/// A named entry in the upstream list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamDefinition {
    pub name: String,
    /// Icon identifier shown next to the entry, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// `None` means direct access.
    #[serde(default)]
    pub connection_setting: Option<UpstreamTarget>,
}

impl UpstreamDefinition {
    #[must_use]
    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            icon: None,
            connection_setting: None,
        }
    }

    #[must_use]
    pub fn via(name: impl Into<String>, target: UpstreamTarget) -> Self {
        Self {
            name: name.into(),
            icon: None,
            connection_setting: Some(target),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ProxyError::Validation("upstream name is empty".to_string()));
        }
        if let Some(ref target) = self.connection_setting {
            target.validate()?;
        }
        Ok(())
    }

    /// Short description: "Direct Access" or `host:port`.
    #[must_use]
    pub fn summary(&self) -> String {
        match self.connection_setting {
            Some(ref target) => target.host_port(),
            None => "Direct Access".to_string(),
        }
    }
}

/// The upstream list plus which entry is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamsPreference {
    #[serde(default)]
    pub selected_index: usize,
    #[serde(default)]
    pub upstreams: Vec<UpstreamDefinition>,
}

impl Default for UpstreamsPreference {
    fn default() -> Self {
        Self {
            selected_index: 0,
            upstreams: vec![UpstreamDefinition::direct("Direct")],
        }
    }
}

impl UpstreamsPreference {
    /// The selected definition, if the index is in range.
    #[must_use]
    pub fn selected(&self) -> Option<&UpstreamDefinition> {
        self.upstreams.get(self.selected_index)
    }

    /// Target the selector should hold for the current selection.
    ///
    /// An out-of-range index (e.g. a hand-edited file) is an error rather
    /// than a silent switch to direct.
    pub fn selected_target(&self) -> Result<Option<UpstreamTarget>> {
        self.selected()
            .map(|def| def.connection_setting.clone())
            .ok_or(ProxyError::UpstreamIndex {
                index: self.selected_index,
                len: self.upstreams.len(),
            })
    }

    /// Select entry `index`. Out-of-range indices are rejected, never clamped.
    pub fn select(&mut self, index: usize) -> Result<&UpstreamDefinition> {
        self.check_index(index)?;
        self.selected_index = index;
        Ok(&self.upstreams[index])
    }

    /// Append a definition; the selection is unchanged.
    pub fn add(&mut self, definition: UpstreamDefinition) -> Result<usize> {
        definition.validate()?;
        self.upstreams.push(definition);
        Ok(self.upstreams.len() - 1)
    }

    /// Replace the definition at `index`; the selection is unchanged.
    pub fn edit(&mut self, index: usize, definition: UpstreamDefinition) -> Result<()> {
        self.check_index(index)?;
        definition.validate()?;
        self.upstreams[index] = definition;
        Ok(())
    }

    /// Remove the definition at `index`, keeping the selection stable.
    ///
    /// Removing the selected entry selects entry 0; removing an entry
    /// before it shifts the index down by one.
    pub fn remove(&mut self, index: usize) -> Result<UpstreamDefinition> {
        self.check_index(index)?;
        let removed = self.upstreams.remove(index);
        if index == self.selected_index {
            self.selected_index = 0;
        } else if index < self.selected_index {
            self.selected_index -= 1;
        }
        Ok(removed)
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.upstreams.len() {
            return Err(ProxyError::UpstreamIndex {
                index,
                len: self.upstreams.len(),
            });
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyPreference {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub verbose: bool,
}

impl Default for ProxyPreference {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            verbose: false,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Read/write access to the stored upstream list.
pub trait PreferenceStore: Send + Sync {
    fn upstreams_preference(&self) -> Result<UpstreamsPreference>;
    fn set_upstreams_preference(&self, value: &UpstreamsPreference) -> Result<()>;
}

/// Non-persistent store.
#[derive(Debug, Default)]
pub struct InMemoryPreferenceStore {
    upstreams: Mutex<UpstreamsPreference>,
}

impl InMemoryPreferenceStore {
    #[must_use]
    pub fn new(upstreams: UpstreamsPreference) -> Self {
        Self {
            upstreams: Mutex::new(upstreams),
        }
    }
}

impl PreferenceStore for InMemoryPreferenceStore {
    fn upstreams_preference(&self) -> Result<UpstreamsPreference> {
        Ok(self
            .upstreams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn set_upstreams_preference(&self, value: &UpstreamsPreference) -> Result<()> {
        *self.upstreams.lock().unwrap_or_else(PoisonError::into_inner) = value.clone();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn three_upstreams(selected_index: usize) -> UpstreamsPreference {
        UpstreamsPreference {
            selected_index,
            upstreams: vec![
                UpstreamDefinition::direct("Direct"),
                UpstreamDefinition::via("Office", UpstreamTarget::new("proxy.example", 3128)),
                UpstreamDefinition::via("Lab", UpstreamTarget::new("10.0.0.1", 8080)),
            ],
        }
    }

    #[test]
    fn test_default_has_direct_entry_selected() {
        let pref = UpstreamsPreference::default();
        assert_eq!(pref.selected().unwrap().name, "Direct");
        assert!(pref.selected_target().unwrap().is_none());
    }

    #[test]
    fn test_select_out_of_range_rejected() {
        let mut pref = three_upstreams(1);
        pref.upstreams.truncate(2);
        let err = pref.select(2).unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamIndex { index: 2, len: 2 }));
        assert_eq!(pref.selected_index, 1);
    }

    #[test]
    fn test_selected_target_out_of_range_is_error() {
        let pref = UpstreamsPreference {
            selected_index: 5,
            upstreams: vec![UpstreamDefinition::direct("Direct")],
        };
        assert!(pref.selected_target().is_err());
    }

    #[test]
    fn test_remove_selected_resets_to_first() {
        let mut pref = three_upstreams(1);
        pref.remove(1).unwrap();
        assert_eq!(pref.selected_index, 0);
        assert_eq!(pref.upstreams.len(), 2);
    }

    #[test]
    fn test_remove_before_selected_shifts_down() {
        let mut pref = three_upstreams(2);
        pref.remove(0).unwrap();
        assert_eq!(pref.selected_index, 1);
        assert_eq!(pref.selected().unwrap().name, "Lab");
    }

    #[test]
    fn test_remove_after_selected_keeps_index() {
        let mut pref = three_upstreams(1);
        pref.remove(2).unwrap();
        assert_eq!(pref.selected_index, 1);
        assert_eq!(pref.selected().unwrap().name, "Office");
    }

    #[test]
    fn test_add_and_edit_validate() {
        let mut pref = three_upstreams(0);
        assert!(pref
            .add(UpstreamDefinition::via("Bad", UpstreamTarget::new("bad host", 1)))
            .is_err());
        assert!(pref.add(UpstreamDefinition::direct("  ")).is_err());
        assert_eq!(pref.upstreams.len(), 3);

        let index = pref
            .add(UpstreamDefinition::via("Home", UpstreamTarget::new("home.example", 8888)))
            .unwrap();
        assert_eq!(index, 3);

        pref.edit(3, UpstreamDefinition::direct("Home direct")).unwrap();
        assert_eq!(pref.upstreams[3].summary(), "Direct Access");
        assert!(pref.edit(9, UpstreamDefinition::direct("x")).is_err());
    }

    #[test]
    fn test_preference_json_shape() {
        let json = r#"{
            "selected_index": 1,
            "upstreams": [
                {"name": "Direct", "connection_setting": null},
                {"name": "Office", "icon": "shiba", "connection_setting": {
                    "host": "proxy.example", "port": 3128,
                    "credentials": {"user": "alice", "password": "pw"}
                }}
            ]
        }"#;
        let pref: UpstreamsPreference = serde_json::from_str(json).unwrap();
        let target = pref.selected_target().unwrap().unwrap();
        assert_eq!(target.authority(), "alice:pw@proxy.example:3128");
        assert_eq!(pref.upstreams[1].icon.as_deref(), Some("shiba"));
    }

    #[test]
    fn test_in_memory_store_round_trip() {
        let store = InMemoryPreferenceStore::default();
        let mut pref = store.upstreams_preference().unwrap();
        pref.add(UpstreamDefinition::via("Office", UpstreamTarget::new("proxy.example", 3128)))
            .unwrap();
        store.set_upstreams_preference(&pref).unwrap();
        assert_eq!(store.upstreams_preference().unwrap().upstreams.len(), 2);
    }
}
