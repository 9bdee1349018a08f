//! User preferences consumed by the registry: pinned tags, the last
//! selected main-window tab, and the legacy tag store kept for migration.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PreferencesError {
    #[error("failed to read preferences {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("failed to parse preferences {0}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),
    #[error("failed to write preferences {0}: {1}")]
    Write(PathBuf, #[source] std::io::Error),
    #[error("failed to serialize preferences: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Preferences collaborator.
///
/// Setters only touch working state; nothing reaches disk until `save`.
pub trait Preferences: Send + Sync {
    fn pinned_tags(&self) -> Vec<String>;
    fn set_pinned_tags(&self, tags: Vec<String>);
    fn save(&self) -> Result<(), PreferencesError>;

    fn main_window_tab_selected(&self) -> String;
    fn set_main_window_tab_selected(&self, tag: &str);

    /// Pre-migration "all known tags" store: tag name to pinned flag.
    fn legacy_tag_pins(&self) -> BTreeMap<String, bool>;
    fn legacy_tags_migrated(&self) -> bool;
    fn mark_legacy_tags_migrated(&self);
}

/// On-disk layout of the preferences file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreferencesFile {
    #[serde(default)]
    pub pinned_tags: Vec<String>,
    #[serde(default)]
    pub main_window_tab_selected: String,
    #[serde(default)]
    pub legacy_tags_migrated: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub legacy_tags: BTreeMap<String, bool>,
}

/// TOML-file backed [`Preferences`].
pub struct TomlPreferences {
    path: PathBuf,
    state: RwLock<PreferencesFile>,
}

impl TomlPreferences {
    /// Load preferences from `path`. A missing file yields defaults.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PreferencesError> {
        let path = path.into();
        let state = if path.exists() {
            let contents =
                std::fs::read_to_string(&path).map_err(|e| PreferencesError::Read(path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| PreferencesError::Parse(path.clone(), e))?
        } else {
            PreferencesFile::default()
        };
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> PreferencesFile {
        self.state.read().clone()
    }
}

impl Preferences for TomlPreferences {
    fn pinned_tags(&self) -> Vec<String> {
        self.state.read().pinned_tags.clone()
    }

    fn set_pinned_tags(&self, tags: Vec<String>) {
        self.state.write().pinned_tags = tags;
    }

    fn save(&self) -> Result<(), PreferencesError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PreferencesError::Write(self.path.clone(), e))?;
            }
        }
        let contents = toml::to_string_pretty(&*self.state.read())?;
        std::fs::write(&self.path, contents).map_err(|e| PreferencesError::Write(self.path.clone(), e))?;
        tracing::debug!(path = %self.path.display(), "preferences saved");
        Ok(())
    }

    fn main_window_tab_selected(&self) -> String {
        self.state.read().main_window_tab_selected.clone()
    }

    fn set_main_window_tab_selected(&self, tag: &str) {
        self.state.write().main_window_tab_selected = tag.to_string();
    }

    fn legacy_tag_pins(&self) -> BTreeMap<String, bool> {
        self.state.read().legacy_tags.clone()
    }

    fn legacy_tags_migrated(&self) -> bool {
        self.state.read().legacy_tags_migrated
    }

    fn mark_legacy_tags_migrated(&self) {
        self.state.write().legacy_tags_migrated = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = TomlPreferences::load(dir.path().join("prefs.toml")).unwrap();
        assert!(prefs.pinned_tags().is_empty());
        assert_eq!(prefs.main_window_tab_selected(), "");
        assert!(!prefs.legacy_tags_migrated());
    }

    #[test]
    fn save_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("prefs.toml");
        let prefs = TomlPreferences::load(&path).unwrap();
        prefs.set_pinned_tags(vec!["prod".into(), "db".into()]);
        prefs.set_main_window_tab_selected("prod");
        prefs.mark_legacy_tags_migrated();
        prefs.save().unwrap();

        let reloaded = TomlPreferences::load(&path).unwrap();
        assert_eq!(reloaded.pinned_tags(), vec!["prod", "db"]);
        assert_eq!(reloaded.main_window_tab_selected(), "prod");
        assert!(reloaded.legacy_tags_migrated());
    }

    #[test]
    fn parses_legacy_tags_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.toml");
        std::fs::write(
            &path,
            r#"
                pinned_tags = []

                [legacy_tags]
                prod = true
                lab = false
            "#,
        )
        .unwrap();
        let prefs = TomlPreferences::load(&path).unwrap();
        let legacy = prefs.legacy_tag_pins();
        assert_eq!(legacy.get("prod"), Some(&true));
        assert_eq!(legacy.get("lab"), Some(&false));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.toml");
        std::fs::write(&path, "pinned_tags = 5").unwrap();
        let err = TomlPreferences::load(&path).err().expect("should fail to parse");
        assert!(matches!(err, PreferencesError::Parse(..)), "got: {err:?}");
    }
}
