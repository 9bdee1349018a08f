use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::preferences::{Preferences, PreferencesError};
use crate::record::ServerRecord;

/// A tag aggregated across the server collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub pinned: bool,
    /// Number of tag occurrences across the current records.
    pub count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum TagError {
    #[error("unknown tag: {0}")]
    UnknownTag(String),
    #[error("failed to persist pinned tags: {0}")]
    Persist(#[from] PreferencesError),
}

/// Derive the tag set from `records`.
///
/// One entry per distinct (case-sensitive) name, ordered by name, with
/// `count` equal to the number of occurrences and `pinned` set when the name
/// appears in `pinned_names`.
pub fn rebuild<'a, I>(records: I, pinned_names: &[String]) -> Vec<Tag>
where
    I: IntoIterator<Item = &'a ServerRecord>,
{
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for record in records {
        for name in &record.tags {
            *counts.entry(name.as_str()).or_default() += 1;
        }
    }
    let pinned: HashSet<&str> = pinned_names.iter().map(String::as_str).collect();
    counts
        .into_iter()
        .map(|(name, count)| Tag {
            name: name.to_string(),
            pinned: pinned.contains(name),
            count,
        })
        .collect()
}

/// Holds the current tag set and writes pin changes through to preferences.
pub struct TagIndex {
    tags: RwLock<Arc<[Tag]>>,
    preferences: Arc<dyn Preferences>,
    legacy_seeded: AtomicBool,
}

impl TagIndex {
    pub fn new(preferences: Arc<dyn Preferences>) -> Self {
        Self {
            tags: RwLock::new(Arc::from(Vec::new())),
            preferences,
            legacy_seeded: AtomicBool::new(false),
        }
    }

    /// Current tag set, ordered by name.
    pub fn tags(&self) -> Arc<[Tag]> {
        self.tags.read().clone()
    }

    pub fn get(&self, name: &str) -> Option<Tag> {
        self.tags.read().iter().find(|t| t.name == name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tags.read().iter().any(|t| t.name == name)
    }

    /// Names of the currently pinned tags, in tag order.
    pub fn pinned_names(&self) -> Vec<String> {
        self.tags
            .read()
            .iter()
            .filter(|t| t.pinned)
            .map(|t| t.name.clone())
            .collect()
    }

    /// Discard the current set and derive a new one from `records`.
    pub fn rebuild_from<'a, I>(&self, records: I)
    where
        I: IntoIterator<Item = &'a ServerRecord>,
    {
        let pinned = self.pinned_names_for_rebuild();
        let tags = rebuild(records, &pinned);
        tracing::debug!(count = tags.len(), "tag index rebuilt");
        *self.tags.write() = Arc::from(tags);
    }

    /// Flip the pinned flag of `name` and persist the resulting pinned list.
    ///
    /// Returns the new pinned state. If saving fails the previous state is
    /// restored, in memory and in the preferences working copy.
    pub fn toggle_pin(&self, name: &str) -> Result<bool, TagError> {
        let (previous, pinned) = {
            let mut guard = self.tags.write();
            let previous = guard.clone();
            let mut tags = guard.to_vec();
            let tag = tags
                .iter_mut()
                .find(|t| t.name == name)
                .ok_or_else(|| TagError::UnknownTag(name.to_string()))?;
            tag.pinned = !tag.pinned;
            let pinned = tag.pinned;
            *guard = Arc::from(tags);
            (previous, pinned)
        };
        if let Err(e) = self.persist_pins() {
            tracing::warn!(tag = %name, "pin change not saved: {e}");
            *self.tags.write() = previous;
            self.preferences.set_pinned_tags(self.pinned_names());
            return Err(e);
        }
        tracing::info!(tag = %name, pinned, "tag pin toggled");
        Ok(pinned)
    }

    /// Set the pinned flag of `name`; persists only when the flag changes.
    pub fn set_pinned(&self, name: &str, pinned: bool) -> Result<(), TagError> {
        let current = self
            .get(name)
            .ok_or_else(|| TagError::UnknownTag(name.to_string()))?;
        if current.pinned != pinned {
            self.toggle_pin(name)?;
        }
        Ok(())
    }

    fn persist_pins(&self) -> Result<(), TagError> {
        self.preferences.set_pinned_tags(self.pinned_names());
        self.preferences.save()?;
        Ok(())
    }

    /// Pinned names to apply on rebuild.
    ///
    /// Installs that predate the pinned-tag preference keep their pins in the
    /// legacy tag store. The first rebuild with an empty pinned list copies
    /// the pinned entries over, once per process and once per preferences
    /// file.
    fn pinned_names_for_rebuild(&self) -> Vec<String> {
        let pinned = self.preferences.pinned_tags();
        if !pinned.is_empty() || self.preferences.legacy_tags_migrated() {
            return pinned;
        }
        if self.legacy_seeded.swap(true, Ordering::AcqRel) {
            return pinned;
        }

        let seeded: Vec<String> = self
            .preferences
            .legacy_tag_pins()
            .into_iter()
            .filter(|(_, pinned)| *pinned)
            .map(|(name, _)| name)
            .collect();
        self.preferences.mark_legacy_tags_migrated();
        if seeded.is_empty() {
            return seeded;
        }

        tracing::info!(count = seeded.len(), "seeded pinned tags from legacy tag store");
        self.preferences.set_pinned_tags(seeded.clone());
        if let Err(e) = self.preferences.save() {
            tracing::warn!("failed to save migrated pinned tags: {e}");
        }
        seeded
    }
}
