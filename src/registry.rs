use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

use crate::events::{ListenerId, Listeners};
use crate::preferences::Preferences;
use crate::record::{SealedFields, ServerId, ServerRecord};
use crate::store::{ServerStore, StoreError};
use crate::tags::{Tag, TagError, TagIndex};

/// Registry change notifications, delivered to listeners after each state
/// transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    ServersChanged,
    TagsChanged,
    SelectedTagChanged { tag: String },
    FilterChanged { filter: String },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("server store is not attached")]
    StoreDetached,
    #[error("invalid server id: {0}")]
    InvalidId(ServerId),
    #[error("store rejected update of server {0}")]
    UpdateRejected(ServerId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tag(#[from] TagError),
}

/// Whether `add_server` reloads the collection once the insert succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoReload {
    #[default]
    Reload,
    /// Batch imports insert many records and reload once at the end.
    Skip,
}

/// A loaded server with its connection fields open in working memory.
#[derive(Debug, Clone)]
pub struct ServerEntry {
    record: Arc<ServerRecord>,
}

impl ServerEntry {
    fn new(record: ServerRecord) -> Self {
        Self {
            record: Arc::new(record),
        }
    }

    pub fn id(&self) -> ServerId {
        self.record.id
    }

    pub fn record(&self) -> &ServerRecord {
        &self.record
    }

    /// Case-insensitive match of `filter` against name, subtitle and tags.
    /// An empty filter matches everything.
    pub fn matches_filter(&self, filter: &str) -> bool {
        if filter.is_empty() {
            return true;
        }
        let needle = filter.to_lowercase();
        self.record.display_name.to_lowercase().contains(&needle)
            || self.record.subtitle.to_lowercase().contains(&needle)
            || self.record.tags.iter().any(|t| t.to_lowercase().contains(&needle))
    }
}

struct RegistryInner {
    store: Option<Arc<dyn ServerStore>>,
    servers: Arc<[ServerEntry]>,
    selected: HashSet<ServerId>,
    selected_tag: String,
    free_text_filter: String,
}

/// In-memory mirror of the server store.
///
/// The collection is published as an immutable snapshot: `reload` and
/// `update_server` build a new collection and swap it in, so a reader holding
/// a snapshot never observes a partially populated list. Mutations are
/// expected to come from a single coordinating context.
#[derive(Clone)]
pub struct ServerRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    tags: Arc<TagIndex>,
    preferences: Arc<dyn Preferences>,
    listeners: Arc<Listeners<RegistryEvent>>,
}

fn check_id(id: ServerId) -> Result<(), RegistryError> {
    debug_assert!(id.is_assigned(), "server id must be positive, got {id}");
    if id.is_assigned() {
        Ok(())
    } else {
        Err(RegistryError::InvalidId(id))
    }
}

impl ServerRegistry {
    /// Create a registry with no store attached. The last selected tab is
    /// restored from `preferences`; it is dropped on the first reload if no
    /// server carries that tag any more.
    pub fn new(preferences: Arc<dyn Preferences>) -> Self {
        let selected_tag = preferences.main_window_tab_selected();
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                store: None,
                servers: Arc::from(Vec::new()),
                selected: HashSet::new(),
                selected_tag,
                free_text_filter: String::new(),
            })),
            tags: Arc::new(TagIndex::new(preferences.clone())),
            preferences,
            listeners: Arc::new(Listeners::new()),
        }
    }

    pub fn with_store(store: Arc<dyn ServerStore>, preferences: Arc<dyn Preferences>) -> Self {
        let registry = Self::new(preferences);
        registry.attach_store(store);
        registry
    }

    /// Attach the persistence backend. Until then `reload` does nothing.
    pub fn attach_store(&self, store: Arc<dyn ServerStore>) {
        self.inner.write().store = Some(store);
    }

    pub fn has_store(&self) -> bool {
        self.inner.read().store.is_some()
    }

    fn store(&self) -> Option<Arc<dyn ServerStore>> {
        self.inner.read().store.clone()
    }

    fn require_store(&self) -> Result<Arc<dyn ServerStore>, RegistryError> {
        self.store().ok_or(RegistryError::StoreDetached)
    }

    // ---- listeners ----

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    // ---- queries ----

    /// Snapshot of the current collection.
    pub fn servers(&self) -> Arc<[ServerEntry]> {
        self.inner.read().servers.clone()
    }

    pub fn get(&self, id: ServerId) -> Option<ServerEntry> {
        self.inner.read().servers.iter().find(|e| e.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tags(&self) -> Arc<[Tag]> {
        self.tags.tags()
    }

    pub fn tag_index(&self) -> &TagIndex {
        &self.tags
    }

    /// Servers passing the active tag or free-text filter.
    pub fn visible_servers(&self) -> Vec<ServerEntry> {
        let (servers, tag, filter) = {
            let inner = self.inner.read();
            (
                inner.servers.clone(),
                inner.selected_tag.clone(),
                inner.free_text_filter.clone(),
            )
        };
        servers
            .iter()
            .filter(|e| {
                if tag.is_empty() {
                    e.matches_filter(&filter)
                } else {
                    e.record().has_tag(&tag)
                }
            })
            .cloned()
            .collect()
    }

    // ---- store synchronisation ----

    /// Rebuild the collection from the store.
    ///
    /// Records that fail to decrypt are logged and left out of this cycle;
    /// the next reload tries them again. Without an attached store this is
    /// a no-op.
    pub fn reload(&self) -> Result<(), RegistryError> {
        let Some(store) = self.store() else {
            tracing::debug!("reload skipped: no server store attached");
            return Ok(());
        };

        let records = store.get_servers()?;
        let total = records.len();
        let mut entries = Vec::with_capacity(total);
        for mut record in records {
            if !record.id.is_assigned() {
                tracing::warn!(server = %record.id, name = %record.display_name, "skipping server without an assigned id");
                continue;
            }
            match store.decrypt_to_working_memory(&mut record) {
                Ok(()) => entries.push(ServerEntry::new(record)),
                Err(e) => {
                    tracing::warn!(server = %record.id, name = %record.display_name, "skipping server: {e}");
                }
            }
        }
        let servers: Arc<[ServerEntry]> = Arc::from(entries);

        {
            let mut inner = self.inner.write();
            inner.selected.retain(|id| servers.iter().any(|e| e.id() == *id));
            inner.servers = servers.clone();
        }
        tracing::info!(loaded = servers.len(), skipped = total - servers.len(), "server list reloaded");

        self.listeners.emit(&RegistryEvent::ServersChanged);
        self.refresh_tags();
        Ok(())
    }

    /// Insert `record` through the store and return its new id.
    pub fn add_server(&self, mut record: ServerRecord, reload: AutoReload) -> Result<ServerId, RegistryError> {
        let store = self.require_store()?;
        let id = store.insert_server(&mut record)?;
        tracing::info!(server = %id, name = %record.display_name, "server added");
        if reload == AutoReload::Reload {
            self.reload()?;
        }
        Ok(id)
    }

    /// Write `record` through the store and replace the in-memory entry
    /// with the same id, keeping its position.
    ///
    /// Selection is cleared first. If no entry has this id, the store is
    /// still written but the collection is left alone; callers that changed
    /// membership should `reload`.
    pub fn update_server(&self, mut record: ServerRecord, notify: bool) -> Result<(), RegistryError> {
        check_id(record.id)?;
        let store = self.require_store()?;
        self.unselect_all();

        if matches!(record.fields, SealedFields::Sealed(_)) {
            store.decrypt_to_working_memory(&mut record)?;
        }
        if !store.update_server(&record)? {
            return Err(RegistryError::UpdateRejected(record.id));
        }

        let id = record.id;
        let replaced = {
            let mut inner = self.inner.write();
            match inner.servers.iter().position(|e| e.id() == id) {
                Some(pos) => {
                    let mut servers = inner.servers.to_vec();
                    servers[pos] = ServerEntry::new(record);
                    inner.servers = Arc::from(servers);
                    true
                }
                None => false,
            }
        };
        tracing::info!(server = %id, replaced, "server updated");

        if notify {
            self.listeners.emit(&RegistryEvent::ServersChanged);
        }
        if replaced {
            self.refresh_tags();
        }
        Ok(())
    }

    /// Delete the server with `id`. Returns `false`, without reloading, if
    /// the store had no such record.
    pub fn delete_server(&self, id: ServerId) -> Result<bool, RegistryError> {
        check_id(id)?;
        let store = self.require_store()?;
        if !store.delete_server(id)? {
            tracing::debug!(server = %id, "delete ignored: no such server");
            return Ok(false);
        }
        tracing::info!(server = %id, "server deleted");
        self.reload()?;
        Ok(true)
    }

    fn refresh_tags(&self) {
        let servers = self.servers();
        self.tags.rebuild_from(servers.iter().map(ServerEntry::record));
        self.listeners.emit(&RegistryEvent::TagsChanged);

        let selected = self.selected_tag();
        if !selected.is_empty() && !self.tags.contains(&selected) {
            tracing::debug!(tag = %selected, "selected tag no longer exists");
            self.set_selected_tag("");
        }
    }

    // ---- tags ----

    /// Flip the pinned flag of `name` and persist the pinned list.
    pub fn toggle_tag_pin(&self, name: &str) -> Result<bool, RegistryError> {
        let pinned = self.tags.toggle_pin(name)?;
        self.listeners.emit(&RegistryEvent::TagsChanged);
        Ok(pinned)
    }

    // ---- filters ----

    pub fn selected_tag(&self) -> String {
        self.inner.read().selected_tag.clone()
    }

    pub fn free_text_filter(&self) -> String {
        self.inner.read().free_text_filter.clone()
    }

    /// Select a tag tab (empty string for "all"). Clears the free-text
    /// filter and records the tab in preferences.
    pub fn set_selected_tag(&self, tag: &str) {
        let filter_cleared = {
            let mut inner = self.inner.write();
            if inner.selected_tag == tag {
                return;
            }
            inner.selected_tag = tag.to_string();
            let had_filter = !inner.free_text_filter.is_empty();
            inner.free_text_filter.clear();
            had_filter
        };
        self.preferences.set_main_window_tab_selected(tag);
        if filter_cleared {
            self.listeners.emit(&RegistryEvent::FilterChanged { filter: String::new() });
        }
        self.listeners.emit(&RegistryEvent::SelectedTagChanged { tag: tag.to_string() });
    }

    /// Set the free-text filter. A non-empty filter clears the selected tag.
    pub fn set_free_text_filter(&self, filter: &str) {
        let tag_cleared = {
            let mut inner = self.inner.write();
            if inner.free_text_filter == filter {
                return;
            }
            inner.free_text_filter = filter.to_string();
            if !filter.is_empty() && !inner.selected_tag.is_empty() {
                inner.selected_tag.clear();
                true
            } else {
                false
            }
        };
        if tag_cleared {
            self.preferences.set_main_window_tab_selected("");
            self.listeners.emit(&RegistryEvent::SelectedTagChanged { tag: String::new() });
        }
        self.listeners.emit(&RegistryEvent::FilterChanged { filter: filter.to_string() });
    }

    // ---- selection ----

    /// Mark a loaded server as selected. Returns `false` if it is not loaded.
    pub fn select(&self, id: ServerId) -> bool {
        let mut inner = self.inner.write();
        if inner.servers.iter().any(|e| e.id() == id) {
            inner.selected.insert(id);
            true
        } else {
            false
        }
    }

    pub fn is_selected(&self, id: ServerId) -> bool {
        self.inner.read().selected.contains(&id)
    }

    pub fn selected_ids(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self.inner.read().selected.iter().copied().collect();
        ids.sort();
        ids
    }

    pub fn unselect_all(&self) {
        self.inner.write().selected.clear();
    }
}
