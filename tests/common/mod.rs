#![allow(dead_code)]

use parking_lot::Mutex;
use prm::pool::{Host, Session};
use prm::preferences::TomlPreferences;
use prm::record::{ConnectionFields, ProtocolKind, SealedFields, ServerId, ServerRecord};
use prm::registry::{RegistryEvent, ServerRegistry};
use prm::store::{MemoryStore, ServerStore, StoreError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A new (unstored) RDP record carrying `tags`.
pub fn server(name: &str, tags: &[&str]) -> ServerRecord {
    ServerRecord::new(
        name,
        ProtocolKind::Rdp,
        ConnectionFields {
            address: format!("{name}.example.net"),
            port: 3389,
            username: Some("admin".into()),
            password: Some("s3cret".into()),
            ..Default::default()
        },
    )
    .with_tags(tags.iter().copied())
}

/// A record that already carries `id`, as the pool sees it.
pub fn stored_server(id: i64, name: &str) -> ServerRecord {
    let mut record = server(name, &[]).with_subtitle("test");
    record.id = ServerId(id);
    record
}

/// Preferences backed by a file in a fresh temp directory.
pub fn temp_preferences() -> (tempfile::TempDir, Arc<TomlPreferences>) {
    let dir = tempfile::tempdir().unwrap();
    let prefs = TomlPreferences::load(dir.path().join("preferences.toml")).unwrap();
    (dir, Arc::new(prefs))
}

/// Collect every event the registry emits.
pub fn record_events(registry: &ServerRegistry) -> Arc<Mutex<Vec<RegistryEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    registry.add_listener(move |ev| sink.lock().push(ev.clone()));
    events
}

/// Store wrapper that counts calls and can be told to fail decryption for
/// particular ids.
#[derive(Default)]
pub struct RecordingStore {
    pub inner: MemoryStore,
    pub get_servers_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    failing: Mutex<HashSet<ServerId>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_decrypt(&self, id: ServerId) {
        self.failing.lock().insert(id);
    }

    pub fn heal(&self, id: ServerId) {
        self.failing.lock().remove(&id);
    }

    pub fn reloads(&self) -> usize {
        self.get_servers_calls.load(Ordering::SeqCst)
    }
}

impl ServerStore for RecordingStore {
    fn get_servers(&self) -> Result<Vec<ServerRecord>, StoreError> {
        self.get_servers_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_servers()
    }

    fn decrypt_to_working_memory(&self, record: &mut ServerRecord) -> Result<(), StoreError> {
        if self.failing.lock().contains(&record.id) {
            return Err(StoreError::Decrypt {
                id: record.id,
                reason: "key unavailable".into(),
            });
        }
        self.inner.decrypt_to_working_memory(record)
    }

    fn insert_server(&self, record: &mut ServerRecord) -> Result<ServerId, StoreError> {
        self.inner.insert_server(record)
    }

    fn update_server(&self, record: &ServerRecord) -> Result<bool, StoreError> {
        self.inner.update_server(record)
    }

    fn delete_server(&self, id: ServerId) -> Result<bool, StoreError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_server(id)
    }
}

/// Registry over a [`RecordingStore`] and temp-file preferences.
pub struct TestRegistry {
    pub registry: ServerRegistry,
    pub store: Arc<RecordingStore>,
    pub preferences: Arc<TomlPreferences>,
    pub dir: tempfile::TempDir,
}

pub fn create_test_registry() -> TestRegistry {
    let (dir, preferences) = temp_preferences();
    let store = Arc::new(RecordingStore::new());
    let registry = ServerRegistry::with_store(store.clone(), preferences.clone());
    TestRegistry {
        registry,
        store,
        preferences,
        dir,
    }
}

/// Session double recording host changes and close calls.
pub struct FakeSession {
    pub title: String,
    pub hosts: Mutex<Vec<Host>>,
    pub closed: AtomicUsize,
    pub token: CancellationToken,
}

impl FakeSession {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            hosts: Mutex::new(Vec::new()),
            closed: AtomicUsize::new(0),
            token: CancellationToken::new(),
        }
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Session for FakeSession {
    fn title(&self) -> String {
        self.title.clone()
    }

    fn icon(&self) -> Option<String> {
        None
    }

    fn reparent(&self, host: Host) {
        self.hosts.lock().push(host);
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn cancelled(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Factory that counts how many sessions it built.
pub struct CountingFactory {
    pub created: AtomicUsize,
}

impl CountingFactory {
    pub fn new() -> Self {
        Self {
            created: AtomicUsize::new(0),
        }
    }

    pub fn count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl prm::pool::SessionFactory<FakeSession> for CountingFactory {
    fn create(&self, server: &ServerRecord) -> anyhow::Result<FakeSession> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSession::new(&server.title()))
    }
}

/// True if the record's connection fields were opened for working memory.
pub fn is_open(record: &ServerRecord) -> bool {
    matches!(record.fields, SealedFields::Open(_))
}
