//! Persistence backend for server records.
//!
//! The registry only talks to [`ServerStore`]. Two implementations ship with
//! the crate: [`MemoryStore`] keeps records in process, [`JsonFileStore`]
//! persists them to a JSON document. Both keep connection fields sealed at
//! rest and open them through a [`FieldSealer`] only when asked to decrypt a
//! record into working memory.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::record::{ConnectionFields, SealedFields, ServerId, ServerRecord};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to decrypt server {id}: {reason}")]
    Decrypt { id: ServerId, reason: String },
    #[error("failed to seal connection fields: {0}")]
    Seal(String),
    #[error("io error on {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, #[source] serde_json::Error),
    #[error("failed to serialize store: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Backend collaborator of the registry.
///
/// All calls are synchronous. Records returned by `get_servers` carry
/// sealed connection fields until passed through
/// `decrypt_to_working_memory`.
pub trait ServerStore: Send + Sync {
    fn get_servers(&self) -> Result<Vec<ServerRecord>, StoreError>;

    /// Open the record's connection fields in place. The opened form is
    /// never written back.
    fn decrypt_to_working_memory(&self, record: &mut ServerRecord) -> Result<(), StoreError>;

    /// Store a new record and assign its identity (also written to `record.id`).
    fn insert_server(&self, record: &mut ServerRecord) -> Result<ServerId, StoreError>;

    /// Returns `false` if no record with `record.id` exists.
    fn update_server(&self, record: &ServerRecord) -> Result<bool, StoreError>;

    /// Returns `false` if no record with `id` existed.
    fn delete_server(&self, id: ServerId) -> Result<bool, StoreError>;
}

/// Turns connection fields into their at-rest form and back.
pub trait FieldSealer: Send + Sync {
    fn seal(&self, fields: &ConnectionFields) -> Result<String, String>;
    fn open(&self, sealed: &str) -> Result<ConnectionFields, String>;
}

/// Base64-wrapped JSON.
///
/// An encoding, not a cipher: it keeps secrets out of casual view in the
/// data file. Deployments that need confidentiality plug in their own
/// [`FieldSealer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64Sealer;

impl FieldSealer for Base64Sealer {
    fn seal(&self, fields: &ConnectionFields) -> Result<String, String> {
        let json = serde_json::to_vec(fields).map_err(|e| e.to_string())?;
        Ok(STANDARD.encode(json))
    }

    fn open(&self, sealed: &str) -> Result<ConnectionFields, String> {
        let bytes = STANDARD.decode(sealed).map_err(|e| e.to_string())?;
        serde_json::from_slice(&bytes).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    next_id: i64,
    #[serde(default)]
    servers: Vec<ServerRecord>,
}

impl StoreDocument {
    fn allocate_id(&mut self) -> ServerId {
        let floor = self.servers.iter().map(|s| s.id.0).max().unwrap_or(0);
        self.next_id = self.next_id.max(floor) + 1;
        ServerId(self.next_id)
    }
}

/// In-process [`ServerStore`].
pub struct MemoryStore {
    doc: Mutex<StoreDocument>,
    sealer: Arc<dyn FieldSealer>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_sealer(Arc::new(Base64Sealer))
    }

    pub fn with_sealer(sealer: Arc<dyn FieldSealer>) -> Self {
        Self {
            doc: Mutex::new(StoreDocument::default()),
            sealer,
        }
    }

    fn from_document(doc: StoreDocument, sealer: Arc<dyn FieldSealer>) -> Self {
        Self {
            doc: Mutex::new(doc),
            sealer,
        }
    }

    /// Store `record` verbatim, bypassing sealing. Lets callers plant
    /// records whose sealed payload is already corrupt.
    pub fn insert_raw(&self, mut record: ServerRecord) -> ServerId {
        let mut doc = self.doc.lock();
        let id = doc.allocate_id();
        record.id = id;
        doc.servers.push(record);
        id
    }

    pub fn len(&self) -> usize {
        self.doc.lock().servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_rest(&self, record: &ServerRecord) -> Result<ServerRecord, StoreError> {
        let mut stored = record.clone();
        if let SealedFields::Open(fields) = &record.fields {
            stored.fields = SealedFields::Sealed(self.sealer.seal(fields).map_err(StoreError::Seal)?);
        }
        Ok(stored)
    }

    fn document(&self) -> StoreDocument {
        self.doc.lock().clone()
    }

    fn restore(&self, doc: StoreDocument) {
        *self.doc.lock() = doc;
    }
}

impl ServerStore for MemoryStore {
    fn get_servers(&self) -> Result<Vec<ServerRecord>, StoreError> {
        Ok(self.doc.lock().servers.clone())
    }

    fn decrypt_to_working_memory(&self, record: &mut ServerRecord) -> Result<(), StoreError> {
        if let SealedFields::Sealed(sealed) = &record.fields {
            let fields = self.sealer.open(sealed).map_err(|reason| StoreError::Decrypt {
                id: record.id,
                reason,
            })?;
            record.fields = SealedFields::Open(fields);
        }
        Ok(())
    }

    fn insert_server(&self, record: &mut ServerRecord) -> Result<ServerId, StoreError> {
        let mut stored = self.to_rest(record)?;
        let mut doc = self.doc.lock();
        let id = doc.allocate_id();
        stored.id = id;
        doc.servers.push(stored);
        record.id = id;
        Ok(id)
    }

    fn update_server(&self, record: &ServerRecord) -> Result<bool, StoreError> {
        let stored = self.to_rest(record)?;
        let mut doc = self.doc.lock();
        match doc.servers.iter_mut().find(|s| s.id == record.id) {
            Some(slot) => {
                *slot = stored;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_server(&self, id: ServerId) -> Result<bool, StoreError> {
        let mut doc = self.doc.lock();
        let before = doc.servers.len();
        doc.servers.retain(|s| s.id != id);
        Ok(doc.servers.len() != before)
    }
}

/// [`ServerStore`] persisted as a JSON document.
///
/// Every successful mutation rewrites the file through a temporary sibling
/// and a rename, so a crash never leaves a half-written document behind.
pub struct JsonFileStore {
    path: PathBuf,
    memory: MemoryStore,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with_sealer(path, Arc::new(Base64Sealer))
    }

    pub fn open_with_sealer(path: impl Into<PathBuf>, sealer: Arc<dyn FieldSealer>) -> Result<Self, StoreError> {
        let path = path.into();
        let doc = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|e| StoreError::Io(path.clone(), e))?;
            serde_json::from_str(&contents).map_err(|e| StoreError::Parse(path.clone(), e))?
        } else {
            StoreDocument::default()
        };
        tracing::debug!(path = %path.display(), servers = doc.servers.len(), "opened server store");
        Ok(Self {
            path,
            memory: MemoryStore::from_document(doc, sealer),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_document(&self, doc: &StoreDocument) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(doc).map_err(StoreError::Serialize)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(parent.to_path_buf(), e))?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| StoreError::Io(tmp.clone(), e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StoreError::Io(self.path.clone(), e))?;
        Ok(())
    }

    /// Run `mutate` against the in-memory document and persist the result
    /// when `changed` says so. A failed write restores the previous document.
    fn commit<T>(
        &self,
        mutate: impl FnOnce(&MemoryStore) -> Result<T, StoreError>,
        changed: impl FnOnce(&T) -> bool,
    ) -> Result<T, StoreError> {
        let _guard = self.write_lock.lock();
        let before = self.memory.document();
        let out = mutate(&self.memory)?;
        if changed(&out) {
            if let Err(e) = self.write_document(&self.memory.document()) {
                tracing::warn!(path = %self.path.display(), "store write failed, rolled back: {e}");
                self.memory.restore(before);
                return Err(e);
            }
        }
        Ok(out)
    }
}

impl ServerStore for JsonFileStore {
    fn get_servers(&self) -> Result<Vec<ServerRecord>, StoreError> {
        self.memory.get_servers()
    }

    fn decrypt_to_working_memory(&self, record: &mut ServerRecord) -> Result<(), StoreError> {
        self.memory.decrypt_to_working_memory(record)
    }

    fn insert_server(&self, record: &mut ServerRecord) -> Result<ServerId, StoreError> {
        let previous = record.id;
        let mut staged = record.clone();
        let id = self.commit(|memory| memory.insert_server(&mut staged), |_| true);
        match id {
            Ok(id) => {
                record.id = id;
                Ok(id)
            }
            Err(e) => {
                record.id = previous;
                Err(e)
            }
        }
    }

    fn update_server(&self, record: &ServerRecord) -> Result<bool, StoreError> {
        self.commit(|memory| memory.update_server(record), |updated| *updated)
    }

    fn delete_server(&self, id: ServerId) -> Result<bool, StoreError> {
        self.commit(|memory| memory.delete_server(id), |deleted| *deleted)
    }
}
