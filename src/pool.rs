//! Pool of live session windows, at most one per server.
//!
//! A session is hosted either in the tabbed main window or in an exclusive
//! full-screen presentation. Promotion hands out a [`FullScreen`] value that
//! owns the presentation: dropping or closing it ends the pool registration,
//! giving it back through [`SessionWindowPool::demote_from_full_screen`]
//! returns the session to the tabs.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

use crate::events::{ListenerId, Listeners};
use crate::record::{ServerId, ServerRecord};

/// Identity of one full-screen presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FullScreenId(u64);

/// Presentation context currently owning a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Host {
    Detached,
    Tabs,
    FullScreen(FullScreenId),
}

/// A live connection to a server, rendered by whichever host owns it.
pub trait Session: Send + Sync + 'static {
    fn title(&self) -> String;
    fn icon(&self) -> Option<String>;
    /// Move the session's surface to `host`. The pool always detaches
    /// before attaching to a new host.
    fn reparent(&self, host: Host);
    /// Release the session's resources.
    fn close(&self);
    /// Fires when the session ends on its own (remote disconnect, process
    /// exit).
    fn cancelled(&self) -> CancellationToken;
}

/// Builds sessions for servers.
pub trait SessionFactory<S> {
    fn create(&self, server: &ServerRecord) -> anyhow::Result<S>;
}

impl<S, F> SessionFactory<S> for F
where
    F: Fn(&ServerRecord) -> anyhow::Result<S>,
{
    fn create(&self, server: &ServerRecord) -> anyhow::Result<S> {
        self(server)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid server id: {0}")]
    InvalidId(ServerId),
    #[error("failed to open session for server {server}: {source}")]
    Factory {
        server: ServerId,
        #[source]
        source: anyhow::Error,
    },
    #[error("session for server {0} is not registered")]
    NotRegistered(ServerId),
    #[error("session for server {0} is already full screen")]
    AlreadyFullScreen(ServerId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Opened { server: ServerId },
    Promoted { server: ServerId, full_screen: FullScreenId },
    Demoted { server: ServerId },
    Closed { server: ServerId },
}

/// Shared reference to a pooled session.
///
/// Cloning the handle does not clone the session; two handles are the same
/// session when [`SessionHandle::ptr_eq`] holds.
pub struct SessionHandle<S> {
    server: ServerId,
    session: Arc<S>,
}

impl<S> Clone for SessionHandle<S> {
    fn clone(&self) -> Self {
        Self {
            server: self.server,
            session: self.session.clone(),
        }
    }
}

impl<S> std::fmt::Debug for SessionHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl<S> SessionHandle<S> {
    pub fn server_id(&self) -> ServerId {
        self.server
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn ptr_eq(&self, other: &SessionHandle<S>) -> bool {
        Arc::ptr_eq(&self.session, &other.session)
    }
}

impl<S> std::ops::Deref for SessionHandle<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

struct Entry<S> {
    handle: SessionHandle<S>,
    host: Host,
    title: String,
    icon: Option<String>,
}

struct PoolInner<S> {
    entries: HashMap<ServerId, Entry<S>>,
}

impl<S> PoolInner<S> {
    /// Remove the entry for `handle`'s server if it still holds `handle`.
    fn remove_same(&mut self, handle: &SessionHandle<S>) -> Option<Entry<S>> {
        match self.entries.get(&handle.server) {
            Some(entry) if entry.handle.ptr_eq(handle) => self.entries.remove(&handle.server),
            _ => None,
        }
    }
}

/// Maps server identities to their single live session.
pub struct SessionWindowPool<S> {
    inner: Arc<Mutex<PoolInner<S>>>,
    listeners: Arc<Listeners<PoolEvent>>,
    next_full_screen: Arc<AtomicU64>,
}

impl<S> Clone for SessionWindowPool<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            listeners: self.listeners.clone(),
            next_full_screen: self.next_full_screen.clone(),
        }
    }
}

impl<S: Session> Default for SessionWindowPool<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Session> SessionWindowPool<S> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                entries: HashMap::new(),
            })),
            listeners: Arc::new(Listeners::new()),
            next_full_screen: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&PoolEvent) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Return the session for `server`, opening one through `factory` if
    /// none is registered. The factory is never invoked for a server that
    /// already has a session.
    pub fn open<F>(&self, server: &ServerRecord, factory: &F) -> Result<SessionHandle<S>, PoolError>
    where
        F: SessionFactory<S> + ?Sized,
    {
        let id = server.id;
        if !id.is_assigned() {
            return Err(PoolError::InvalidId(id));
        }
        if let Some(existing) = self.get(id) {
            tracing::debug!(server = %id, "session already open");
            return Ok(existing);
        }

        // The factory runs without the lock held so it may consult the pool.
        let session = factory
            .create(server)
            .map_err(|source| PoolError::Factory { server: id, source })?;
        let handle = SessionHandle {
            server: id,
            session: Arc::new(session),
        };
        let icon = handle.icon().or_else(|| server.icon.clone());

        {
            let mut inner = self.inner.lock();
            if let Some(existing) = inner.entries.get(&id) {
                // Lost a race with another open for the same server.
                let existing = existing.handle.clone();
                drop(inner);
                handle.close();
                return Ok(existing);
            }
            inner.entries.insert(
                id,
                Entry {
                    handle: handle.clone(),
                    host: Host::Tabs,
                    title: server.title(),
                    icon,
                },
            );
        }

        handle.reparent(Host::Tabs);
        tracing::info!(server = %id, name = %server.display_name, "session opened");
        self.listeners.emit(&PoolEvent::Opened { server: id });
        Ok(handle)
    }

    /// Move `handle` from the tabs into a new exclusive full-screen
    /// presentation.
    pub fn promote_to_full_screen(&self, handle: &SessionHandle<S>) -> Result<FullScreen<S>, PoolError> {
        let server = handle.server;
        let full_screen = FullScreenId(self.next_full_screen.fetch_add(1, Ordering::Relaxed));
        let (title, icon) = {
            let mut inner = self.inner.lock();
            let entry = inner
                .entries
                .get_mut(&server)
                .filter(|e| e.handle.ptr_eq(handle))
                .ok_or(PoolError::NotRegistered(server))?;
            if matches!(entry.host, Host::FullScreen(_)) {
                return Err(PoolError::AlreadyFullScreen(server));
            }
            entry.host = Host::FullScreen(full_screen);
            (entry.title.clone(), entry.icon.clone())
        };

        handle.reparent(Host::Detached);
        handle.reparent(Host::FullScreen(full_screen));
        tracing::info!(server = %server, "session promoted to full screen");
        self.listeners.emit(&PoolEvent::Promoted { server, full_screen });

        Ok(FullScreen {
            id: full_screen,
            handle: handle.clone(),
            title,
            icon,
            pool: Arc::downgrade(&self.inner),
            listeners: self.listeners.clone(),
            armed: true,
        })
    }

    /// Return a full-screen session to the tabs. The registration stays.
    pub fn demote_from_full_screen(&self, mut full_screen: FullScreen<S>) -> Result<SessionHandle<S>, PoolError> {
        full_screen.armed = false;
        let handle = full_screen.handle.clone();
        let server = handle.server;
        {
            let mut inner = self.inner.lock();
            let entry = inner
                .entries
                .get_mut(&server)
                .filter(|e| e.handle.ptr_eq(&handle) && e.host == Host::FullScreen(full_screen.id))
                .ok_or(PoolError::NotRegistered(server))?;
            entry.host = Host::Tabs;
        }

        handle.reparent(Host::Detached);
        handle.reparent(Host::Tabs);
        tracing::info!(server = %server, "session returned from full screen");
        self.listeners.emit(&PoolEvent::Demoted { server });
        Ok(handle)
    }

    /// Close the session for `server`. Returns `false` if none was open.
    pub fn close(&self, server: ServerId) -> bool {
        let Some(entry) = self.inner.lock().entries.remove(&server) else {
            return false;
        };
        release(&entry.handle);
        tracing::info!(server = %server, "session closed");
        self.listeners.emit(&PoolEvent::Closed { server });
        true
    }

    /// Close every session.
    pub fn close_all(&self) {
        let drained: Vec<Entry<S>> = self.inner.lock().entries.drain().map(|(_, e)| e).collect();
        for entry in drained {
            release(&entry.handle);
            self.listeners.emit(&PoolEvent::Closed { server: entry.handle.server });
        }
    }

    /// Drop the registration once the session ends on its own.
    ///
    /// The handle's identity is checked on removal, so a session that was
    /// closed and reopened in the meantime is left alone. Must be called
    /// from within a tokio runtime.
    pub fn monitor_session_exit(&self, handle: &SessionHandle<S>) -> tokio::task::JoinHandle<()> {
        let token = handle.cancelled();
        let handle = handle.clone();
        let pool = self.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            let removed = pool.inner.lock().remove_same(&handle);
            match removed {
                Some(_) => {
                    handle.reparent(Host::Detached);
                    tracing::info!(server = %handle.server, "session ended");
                    pool.listeners.emit(&PoolEvent::Closed { server: handle.server });
                }
                None => {
                    tracing::debug!(server = %handle.server, "session ended (already removed)");
                }
            }
        })
    }

    // ---- queries ----

    pub fn get(&self, server: ServerId) -> Option<SessionHandle<S>> {
        self.inner.lock().entries.get(&server).map(|e| e.handle.clone())
    }

    pub fn contains(&self, server: ServerId) -> bool {
        self.inner.lock().entries.contains_key(&server)
    }

    pub fn host_of(&self, server: ServerId) -> Option<Host> {
        self.inner.lock().entries.get(&server).map(|e| e.host)
    }

    pub fn is_full_screen(&self, server: ServerId) -> bool {
        matches!(self.host_of(server), Some(Host::FullScreen(_)))
    }

    pub fn ids(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self.inner.lock().entries.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn release<S: Session>(handle: &SessionHandle<S>) {
    handle.reparent(Host::Detached);
    handle.close();
}

/// Exclusive full-screen presentation of one session.
///
/// Closing (or dropping) it removes the pool registration for its server,
/// whether or not the session itself is still alive.
pub struct FullScreen<S: Session> {
    id: FullScreenId,
    handle: SessionHandle<S>,
    title: String,
    icon: Option<String>,
    pool: Weak<Mutex<PoolInner<S>>>,
    listeners: Arc<Listeners<PoolEvent>>,
    armed: bool,
}

impl<S: Session> std::fmt::Debug for FullScreen<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullScreen")
            .field("id", &self.id)
            .field("server", &self.handle.server)
            .field("title", &self.title)
            .finish_non_exhaustive()
    }
}

impl<S: Session> FullScreen<S> {
    pub fn id(&self) -> FullScreenId {
        self.id
    }

    pub fn server_id(&self) -> ServerId {
        self.handle.server
    }

    /// "display name - subtitle" of the server.
    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn icon(&self) -> Option<&str> {
        self.icon.as_deref()
    }

    pub fn handle(&self) -> &SessionHandle<S> {
        &self.handle
    }

    /// The presentation's close event.
    pub fn close(self) {}
}

impl<S: Session> Drop for FullScreen<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let removed = pool.lock().remove_same(&self.handle);
        if removed.is_some() {
            release(&self.handle);
            tracing::info!(server = %self.handle.server, "full screen closed; session removed from pool");
            self.listeners.emit(&PoolEvent::Closed { server: self.handle.server });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ConnectionFields, ProtocolKind};
    use std::sync::atomic::AtomicUsize;

    struct FakeSession {
        title: String,
        hosts: Mutex<Vec<Host>>,
        closed: AtomicUsize,
        token: CancellationToken,
    }

    impl FakeSession {
        fn new(title: &str) -> Self {
            Self {
                title: title.to_string(),
                hosts: Mutex::new(Vec::new()),
                closed: AtomicUsize::new(0),
                token: CancellationToken::new(),
            }
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

    fn server(id: i64, name: &str) -> ServerRecord {
        let mut record = ServerRecord::new(name, ProtocolKind::Vnc, ConnectionFields::default()).with_subtitle("lab");
        record.id = ServerId(id);
        record
    }

    fn factory(record: &ServerRecord) -> anyhow::Result<FakeSession> {
        Ok(FakeSession::new(&record.display_name))
    }

    #[test]
    fn open_registers_in_tabs() {
        let pool = SessionWindowPool::<FakeSession>::new();
        let handle = pool.open(&server(1, "a"), &factory).unwrap();
        assert_eq!(pool.host_of(ServerId(1)), Some(Host::Tabs));
        assert_eq!(*handle.hosts.lock(), vec![Host::Tabs]);
        assert_eq!(handle.title(), "a");
    }

    #[test]
    fn open_rejects_unassigned_id() {
        let pool = SessionWindowPool::<FakeSession>::new();
        let err = pool.open(&server(0, "new"), &factory).unwrap_err();
        assert!(matches!(err, PoolError::InvalidId(ServerId(0))));
        assert!(pool.is_empty());
    }

    #[test]
    fn factory_failure_registers_nothing() {
        let pool = SessionWindowPool::<FakeSession>::new();
        let failing = |_: &ServerRecord| -> anyhow::Result<FakeSession> { Err(anyhow::anyhow!("connection refused")) };
        let err = pool.open(&server(3, "c"), &failing).unwrap_err();
        assert!(matches!(err, PoolError::Factory { server: ServerId(3), .. }));
        assert!(!pool.contains(ServerId(3)));
    }

    #[test]
    fn same_display_name_does_not_share_sessions() {
        let pool = SessionWindowPool::<FakeSession>::new();
        let a = pool.open(&server(1, "twin"), &factory).unwrap();
        let b = pool.open(&server(2, "twin"), &factory).unwrap();
        assert!(!a.ptr_eq(&b));
        assert_eq!(pool.ids(), vec![ServerId(1), ServerId(2)]);
    }

    #[test]
    fn promote_detaches_before_attaching() {
        let pool = SessionWindowPool::<FakeSession>::new();
        let handle = pool.open(&server(1, "a"), &factory).unwrap();
        let fs = pool.promote_to_full_screen(&handle).unwrap();
        assert_eq!(fs.title(), "a - lab");
        assert_eq!(
            *handle.hosts.lock(),
            vec![Host::Tabs, Host::Detached, Host::FullScreen(fs.id())]
        );
        assert!(pool.is_full_screen(ServerId(1)));
    }

    #[test]
    fn promote_twice_is_rejected() {
        let pool = SessionWindowPool::<FakeSession>::new();
        let handle = pool.open(&server(1, "a"), &factory).unwrap();
        let _fs = pool.promote_to_full_screen(&handle).unwrap();
        let err = pool.promote_to_full_screen(&handle).unwrap_err();
        assert!(matches!(err, PoolError::AlreadyFullScreen(ServerId(1))));
    }

    #[test]
    fn demote_keeps_registration() {
        let pool = SessionWindowPool::<FakeSession>::new();
        let handle = pool.open(&server(1, "a"), &factory).unwrap();
        let fs = pool.promote_to_full_screen(&handle).unwrap();
        let back = pool.demote_from_full_screen(fs).unwrap();
        assert!(back.ptr_eq(&handle));
        assert_eq!(pool.host_of(ServerId(1)), Some(Host::Tabs));
        assert_eq!(handle.closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_full_screen_closes_session() {
        let pool = SessionWindowPool::<FakeSession>::new();
        let handle = pool.open(&server(1, "a"), &factory).unwrap();
        let fs = pool.promote_to_full_screen(&handle).unwrap();
        drop(fs);
        assert!(!pool.contains(ServerId(1)));
        assert_eq!(handle.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_full_screen_does_not_evict_reopened_session() {
        let pool = SessionWindowPool::<FakeSession>::new();
        let first = pool.open(&server(1, "a"), &factory).unwrap();
        let fs = pool.promote_to_full_screen(&first).unwrap();
        assert!(pool.close(ServerId(1)));
        let second = pool.open(&server(1, "a"), &factory).unwrap();

        fs.close();
        let current = pool.get(ServerId(1)).expect("reopened session must survive");
        assert!(current.ptr_eq(&second));
    }

    #[test]
    fn close_is_idempotent() {
        let pool = SessionWindowPool::<FakeSession>::new();
        let handle = pool.open(&server(1, "a"), &factory).unwrap();
        assert!(pool.close(ServerId(1)));
        assert!(!pool.close(ServerId(1)));
        assert_eq!(handle.closed.load(Ordering::SeqCst), 1);
        assert_eq!(handle.hosts.lock().last(), Some(&Host::Detached));
    }

    #[test]
    fn close_all_releases_everything() {
        let pool = SessionWindowPool::<FakeSession>::new();
        let a = pool.open(&server(1, "a"), &factory).unwrap();
        let b = pool.open(&server(2, "b"), &factory).unwrap();
        pool.close_all();
        assert!(pool.is_empty());
        assert_eq!(a.closed.load(Ordering::SeqCst), 1);
        assert_eq!(b.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn events_follow_lifecycle() {
        let pool = SessionWindowPool::<FakeSession>::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        pool.add_listener(move |ev| sink.lock().push(ev.clone()));

        let handle = pool.open(&server(7, "a"), &factory).unwrap();
        let fs = pool.promote_to_full_screen(&handle).unwrap();
        let fs_id = fs.id();
        let handle = pool.demote_from_full_screen(fs).unwrap();
        pool.close(handle.server_id());

        assert_eq!(
            *events.lock(),
            vec![
                PoolEvent::Opened { server: ServerId(7) },
                PoolEvent::Promoted { server: ServerId(7), full_screen: fs_id },
                PoolEvent::Demoted { server: ServerId(7) },
                PoolEvent::Closed { server: ServerId(7) },
            ]
        );
    }

    #[tokio::test]
    async fn session_exit_removes_registration() {
        let pool = SessionWindowPool::<FakeSession>::new();
        let handle = pool.open(&server(1, "a"), &factory).unwrap();
        let monitor = pool.monitor_session_exit(&handle);

        handle.token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), monitor)
            .await
            .expect("monitor should finish")
            .expect("monitor task should not panic");
        assert!(!pool.contains(ServerId(1)));
    }

    #[tokio::test]
    async fn session_exit_ignores_replaced_session() {
        let pool = SessionWindowPool::<FakeSession>::new();
        let first = pool.open(&server(1, "a"), &factory).unwrap();
        let monitor = pool.monitor_session_exit(&first);
        pool.close(ServerId(1));
        let second = pool.open(&server(1, "a"), &factory).unwrap();

        first.token.cancel();
        monitor.await.unwrap();
        assert!(pool.get(ServerId(1)).unwrap().ptr_eq(&second));
    }
}
