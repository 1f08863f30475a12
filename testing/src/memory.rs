//! In-memory persistence capability.
//!
//! Provides fast, deterministic persistence for guard tests:
//! - [`InMemoryStore`]: committed key/value state shared by all sessions
//! - [`InMemorySession`]: one unit of work with staged changes
//! - [`SharedSessionProvider`]: hands the same session to every request
//!
//! # Example
//!
//! ```
//! use safe_persist_testing::InMemoryStore;
//! use safe_persist_core::Persistence;
//!
//! let store = InMemoryStore::new();
//! let session = store.session();
//!
//! session.insert("apple", "red");
//! assert!(session.has_pending_changes());
//! assert_eq!(store.get("apple"), None);
//!
//! session.persist_blocking().unwrap();
//! assert_eq!(store.get("apple"), Some("red".to_string()));
//! ```

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Locks are never poisoned by this module

use safe_persist_core::{
    PersistFuture, Persistence, PersistenceError, PersistenceProvider, TrackingMode,
    intercept_persist,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// A staged, not yet committed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Insert or overwrite a key.
    Put {
        /// Key written.
        key: String,
        /// Value written.
        value: String,
    },
    /// Delete a key.
    Delete {
        /// Key deleted.
        key: String,
    },
}

#[derive(Debug, Default)]
struct StoreInner {
    data: RwLock<BTreeMap<String, String>>,
    sessions_opened: AtomicUsize,
    commits: AtomicUsize,
    fail_next_commit: AtomicBool,
}

/// Committed key/value state.
///
/// Cheap to clone; clones share state.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    inner: Arc<StoreInner>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with committed entries.
    #[must_use]
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::new();
        store
            .inner
            .data
            .write()
            .unwrap()
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        store
    }

    /// Open a new unit of work.
    #[must_use]
    pub fn session(&self) -> InMemorySession {
        self.inner.sessions_opened.fetch_add(1, Ordering::SeqCst);
        InMemorySession {
            store: self.clone(),
            pending: Mutex::new(Vec::new()),
            mode: Mutex::new(TrackingMode::Full),
            persist_calls: AtomicUsize::new(0),
            tracked_reads: AtomicUsize::new(0),
        }
    }

    /// Committed value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.data.read().unwrap().get(key).cloned()
    }

    /// Copy of all committed entries.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.inner.data.read().unwrap().clone()
    }

    /// Number of committed entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.data.read().unwrap().len()
    }

    /// Whether the store has no committed entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.data.read().unwrap().is_empty()
    }

    /// Number of successful commits.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }

    /// Number of sessions opened.
    #[must_use]
    pub fn sessions_opened(&self) -> usize {
        self.inner.sessions_opened.load(Ordering::SeqCst)
    }

    /// Make the next commit fail with a store error.
    pub fn fail_next_commit(&self) {
        self.inner.fail_next_commit.store(true, Ordering::SeqCst);
    }

    fn apply(&self, changes: Vec<Change>) -> Result<usize, PersistenceError> {
        if self.inner.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(PersistenceError::Store("simulated commit failure".to_string()));
        }

        let written = changes.len();
        let mut data = self.inner.data.write().unwrap();
        for change in changes {
            match change {
                Change::Put { key, value } => {
                    data.insert(key, value);
                },
                Change::Delete { key } => {
                    data.remove(&key);
                },
            }
        }
        drop(data);

        self.inner.commits.fetch_add(1, Ordering::SeqCst);
        Ok(written)
    }
}

impl PersistenceProvider for InMemoryStore {
    type Persistence = InMemorySession;

    fn acquire(&self) -> Arc<InMemorySession> {
        Arc::new(self.session())
    }
}

/// One unit of work against an [`InMemoryStore`].
///
/// Persisting consults the guard registry first, so a session belonging to a
/// request that does not permit mutation refuses to commit however it is
/// reached. Writes are staged until persisted. Reads see staged changes over
/// committed state. In [`TrackingMode::Full`] every read is recorded in the
/// session's identity bookkeeping; [`TrackingMode::Minimal`] skips that.
#[derive(Debug)]
pub struct InMemorySession {
    store: InMemoryStore,
    pending: Mutex<Vec<Change>>,
    mode: Mutex<TrackingMode>,
    persist_calls: AtomicUsize,
    tracked_reads: AtomicUsize,
}

impl InMemorySession {
    /// Stage an insert or overwrite.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.pending.lock().unwrap().push(Change::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Stage a delete.
    pub fn remove(&self, key: impl Into<String>) {
        self.pending
            .lock()
            .unwrap()
            .push(Change::Delete { key: key.into() });
    }

    /// Value of `key` as seen by this session.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.track_read();
        let staged = self
            .pending
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|change| match change {
                Change::Put { key: k, value } if k == key => Some(Some(value.clone())),
                Change::Delete { key: k } if k == key => Some(None),
                Change::Put { .. } | Change::Delete { .. } => None,
            });
        staged.unwrap_or_else(|| self.store.get(key))
    }

    /// All entries as seen by this session.
    #[must_use]
    pub fn list(&self) -> Vec<(String, String)> {
        self.track_read();
        let mut view = self.store.snapshot();
        for change in self.pending.lock().unwrap().iter() {
            match change {
                Change::Put { key, value } => {
                    view.insert(key.clone(), value.clone());
                },
                Change::Delete { key } => {
                    view.remove(key);
                },
            }
        }
        view.into_iter().collect()
    }

    /// Staged changes.
    #[must_use]
    pub fn pending(&self) -> Vec<Change> {
        self.pending.lock().unwrap().clone()
    }

    /// Drop staged changes without committing them.
    pub fn discard(&self) {
        self.pending.lock().unwrap().clear();
    }

    /// Number of persist attempts that reached this session.
    #[must_use]
    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    /// Number of reads recorded under full tracking.
    #[must_use]
    pub fn tracked_reads(&self) -> usize {
        self.tracked_reads.load(Ordering::SeqCst)
    }

    /// The store this session commits to.
    #[must_use]
    pub const fn store(&self) -> &InMemoryStore {
        &self.store
    }

    fn track_read(&self) {
        if self.tracking_mode() == TrackingMode::Full {
            self.tracked_reads.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Persistence for InMemorySession {
    fn has_pending_changes(&self) -> bool {
        !self.pending.lock().unwrap().is_empty()
    }

    fn persist(&self) -> PersistFuture<'_> {
        Box::pin(async move {
            // Commit happens on a later poll, like a real round-trip
            tokio::task::yield_now().await;
            self.persist_blocking()
        })
    }

    fn persist_blocking(&self) -> Result<usize, PersistenceError> {
        intercept_persist(self)?;
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        let changes = std::mem::take(&mut *self.pending.lock().unwrap());
        if changes.is_empty() {
            return Ok(0);
        }

        let staged = changes.clone();
        self.store.apply(changes).inspect_err(|_| {
            // Failed commits keep their changes staged
            self.pending.lock().unwrap().splice(0..0, staged);
        })
    }

    fn set_tracking_mode(&self, mode: TrackingMode) {
        *self.mode.lock().unwrap() = mode;
    }

    fn tracking_mode(&self) -> TrackingMode {
        *self.mode.lock().unwrap()
    }
}

/// Provider handing the same session to every request.
///
/// Real providers open one unit of work per request; this one exists to
/// exercise registry reuse and conflict handling.
#[derive(Debug, Clone)]
pub struct SharedSessionProvider {
    session: Arc<InMemorySession>,
}

impl SharedSessionProvider {
    /// Share one new session of `store`.
    #[must_use]
    pub fn new(store: &InMemoryStore) -> Self {
        Self {
            session: Arc::new(store.session()),
        }
    }

    /// The shared session.
    #[must_use]
    pub const fn session(&self) -> &Arc<InMemorySession> {
        &self.session
    }
}

impl PersistenceProvider for SharedSessionProvider {
    type Persistence = InMemorySession;

    fn acquire(&self) -> Arc<InMemorySession> {
        Arc::clone(&self.session)
    }
}
