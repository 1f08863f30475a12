//! # Safe Persist Core
//!
//! Request-scoped guards between HTTP request semantics and a transactional
//! store.
//!
//! A request classified as *safe* must never change persisted state. A
//! request classified as *mutating* must have persisted all of its changes
//! before any byte of its response leaves the process. This crate holds the
//! transport-independent half of that contract; `safe-persist-web` wires it
//! into axum/tower.
//!
//! ## Core Concepts
//!
//! - **Classification**: safe or mutating, decided once from the request method
//! - **`GuardContext`**: per-request record, frozen into a **`GuardDecision`**
//! - **`PersistenceGuardRegistry`**: maps persistence instances to decisions and
//!   vetoes forbidden persist attempts at the source
//! - **`GuardedPersistence`**: decorator handlers persist through
//! - **`ResponseCheckpoint`** / **`GuardedWriter`**: checks for unpersisted
//!   changes before response bytes are committed
//! - **`GuardViolation`**: the signal raised when a request breaks its decision
//!
//! ## Flow
//!
//! ```text
//! method ──classify──▶ GuardContext ──freeze──▶ GuardDecision
//!                                                  │
//!              ┌───────────────────────────────────┼─────────────────────┐
//!              ▼                                   ▼                     ▼
//!     registry.register(instance)      GuardedPersistence::persist   ResponseCheckpoint::check
//!                                        (Forbidden at source)       (UnsafedData / ModifiedData)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use safe_persist_core::*;
//!
//! let registry = PersistenceGuardRegistry::global();
//! let context = GuardContext::new(Method::GET, SafeMethods::default().classify(&Method::GET));
//! let violations = ViolationSlot::new();
//!
//! let session = Arc::new(MySession::default());
//! let _registration = registry.register(&session, context.decision())?;
//! let guarded = GuardedPersistence::new(session.clone(), context.decision(), registry, violations.clone());
//!
//! // A safe request may not persist
//! assert!(guarded.persist().await.is_err());
//! assert_eq!(violations.take().map(|v| v.cause()), Some(ViolationCause::Forbidden));
//! ```

pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod context;
pub mod guarded;
pub mod persistence;
pub mod registry;
pub mod violation;

// Re-export commonly used types
pub use checkpoint::{GuardedWriter, PendingProbe, ResponseCheckpoint, violation_from_io};
pub use classify::{Classification, Classifier, classify};
pub use config::{ConfigError, GuardConfig, GuardConfigBuilder, ResponderConfig, SafeMethods};
pub use context::{GuardContext, GuardDecision, TrackingHint};
pub use guarded::GuardedPersistence;
pub use http::Method;
pub use persistence::{
    PersistFuture, Persistence, PersistenceError, PersistenceProvider, TrackingMode,
};
pub use registry::{
    InterceptHook, PersistenceGuardRegistry, Registration, RegistryError, intercept_persist,
};
pub use violation::{GuardViolation, ViolationCause, ViolationSlot};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::persistence::{PersistFuture, Persistence, PersistenceError, TrackingMode};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Minimal persistence that counts staged and committed changes.
    #[derive(Debug, Default)]
    pub struct CountingPersistence {
        pending: AtomicUsize,
        committed: AtomicUsize,
        persist_calls: AtomicUsize,
        mode: Mutex<TrackingMode>,
    }

    impl CountingPersistence {
        pub fn stage(&self, changes: usize) {
            self.pending.fetch_add(changes, Ordering::SeqCst);
        }

        pub fn committed(&self) -> usize {
            self.committed.load(Ordering::SeqCst)
        }

        pub fn persist_calls(&self) -> usize {
            self.persist_calls.load(Ordering::SeqCst)
        }
    }

    impl Persistence for CountingPersistence {
        fn has_pending_changes(&self) -> bool {
            self.pending.load(Ordering::SeqCst) > 0
        }

        fn persist(&self) -> PersistFuture<'_> {
            Box::pin(async move { self.persist_blocking() })
        }

        fn persist_blocking(&self) -> Result<usize, PersistenceError> {
            self.persist_calls.fetch_add(1, Ordering::SeqCst);
            let written = self.pending.swap(0, Ordering::SeqCst);
            self.committed.fetch_add(written, Ordering::SeqCst);
            Ok(written)
        }

        fn set_tracking_mode(&self, mode: TrackingMode) {
            if let Ok(mut current) = self.mode.lock() {
                *current = mode;
            }
        }

        fn tracking_mode(&self) -> TrackingMode {
            self.mode.lock().map(|mode| *mode).unwrap_or_default()
        }
    }
}
