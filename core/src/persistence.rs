//! The persistence capability the guard observes and gates.
//!
//! The guard never implements a store. It needs exactly three things from
//! one: whether unsaved changes exist, a way to persist them, and a place
//! to put the tracking hint.
//!
//! # Dyn Compatibility
//!
//! [`Persistence::persist`] returns an explicit `Pin<Box<dyn Future>>` so the
//! trait can be used as `Arc<dyn Persistence>`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

use crate::context::TrackingHint;
use crate::violation::GuardViolation;

/// Future returned by [`Persistence::persist`].
pub type PersistFuture<'a> = Pin<Box<dyn Future<Output = Result<usize, PersistenceError>> + Send + 'a>>;

/// Errors returned by a persistence capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// The guard vetoed the attempt before it reached the store.
    #[error(transparent)]
    Violation(#[from] GuardViolation),

    /// The store rejected or failed the write.
    #[error("Store error: {0}")]
    Store(String),

    /// A conflicting concurrent write was detected.
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl PersistenceError {
    /// The guard violation behind this error, if any.
    #[must_use]
    pub const fn violation(&self) -> Option<&GuardViolation> {
        match self {
            Self::Violation(violation) => Some(violation),
            Self::Store(_) | Self::Conflict(_) => None,
        }
    }
}

/// How much change tracking the persistence layer should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TrackingMode {
    /// Track all entity changes.
    #[default]
    Full,
    /// Track as little as possible.
    Minimal,
}

impl From<TrackingHint> for TrackingMode {
    fn from(hint: TrackingHint) -> Self {
        match hint {
            TrackingHint::Tracked => Self::Full,
            TrackingHint::Untracked => Self::Minimal,
        }
    }
}

/// Store-access capability observed by the guard.
///
/// Implementations use interior mutability: a single instance is shared via
/// `Arc` between the middleware and the handlers of one request.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` so requests can resume on any worker.
pub trait Persistence: Send + Sync + 'static {
    /// Whether mutations exist that have not been committed.
    fn has_pending_changes(&self) -> bool;

    /// Commit pending changes, returning how many were written.
    fn persist(&self) -> PersistFuture<'_>;

    /// Synchronous variant of [`Persistence::persist`].
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the store rejects the write.
    fn persist_blocking(&self) -> Result<usize, PersistenceError>;

    /// Set the tracking mode hint.
    fn set_tracking_mode(&self, mode: TrackingMode);

    /// Current tracking mode.
    fn tracking_mode(&self) -> TrackingMode;
}

impl<P: Persistence + ?Sized> Persistence for Arc<P> {
    fn has_pending_changes(&self) -> bool {
        (**self).has_pending_changes()
    }

    fn persist(&self) -> PersistFuture<'_> {
        (**self).persist()
    }

    fn persist_blocking(&self) -> Result<usize, PersistenceError> {
        (**self).persist_blocking()
    }

    fn set_tracking_mode(&self, mode: TrackingMode) {
        (**self).set_tracking_mode(mode);
    }

    fn tracking_mode(&self) -> TrackingMode {
        (**self).tracking_mode()
    }
}

/// Hands out the persistence instance of a request.
///
/// By convention each call returns a fresh instance (one unit of work per
/// request). Implemented for closures returning `Arc<P>`.
pub trait PersistenceProvider: Send + Sync + 'static {
    /// The persistence type handed out.
    type Persistence: Persistence;

    /// Acquire the instance for a new request.
    fn acquire(&self) -> Arc<Self::Persistence>;
}

impl<F, P> PersistenceProvider for F
where
    F: Fn() -> Arc<P> + Send + Sync + 'static,
    P: Persistence,
{
    type Persistence = P;

    fn acquire(&self) -> Arc<P> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::violation::ViolationCause;

    #[test]
    fn test_tracking_mode_from_hint() {
        assert_eq!(TrackingMode::from(TrackingHint::Tracked), TrackingMode::Full);
        assert_eq!(TrackingMode::from(TrackingHint::Untracked), TrackingMode::Minimal);
    }

    #[test]
    fn test_violation_accessor() {
        let err = PersistenceError::from(GuardViolation::new(ViolationCause::Forbidden));
        assert_eq!(err.violation().map(GuardViolation::cause), Some(ViolationCause::Forbidden));
        assert!(PersistenceError::Store("disk full".to_string()).violation().is_none());
    }

    #[test]
    fn test_violation_display_is_transparent() {
        let violation = GuardViolation::new(ViolationCause::Forbidden);
        let err = PersistenceError::from(violation);
        assert_eq!(err.to_string(), violation.to_string());
    }
}
