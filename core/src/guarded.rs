//! Decorator that gates every persist attempt of one request.
//!
//! Handlers receive a [`GuardedPersistence`] instead of the raw capability.
//! It implements [`Persistence`] itself, so code that persists through it
//! cannot bypass the guard, whichever path initiated the call.

use std::fmt;
use std::sync::Arc;

use crate::context::GuardDecision;
use crate::persistence::{PersistFuture, Persistence, PersistenceError, TrackingMode};
use crate::registry::PersistenceGuardRegistry;
use crate::violation::{GuardViolation, ViolationSlot};

/// Guarded view of a request's persistence instance.
///
/// Carries the request's frozen [`GuardDecision`] and its [`ViolationSlot`].
/// Clones share the same instance, decision and slot.
pub struct GuardedPersistence<P> {
    inner: Arc<P>,
    decision: GuardDecision,
    registry: PersistenceGuardRegistry,
    violations: ViolationSlot,
}

impl<P> Clone for GuardedPersistence<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            decision: self.decision,
            registry: self.registry.clone(),
            violations: self.violations.clone(),
        }
    }
}

impl<P> fmt::Debug for GuardedPersistence<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedPersistence")
            .field("type", &std::any::type_name::<P>())
            .field("decision", &self.decision)
            .field("violation", &self.violations.first())
            .finish_non_exhaustive()
    }
}

impl<P: Persistence> GuardedPersistence<P> {
    /// Wrap `inner` with the decision of the current request.
    #[must_use]
    pub const fn new(
        inner: Arc<P>,
        decision: GuardDecision,
        registry: PersistenceGuardRegistry,
        violations: ViolationSlot,
    ) -> Self {
        Self {
            inner,
            decision,
            registry,
            violations,
        }
    }

    /// The decision attached to this wrapper.
    #[must_use]
    pub const fn decision(&self) -> GuardDecision {
        self.decision
    }

    /// The wrapped instance.
    ///
    /// Persisting directly on it is vetoed only if the implementation calls
    /// [`intercept_persist`](crate::registry::intercept_persist); unsaved
    /// mutations are still caught at response time.
    #[must_use]
    pub const fn inner(&self) -> &Arc<P> {
        &self.inner
    }

    /// The request's violation slot.
    #[must_use]
    pub const fn violations(&self) -> &ViolationSlot {
        &self.violations
    }

    fn gate(&self) -> Result<(), GuardViolation> {
        self.registry
            .guarded_persist(&self.inner, self.decision)
            .map_err(|violation| self.violations.raise(violation.cause()))
    }
}

impl<P: Persistence> Persistence for GuardedPersistence<P> {
    fn has_pending_changes(&self) -> bool {
        self.inner.has_pending_changes()
    }

    fn persist(&self) -> PersistFuture<'_> {
        Box::pin(async move {
            self.gate()?;
            self.inner.persist().await
        })
    }

    fn persist_blocking(&self) -> Result<usize, PersistenceError> {
        self.gate()?;
        self.inner.persist_blocking()
    }

    fn set_tracking_mode(&self, mode: TrackingMode) {
        self.inner.set_tracking_mode(mode);
    }

    fn tracking_mode(&self) -> TrackingMode {
        self.inner.tracking_mode()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::CountingPersistence;
    use crate::violation::ViolationCause;

    fn guarded(decision: GuardDecision) -> (GuardedPersistence<CountingPersistence>, PersistenceGuardRegistry) {
        let registry = PersistenceGuardRegistry::new();
        let inner = Arc::new(CountingPersistence::default());
        let wrapper = GuardedPersistence::new(inner, decision, registry.clone(), ViolationSlot::new());
        (wrapper, registry)
    }

    #[tokio::test]
    async fn test_forbidden_persist_never_reaches_store() {
        let (wrapper, registry) = guarded(GuardDecision::FORBID);
        let _registration = registry.register(wrapper.inner(), wrapper.decision()).unwrap();
        wrapper.inner().stage(3);

        let err = wrapper.persist().await.unwrap_err();

        assert_eq!(err.violation().unwrap().cause(), ViolationCause::Forbidden);
        assert_eq!(wrapper.inner().persist_calls(), 0);
        assert_eq!(wrapper.inner().committed(), 0);
        assert_eq!(wrapper.violations().take().unwrap().cause(), ViolationCause::Forbidden);
    }

    #[test]
    fn test_forbidden_blocking_persist() {
        let (wrapper, _registry) = guarded(GuardDecision::FORBID);
        wrapper.inner().stage(1);

        assert!(wrapper.persist_blocking().is_err());
        assert_eq!(wrapper.inner().persist_calls(), 0);
        assert!(wrapper.violations().is_raised());
    }

    #[tokio::test]
    async fn test_permitted_persist_commits() {
        let (wrapper, registry) = guarded(GuardDecision::PERMIT);
        let _registration = registry.register(wrapper.inner(), wrapper.decision()).unwrap();
        wrapper.inner().stage(2);

        assert_eq!(wrapper.persist().await.unwrap(), 2);
        assert!(!wrapper.has_pending_changes());
        assert_eq!(wrapper.inner().committed(), 2);
        assert!(!wrapper.violations().is_raised());
    }

    #[test]
    fn test_tracking_mode_delegates() {
        let (wrapper, _registry) = guarded(GuardDecision::FORBID);
        wrapper.set_tracking_mode(TrackingMode::Minimal);
        assert_eq!(wrapper.inner().tracking_mode(), TrackingMode::Minimal);
    }

    #[test]
    fn test_clones_share_violation_slot() {
        let (wrapper, _registry) = guarded(GuardDecision::FORBID);
        let clone = wrapper.clone();
        assert!(clone.persist_blocking().is_err());
        assert!(wrapper.violations().is_raised());
    }
}
