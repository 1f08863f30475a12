//! Guard lifecycle counters and the per-request teardown guard.

use safe_persist_core::{GuardContext, Registration, ViolationCause};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use uuid::Uuid;

#[derive(Debug, Default)]
struct StatsInner {
    active: AtomicUsize,
    entered: AtomicU64,
    torn_down: AtomicU64,
    violations: AtomicU64,
}

/// Counters of one guard layer. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct GuardStats {
    inner: Arc<StatsInner>,
}

impl GuardStats {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests currently between entry and teardown.
    #[must_use]
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Requests that entered the guard.
    #[must_use]
    pub fn entered(&self) -> u64 {
        self.inner.entered.load(Ordering::SeqCst)
    }

    /// Requests whose guard state was torn down.
    #[must_use]
    pub fn torn_down(&self) -> u64 {
        self.inner.torn_down.load(Ordering::SeqCst)
    }

    /// Violations handled, as error responses or aborted streams.
    #[must_use]
    pub fn violations(&self) -> u64 {
        self.inner.violations.load(Ordering::SeqCst)
    }

    pub(crate) fn record_violation(&self, cause: ViolationCause) {
        self.inner.violations.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(cause = %cause, "Violation handled by guard middleware");
    }
}

/// Detaches a request's guard state exactly once, when dropped.
///
/// Owned by the middleware future and, on the success path, moved into the
/// response body so teardown happens when the body is finished or dropped.
#[derive(Debug)]
pub(crate) struct Teardown {
    stats: GuardStats,
    request_id: Uuid,
    registration: Option<Registration>,
}

impl Teardown {
    pub(crate) fn enter(stats: GuardStats, context: &GuardContext) -> Self {
        stats.inner.entered.fetch_add(1, Ordering::SeqCst);
        stats.inner.active.fetch_add(1, Ordering::SeqCst);
        metrics::gauge!("persistence_guard.active").increment(1.0);

        Self {
            stats,
            request_id: context.request_id(),
            registration: None,
        }
    }

    pub(crate) fn hold(&mut self, registration: Registration) {
        self.registration = Some(registration);
    }

    pub(crate) fn record_violation(&self, cause: ViolationCause) {
        self.stats.record_violation(cause);
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        // Release the registry association before the request counts as gone
        drop(self.registration.take());

        self.stats.inner.active.fetch_sub(1, Ordering::SeqCst);
        self.stats.inner.torn_down.fetch_add(1, Ordering::SeqCst);
        metrics::gauge!("persistence_guard.active").decrement(1.0);
        tracing::trace!(request_id = %self.request_id, "Persistence guard torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use safe_persist_core::Classification;

    #[test]
    fn test_teardown_balances_counters() {
        let stats = GuardStats::new();
        let context = GuardContext::new(Method::GET, Classification::Safe);

        let teardown = Teardown::enter(stats.clone(), &context);
        assert_eq!(stats.active(), 1);
        assert_eq!(stats.entered(), 1);
        assert_eq!(stats.torn_down(), 0);

        drop(teardown);
        assert_eq!(stats.active(), 0);
        assert_eq!(stats.torn_down(), 1);
    }

    #[test]
    fn test_record_violation() {
        let stats = GuardStats::new();
        stats.record_violation(ViolationCause::Forbidden);
        assert_eq!(stats.violations(), 1);
    }
}
