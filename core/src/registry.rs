//! Process-wide association between persistence instances and guard decisions.
//!
//! The registry answers one question for an attempted persist: *which
//! decision governs this instance right now?* Entries are keyed by the
//! identity of the instance's `Arc` allocation and hold only a `Weak`
//! reference, so the registry never keeps a unit of work alive. Each entry is
//! owned by one or more [`Registration`] handles; dropping the last one
//! removes the association.
//!
//! Interception of a persistence type is installed lazily the first time the
//! type is registered. Installation happens exactly once per type even under
//! concurrent first use; every caller observes the same [`InterceptHook`].
//!
//! Persistence implementations call [`intercept_persist`] at the top of their
//! own persist operations, so an attempt made directly on the raw instance is
//! vetoed the same way as one made through `GuardedPersistence`. The registry
//! consulted is the one scoped around the current task with
//! [`PersistenceGuardRegistry::scope`], or the process-wide one.
//!
//! # Example
//!
//! ```ignore
//! let registry = PersistenceGuardRegistry::new();
//! let session = Arc::new(MySession::default());
//!
//! let registration = registry.register(&session, GuardDecision::FORBID)?;
//! assert_eq!(registry.lookup(&session), Some(GuardDecision::FORBID));
//!
//! drop(registration);
//! assert_eq!(registry.lookup(&session), None);
//! ```

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use thiserror::Error;

use crate::context::GuardDecision;
use crate::persistence::Persistence;
use crate::violation::{GuardViolation, ViolationCause, ViolationSlot};

tokio::task_local! {
    static SCOPED_REGISTRY: PersistenceGuardRegistry;
}

/// Registry errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The instance is already registered, for a live request, with another decision.
    #[error(
        "Persistence instance of type {type_name} is already guarded with \
         mutation_permitted={existing}, cannot register mutation_permitted={requested}"
    )]
    ConflictingDecision {
        /// Type name of the instance.
        type_name: &'static str,
        /// Decision already on record.
        existing: bool,
        /// Decision that was requested.
        requested: bool,
    },
}

/// Identity of a persistence instance (address of its `Arc` allocation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct InstanceKey(usize);

impl InstanceKey {
    fn of<P: ?Sized>(instance: &Arc<P>) -> Self {
        Self(Arc::as_ptr(instance).cast::<()>().addr())
    }

    // Same address as `of` for the `Arc` that owns `instance`
    fn of_ref<P: ?Sized>(instance: &P) -> Self {
        Self(std::ptr::from_ref(instance).cast::<()>().addr())
    }
}

struct GuardEntry {
    instance: Weak<dyn Any + Send + Sync>,
    decision: GuardDecision,
    holders: usize,
    generation: u64,
    violations: Option<ViolationSlot>,
}

impl GuardEntry {
    fn new(instance: Weak<dyn Any + Send + Sync>, decision: GuardDecision, generation: u64) -> Self {
        Self {
            instance,
            decision,
            holders: 1,
            generation,
            violations: None,
        }
    }

    fn is_alive(&self) -> bool {
        self.instance.strong_count() > 0
    }
}

/// Interception installed for one persistence type.
#[derive(Debug)]
pub struct InterceptHook {
    type_name: &'static str,
    allowed: AtomicU64,
    blocked: AtomicU64,
}

impl InterceptHook {
    fn new(type_name: &'static str) -> Self {
        Self {
            type_name,
            allowed: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
        }
    }

    /// Name of the intercepted type.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Persist attempts let through.
    #[must_use]
    pub fn allowed(&self) -> u64 {
        self.allowed.load(Ordering::Relaxed)
    }

    /// Persist attempts vetoed.
    #[must_use]
    pub fn blocked(&self) -> u64 {
        self.blocked.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct RegistryInner {
    entries: DashMap<InstanceKey, GuardEntry>,
    hooks: DashMap<TypeId, Arc<InterceptHook>>,
    installs: AtomicUsize,
    generations: AtomicU64,
}

/// Association between persistence instances and their guard decision.
///
/// Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct PersistenceGuardRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for PersistenceGuardRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceGuardRegistry")
            .field("entries", &self.inner.entries.len())
            .field("installed_types", &self.inner.hooks.len())
            .finish()
    }
}

impl PersistenceGuardRegistry {
    /// Create an isolated registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    #[must_use]
    pub fn global() -> Self {
        static GLOBAL: OnceLock<PersistenceGuardRegistry> = OnceLock::new();
        GLOBAL.get_or_init(Self::new).clone()
    }

    /// The registry scoped around the current task, or the process-wide one.
    #[must_use]
    pub fn current() -> Self {
        SCOPED_REGISTRY
            .try_with(Clone::clone)
            .unwrap_or_else(|_| Self::global())
    }

    /// Run `future` with this registry as [`PersistenceGuardRegistry::current`].
    pub async fn scope<F>(self, future: F) -> F::Output
    where
        F: std::future::Future,
    {
        SCOPED_REGISTRY.scope(self, future).await
    }

    /// Run `f` synchronously with this registry as [`PersistenceGuardRegistry::current`].
    pub fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        SCOPED_REGISTRY.sync_scope(self.clone(), f)
    }

    /// Interception hook for `P`, installing it on first use.
    pub fn installed_hook<P: Persistence>(&self) -> Arc<InterceptHook> {
        if let Some(hook) = self.inner.hooks.get(&TypeId::of::<P>()) {
            return Arc::clone(hook.value());
        }

        let entry = self
            .inner
            .hooks
            .entry(TypeId::of::<P>())
            .or_insert_with(|| {
                let type_name = std::any::type_name::<P>();
                self.inner.installs.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(type_name, "Installed persistence guard interception");
                Arc::new(InterceptHook::new(type_name))
            });
        Arc::clone(entry.value())
    }

    /// Number of persistence types with an installed hook.
    #[must_use]
    pub fn installed_types(&self) -> usize {
        self.inner.installs.load(Ordering::Relaxed)
    }

    /// Associate `instance` with `decision` for the current request.
    ///
    /// Registering the same live instance again with the same decision is a
    /// no-op apart from adding a holder; the association ends when every
    /// returned [`Registration`] is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ConflictingDecision`] if the instance is
    /// already registered with a different decision.
    pub fn register<P: Persistence>(
        &self,
        instance: &Arc<P>,
        decision: GuardDecision,
    ) -> Result<Registration, RegistryError> {
        self.installed_hook::<P>();

        let erased: Arc<dyn Any + Send + Sync> = Arc::clone(instance) as Arc<dyn Any + Send + Sync>;
        let weak = Arc::downgrade(&erased);
        drop(erased);

        self.register_at(InstanceKey::of(instance), weak, decision, std::any::type_name::<P>())
    }

    fn register_at(
        &self,
        key: InstanceKey,
        weak: Weak<dyn Any + Send + Sync>,
        decision: GuardDecision,
        type_name: &'static str,
    ) -> Result<Registration, RegistryError> {
        let generation = match self.inner.entries.entry(key) {
            Entry::Occupied(mut occupied) if occupied.get().is_alive() => {
                let entry = occupied.get_mut();
                if entry.decision != decision {
                    return Err(RegistryError::ConflictingDecision {
                        type_name,
                        existing: entry.decision.mutation_permitted(),
                        requested: decision.mutation_permitted(),
                    });
                }
                entry.holders += 1;
                entry.generation
            },
            Entry::Occupied(mut occupied) => {
                // Stale association of a dropped instance; start over
                let generation = self.next_generation();
                occupied.insert(GuardEntry::new(weak, decision, generation));
                generation
            },
            Entry::Vacant(vacant) => {
                let generation = self.next_generation();
                vacant.insert(GuardEntry::new(weak, decision, generation));
                generation
            },
        };

        Ok(Registration {
            registry: self.clone(),
            key,
            generation,
        })
    }

    /// Decision currently associated with `instance`, if it is registered and alive.
    #[must_use]
    pub fn lookup<P: ?Sized>(&self, instance: &Arc<P>) -> Option<GuardDecision> {
        self.inner
            .entries
            .get(&InstanceKey::of(instance))
            .filter(|entry| entry.is_alive())
            .map(|entry| entry.decision)
    }

    /// Gate a persist attempt on `instance`.
    ///
    /// The registered decision wins; `attached` is used when the instance is
    /// no longer registered (e.g. a wrapper that outlived its request).
    ///
    /// # Errors
    ///
    /// Returns a [`ViolationCause::Forbidden`] violation if the governing
    /// decision does not permit mutation.
    pub fn guarded_persist<P: Persistence>(
        &self,
        instance: &Arc<P>,
        attached: GuardDecision,
    ) -> Result<(), GuardViolation> {
        let hook = self.installed_hook::<P>();
        let decision = self.lookup(instance).unwrap_or(attached);

        if decision.mutation_permitted() {
            hook.allowed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("persistence_guard.persist.allowed").increment(1);
            return Ok(());
        }

        hook.blocked.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("persistence_guard.persist.blocked").increment(1);
        tracing::warn!(
            type_name = hook.type_name(),
            "Blocked persist attempt on a request that does not permit mutation"
        );
        Err(GuardViolation::new(ViolationCause::Forbidden))
    }

    /// Gate a persist attempt made directly on a registered instance.
    ///
    /// Instances without a live association are let through. A veto is also
    /// recorded in the violation slot attached to the association, so the
    /// request's response is replaced even if the caller swallows the error.
    /// Attempts let through are counted by [`Self::guarded_persist`] only.
    ///
    /// # Errors
    ///
    /// Returns a [`ViolationCause::Forbidden`] violation if the instance is
    /// registered with a decision that does not permit mutation.
    pub fn intercept<P: Persistence>(&self, instance: &P) -> Result<(), GuardViolation> {
        let violations = match self.inner.entries.get(&InstanceKey::of_ref(instance)) {
            Some(entry) if entry.is_alive() && !entry.decision.mutation_permitted() => {
                entry.violations.clone()
            },
            _ => return Ok(()),
        };

        let hook = self.installed_hook::<P>();
        hook.blocked.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("persistence_guard.persist.blocked").increment(1);
        tracing::warn!(
            type_name = hook.type_name(),
            "Blocked direct persist attempt on a request that does not permit mutation"
        );

        Err(violations.map_or_else(
            || GuardViolation::new(ViolationCause::Forbidden),
            |slot| slot.raise(ViolationCause::Forbidden),
        ))
    }

    /// Number of associations on record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether no associations are on record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Drop associations whose instance no longer exists. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, entry| entry.is_alive());
        before.saturating_sub(self.inner.entries.len())
    }

    fn next_generation(&self) -> u64 {
        self.inner.generations.fetch_add(1, Ordering::Relaxed)
    }

    fn attach_violations(&self, key: InstanceKey, generation: u64, violations: &ViolationSlot) {
        if let Some(mut entry) = self.inner.entries.get_mut(&key) {
            if entry.generation == generation && entry.violations.is_none() {
                entry.violations = Some(violations.clone());
            }
        }
    }

    fn release(&self, key: InstanceKey, generation: u64) {
        if let Entry::Occupied(mut occupied) = self.inner.entries.entry(key) {
            let entry = occupied.get_mut();
            // A pruned and reused address belongs to someone else now
            if entry.generation != generation {
                return;
            }
            entry.holders = entry.holders.saturating_sub(1);
            if entry.holders == 0 {
                occupied.remove();
            }
        }
    }
}

/// Handle keeping one registry association alive.
///
/// Dropping it releases the association.
#[must_use = "the association is released as soon as the registration is dropped"]
pub struct Registration {
    registry: PersistenceGuardRegistry,
    key: InstanceKey,
    generation: u64,
}

impl Registration {
    /// Record vetoed direct persist attempts in `violations`.
    ///
    /// The first slot attached to an association is kept.
    pub fn report_to(self, violations: &ViolationSlot) -> Self {
        self.registry
            .attach_violations(self.key, self.generation, violations);
        self
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(self.key, self.generation);
    }
}

/// Gate a persist attempt made directly on `instance`.
///
/// Persistence implementations call this first thing in `persist` and
/// `persist_blocking`. It consults [`PersistenceGuardRegistry::current`].
///
/// # Errors
///
/// Returns a [`ViolationCause::Forbidden`] violation if the instance belongs
/// to a request that does not permit mutation.
pub fn intercept_persist<P: Persistence>(instance: &P) -> Result<(), GuardViolation> {
    PersistenceGuardRegistry::current().intercept(instance)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::CountingPersistence;
    use std::thread;

    #[test]
    fn test_register_and_lookup() {
        let registry = PersistenceGuardRegistry::new();
        let session = Arc::new(CountingPersistence::default());

        let registration = registry.register(&session, GuardDecision::FORBID).unwrap();
        assert_eq!(registry.lookup(&session), Some(GuardDecision::FORBID));
        assert_eq!(registry.len(), 1);

        drop(registration);
        assert_eq!(registry.lookup(&session), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = PersistenceGuardRegistry::new();
        let session = Arc::new(CountingPersistence::default());

        let first = registry.register(&session, GuardDecision::PERMIT).unwrap();
        let second = registry.register(&session, GuardDecision::PERMIT).unwrap();
        assert_eq!(registry.len(), 1);

        drop(first);
        assert_eq!(registry.lookup(&session), Some(GuardDecision::PERMIT));
        drop(second);
        assert_eq!(registry.lookup(&session), None);
    }

    #[test]
    fn test_conflicting_decision_is_rejected() {
        let registry = PersistenceGuardRegistry::new();
        let session = Arc::new(CountingPersistence::default());

        let _held = registry.register(&session, GuardDecision::PERMIT).unwrap();
        let err = registry.register(&session, GuardDecision::FORBID).unwrap_err();

        assert!(matches!(
            err,
            RegistryError::ConflictingDecision { existing: true, requested: false, .. }
        ));
        assert_eq!(registry.lookup(&session), Some(GuardDecision::PERMIT));
    }

    #[test]
    fn test_registry_does_not_retain_instance() {
        let registry = PersistenceGuardRegistry::new();
        let session = Arc::new(CountingPersistence::default());
        let _registration = registry.register(&session, GuardDecision::FORBID).unwrap();

        assert_eq!(Arc::strong_count(&session), 1);
        drop(session);

        assert_eq!(registry.prune(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_guarded_persist_forbids() {
        let registry = PersistenceGuardRegistry::new();
        let session = Arc::new(CountingPersistence::default());
        let _registration = registry.register(&session, GuardDecision::FORBID).unwrap();

        let err = registry.guarded_persist(&session, GuardDecision::PERMIT).unwrap_err();
        assert_eq!(err.cause(), ViolationCause::Forbidden);

        let hook = registry.installed_hook::<CountingPersistence>();
        assert_eq!(hook.blocked(), 1);
        assert_eq!(hook.allowed(), 0);
    }

    #[test]
    fn test_guarded_persist_permits() {
        let registry = PersistenceGuardRegistry::new();
        let session = Arc::new(CountingPersistence::default());
        let _registration = registry.register(&session, GuardDecision::PERMIT).unwrap();

        assert!(registry.guarded_persist(&session, GuardDecision::FORBID).is_ok());
        assert_eq!(registry.installed_hook::<CountingPersistence>().allowed(), 1);
    }

    #[test]
    fn test_guarded_persist_falls_back_to_attached_decision() {
        let registry = PersistenceGuardRegistry::new();
        let session = Arc::new(CountingPersistence::default());

        assert!(registry.guarded_persist(&session, GuardDecision::PERMIT).is_ok());
        assert!(registry.guarded_persist(&session, GuardDecision::FORBID).is_err());
    }

    #[test]
    fn test_hook_installed_once_under_contention() {
        let registry = PersistenceGuardRegistry::new();

        let hooks: Vec<Arc<InterceptHook>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| scope.spawn(|| registry.installed_hook::<CountingPersistence>()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(registry.installed_types(), 1);
        assert!(hooks.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert!(hooks[0].type_name().contains("CountingPersistence"));
    }

    #[test]
    fn test_distinct_instances_are_independent() {
        let registry = PersistenceGuardRegistry::new();
        let safe = Arc::new(CountingPersistence::default());
        let mutating = Arc::new(CountingPersistence::default());

        let _a = registry.register(&safe, GuardDecision::FORBID).unwrap();
        let _b = registry.register(&mutating, GuardDecision::PERMIT).unwrap();

        assert_eq!(registry.lookup(&safe), Some(GuardDecision::FORBID));
        assert_eq!(registry.lookup(&mutating), Some(GuardDecision::PERMIT));
        assert_eq!(registry.installed_types(), 1);
    }

    #[test]
    fn test_global_is_shared() {
        let a = PersistenceGuardRegistry::global();
        let b = PersistenceGuardRegistry::global();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }

    fn erased_weak(instance: &Arc<CountingPersistence>) -> Weak<dyn Any + Send + Sync> {
        let erased: Arc<dyn Any + Send + Sync> = Arc::clone(instance) as Arc<dyn Any + Send + Sync>;
        Arc::downgrade(&erased)
    }

    #[test]
    fn test_stale_registration_ignores_reused_address() {
        let registry = PersistenceGuardRegistry::new();
        let first = Arc::new(CountingPersistence::default());
        let stale = registry.register(&first, GuardDecision::FORBID).unwrap();
        let key = stale.key;

        drop(first);
        assert_eq!(registry.prune(), 1);

        // A later instance lands on the freed address
        let second = Arc::new(CountingPersistence::default());
        let current = registry
            .register_at(key, erased_weak(&second), GuardDecision::PERMIT, "second")
            .unwrap();
        assert_ne!(current.generation, stale.generation);

        drop(stale);
        assert_eq!(registry.len(), 1);

        drop(current);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dead_entry_is_replaced_on_register() {
        let registry = PersistenceGuardRegistry::new();
        let first = Arc::new(CountingPersistence::default());
        let stale = registry.register(&first, GuardDecision::PERMIT).unwrap();
        let key = stale.key;
        drop(first);

        let second = Arc::new(CountingPersistence::default());
        let current = registry
            .register_at(key, erased_weak(&second), GuardDecision::FORBID, "second")
            .unwrap();

        drop(stale);
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.inner.entries.get(&key).map(|entry| entry.decision),
            Some(GuardDecision::FORBID)
        );
        drop(current);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_intercept_vetoes_registered_instance() {
        let registry = PersistenceGuardRegistry::new();
        let session = Arc::new(CountingPersistence::default());
        let violations = ViolationSlot::new();
        let _registration = registry
            .register(&session, GuardDecision::FORBID)
            .unwrap()
            .report_to(&violations);

        let err = registry.intercept(&*session).unwrap_err();

        assert_eq!(err.cause(), ViolationCause::Forbidden);
        assert_eq!(violations.first(), Some(err));
        assert_eq!(registry.installed_hook::<CountingPersistence>().blocked(), 1);
    }

    #[test]
    fn test_intercept_lets_unregistered_and_permitted_through() {
        let registry = PersistenceGuardRegistry::new();
        let loose = CountingPersistence::default();
        assert!(registry.intercept(&loose).is_ok());

        let session = Arc::new(CountingPersistence::default());
        let _registration = registry.register(&session, GuardDecision::PERMIT).unwrap();
        assert!(registry.intercept(&*session).is_ok());
    }

    #[tokio::test]
    async fn test_scoped_registry_is_current() {
        let registry = PersistenceGuardRegistry::new();
        let session = Arc::new(CountingPersistence::default());
        let _registration = registry.register(&session, GuardDecision::FORBID).unwrap();

        let inside = registry.clone().scope(async { intercept_persist(&*session) }).await;
        assert!(inside.is_err());
        assert!(registry.enter(|| intercept_persist(&*session)).is_err());

        // Outside the scope the process-wide registry governs, which never saw it
        assert!(intercept_persist(&*session).is_ok());
    }
}
