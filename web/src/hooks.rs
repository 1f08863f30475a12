//! Override points of the guard middleware.
//!
//! Every method has a default, so applications implement only what they
//! change. Hooks are composed into the layer at construction time with
//! [`GuardLayer::with_hooks`](crate::middleware::GuardLayer::with_hooks).
//!
//! # Example
//!
//! ```ignore
//! struct AuditHooks;
//!
//! impl GuardHooks for AuditHooks {
//!     // Treat the internal sync endpoint as mutating even on GET
//!     fn on_enter(&self, context: &mut GuardContext, request: &Request) {
//!         if request.uri().path().starts_with("/internal/sync") {
//!             context.set_mutation_permitted(true);
//!             context.set_tracking_hint(TrackingHint::Tracked);
//!         }
//!     }
//! }
//! ```

use axum::extract::Request;
use http::Method;
use safe_persist_core::{Classification, Classifier, GuardContext, Persistence, SafeMethods};

/// Strategy hooks consulted by the guard middleware.
pub trait GuardHooks: Send + Sync + 'static {
    /// Classify the request method. Defaults to membership in `safe_methods`.
    fn classify(&self, method: &Method, safe_methods: &SafeMethods) -> Classification {
        safe_methods.classify(method)
    }

    /// Runs once per request after classification and before guarding takes effect.
    ///
    /// May adjust the tracking hint or the permission; the context is frozen
    /// when this returns.
    fn on_enter(&self, _context: &mut GuardContext, _request: &Request) {}

    /// Whether unpersisted changes exist. Defaults to asking the capability.
    fn has_changes(&self, persistence: &dyn Persistence) -> bool {
        persistence.has_pending_changes()
    }
}

/// Hooks with every default behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl GuardHooks for DefaultHooks {}
