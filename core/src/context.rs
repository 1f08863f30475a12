//! Per-request guard context and its propagation.
//!
//! A [`GuardContext`] is built once when a request enters the guard, may be
//! adjusted by the `on_enter` hook, and is frozen into a [`GuardDecision`]
//! before any downstream code runs.
//!
//! Context is passed explicitly (request extensions, the
//! `GuardedPersistence` wrapper). In addition the middleware installs it in a
//! task-local scope around the downstream future; task-locals follow the
//! logical task, so the context stays attached across `.await` points even
//! when the task resumes on another worker thread.
//!
//! ```rust
//! use safe_persist_core::context::GuardContext;
//! use http::Method;
//!
//! # async fn example() {
//! let context = GuardContext::for_method(&Method::GET, false);
//!
//! let seen = context
//!     .clone()
//!     .scope(async { GuardContext::current().map(|c| c.mutation_permitted()) })
//!     .await;
//!
//! assert_eq!(seen, Some(false));
//! assert!(GuardContext::current().is_none());
//! # }
//! ```

use chrono::{DateTime, Utc};
use http::Method;
use serde::Serialize;
use std::future::Future;
use uuid::Uuid;

use crate::classify::Classification;

tokio::task_local! {
    static CURRENT_GUARD: GuardContext;
}

/// Advisory hint letting the persistence layer skip bookkeeping on safe requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TrackingHint {
    /// Track entity changes fully.
    Tracked,
    /// Minimal tracking; the request is not expected to change anything.
    Untracked,
}

impl TrackingHint {
    /// Default hint for a classification.
    #[must_use]
    pub const fn for_permission(mutation_permitted: bool) -> Self {
        if mutation_permitted {
            Self::Tracked
        } else {
            Self::Untracked
        }
    }
}

/// The frozen guard decision of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GuardDecision {
    mutation_permitted: bool,
}

impl GuardDecision {
    /// Decision permitting persistence.
    pub const PERMIT: Self = Self::new(true);

    /// Decision forbidding persistence.
    pub const FORBID: Self = Self::new(false);

    /// Create a decision.
    #[must_use]
    pub const fn new(mutation_permitted: bool) -> Self {
        Self { mutation_permitted }
    }

    /// Whether persisting is permitted.
    #[must_use]
    pub const fn mutation_permitted(self) -> bool {
        self.mutation_permitted
    }

    /// Classification equivalent of this decision.
    #[must_use]
    pub const fn classification(self) -> Classification {
        Classification::from_permission(self.mutation_permitted)
    }
}

impl From<Classification> for GuardDecision {
    fn from(classification: Classification) -> Self {
        Self::new(classification.mutation_permitted())
    }
}

/// Guard state of one logical request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardContext {
    request_id: Uuid,
    #[serde(serialize_with = "serialize_method")]
    method: Method,
    mutation_permitted: bool,
    tracking_hint: TrackingHint,
    entered_at: DateTime<Utc>,
}

fn serialize_method<S: serde::Serializer>(method: &Method, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(method.as_str())
}

impl GuardContext {
    /// Create a context for a classified request.
    #[must_use]
    pub fn new(method: Method, classification: Classification) -> Self {
        let mutation_permitted = classification.mutation_permitted();
        Self {
            request_id: Uuid::new_v4(),
            method,
            mutation_permitted,
            tracking_hint: TrackingHint::for_permission(mutation_permitted),
            entered_at: Utc::now(),
        }
    }

    /// Create a context with an explicit permission flag.
    #[must_use]
    pub fn for_method(method: &Method, mutation_permitted: bool) -> Self {
        Self::new(method.clone(), Classification::from_permission(mutation_permitted))
    }

    /// Unique id of the request.
    #[must_use]
    pub const fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Request method.
    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// Whether the request may persist.
    #[must_use]
    pub const fn mutation_permitted(&self) -> bool {
        self.mutation_permitted
    }

    /// Current tracking hint.
    #[must_use]
    pub const fn tracking_hint(&self) -> TrackingHint {
        self.tracking_hint
    }

    /// When the request entered the guard.
    #[must_use]
    pub const fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    /// The decision this context freezes into.
    #[must_use]
    pub const fn decision(&self) -> GuardDecision {
        GuardDecision::new(self.mutation_permitted)
    }

    /// Classification of the request.
    #[must_use]
    pub const fn classification(&self) -> Classification {
        Classification::from_permission(self.mutation_permitted)
    }

    /// Override the tracking hint. Only meaningful before guarding starts.
    pub const fn set_tracking_hint(&mut self, hint: TrackingHint) {
        self.tracking_hint = hint;
    }

    /// Override the permission. Only meaningful before guarding starts.
    pub const fn set_mutation_permitted(&mut self, mutation_permitted: bool) {
        self.mutation_permitted = mutation_permitted;
    }

    /// Run `future` with this context installed as the task's current context.
    pub async fn scope<F>(self, future: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_GUARD.scope(self, future).await
    }

    /// The context of the enclosing [`GuardContext::scope`], if any.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT_GUARD.try_with(Clone::clone).ok()
    }

    /// The decision of the enclosing scope, if any.
    #[must_use]
    pub fn current_decision() -> Option<GuardDecision> {
        CURRENT_GUARD.try_with(Self::decision).ok()
    }
}
