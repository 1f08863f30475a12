//! Axum extractors for guarded handlers.
//!
//! - [`Guarded`]: the request's [`GuardedPersistence`]
//! - [`RequestGuard`]: the request's [`GuardContext`]
//!
//! Both are inserted by the guard middleware; extracting them on a route
//! without the middleware is a wiring error and yields a 500.
//!
//! # Examples
//!
//! ```ignore
//! async fn handler(
//!     Guarded(session): Guarded<InMemorySession>,
//!     RequestGuard(context): RequestGuard,
//! ) -> Result<Json<Vec<Item>>, AppError> {
//!     tracing::info!(request_id = %context.request_id(), "Listing items");
//!     Ok(Json(session.list()))
//! }
//! ```

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use safe_persist_core::{GuardContext, GuardedPersistence, Persistence};
use std::fmt;
use std::ops::Deref;

use crate::error::AppError;

/// The request's guarded persistence instance.
pub struct Guarded<P>(pub GuardedPersistence<P>);

impl<P> Clone for Guarded<P> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<P> fmt::Debug for Guarded<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Guarded").field(&self.0).finish()
    }
}

impl<P> Deref for Guarded<P> {
    type Target = GuardedPersistence<P>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[async_trait]
impl<S, P> FromRequestParts<S> for Guarded<P>
where
    S: Send + Sync,
    P: Persistence,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<GuardedPersistence<P>>()
            .cloned()
            .map(Self)
            .ok_or_else(|| AppError::internal("Persistence guard middleware not installed"))
    }
}

/// The request's guard context.
#[derive(Debug, Clone)]
pub struct RequestGuard(pub GuardContext);

#[async_trait]
impl<S> FromRequestParts<S> for RequestGuard
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<GuardContext>()
            .cloned()
            .map(Self)
            .ok_or_else(|| AppError::internal("Persistence guard middleware not installed"))
    }
}
