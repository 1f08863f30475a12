//! Axum integration for Safe Persist.
//!
//! This crate wires the request-scoped persistence guard of
//! `safe-persist-core` into the tower/axum request pipeline.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            GuardMiddleware              │  ← classify, register, scope
//! │  ┌───────────────────────────────────┐  │
//! │  │   Handlers                        │  │  ← Guarded<P>, RequestGuard
//! │  │   persist() ─▶ registry veto      │  │  ← Forbidden
//! │  └───────────────────────────────────┘  │
//! │  checkpoint before head / each frame    │  ← UnsafedData, ModifiedData
//! │  ErrorResponder on violation            │  ← structured JSON 500
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use axum::{Router, routing::get};
//! use safe_persist_web::{AppError, Guarded, guard_layer};
//!
//! async fn create_item(Guarded(session): Guarded<InMemorySession>) -> Result<StatusCode, AppError> {
//!     session.insert("apple", "red");
//!     session.persist().await?;
//!     Ok(StatusCode::CREATED)
//! }
//!
//! let app = Router::new()
//!     .route("/items", get(list_items).post(create_item))
//!     .layer(guard_layer(InMemoryStore::new()));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod body;
pub mod error;
pub mod extractors;
pub mod hooks;
pub mod middleware;
pub mod responder;
pub mod stats;

// Re-export key types for convenience
pub use body::{GuardBodyError, GuardedBody};
pub use error::AppError;
pub use extractors::{Guarded, RequestGuard};
pub use hooks::{DefaultHooks, GuardHooks};
pub use middleware::{GuardLayer, GuardMiddleware, guard_layer};
pub use responder::{ErrorResponder, EscalatingResponder, JsonErrorResponder, ViolationBody};
pub use stats::GuardStats;

/// Result type alias for guarded handlers.
pub type WebResult<T> = Result<T, AppError>;
