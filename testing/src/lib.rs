//! # Safe Persist Testing
//!
//! Testing utilities for the persistence guard.
//!
//! This crate provides:
//! - An in-memory persistence capability ([`InMemoryStore`], [`InMemorySession`])
//! - Providers for per-request and shared sessions
//! - Property-based testing strategies for HTTP methods
//! - Tracing setup for test output
//!
//! ## Example
//!
//! ```ignore
//! use safe_persist_testing::InMemoryStore;
//! use safe_persist_web::guard_layer;
//!
//! #[tokio::test]
//! async fn test_get_cannot_persist() {
//!     let store = InMemoryStore::new();
//!     let app = Router::new()
//!         .route("/items", get(touch_item))
//!         .layer(guard_layer(store.clone()));
//!
//!     let response = app.oneshot(get_request("/items")).await.unwrap();
//!     assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
//!     assert!(store.is_empty());
//! }
//! ```

pub mod memory;

/// Test helpers.
pub mod helpers {
    use std::sync::Once;

    static TRACING: Once = Once::new();

    /// Install a test-writer tracing subscriber once per process.
    ///
    /// Honors `RUST_LOG`; silent unless the test harness shows output.
    pub fn init_test_tracing() {
        TRACING.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
                )
                .with_test_writer()
                .try_init();
        });
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use http::Method;
    use proptest::prelude::*;
    use safe_persist_core::{GuardConfig, ViolationCause};

    /// Any method from the default safe set.
    pub fn safe_method() -> impl Strategy<Value = Method> {
        let methods: Vec<Method> = GuardConfig::default().safe_methods.iter().cloned().collect();
        proptest::sample::select(methods)
    }

    /// Any standard method outside the default safe set.
    pub fn mutating_method() -> impl Strategy<Value = Method> {
        prop_oneof![
            Just(Method::POST),
            Just(Method::PUT),
            Just(Method::PATCH),
            Just(Method::DELETE),
            Just(Method::CONNECT),
        ]
    }

    /// Any extension method token (uppercase letters, not in the safe set).
    pub fn extension_method() -> impl Strategy<Value = Method> {
        "[A-Z]{3,12}"
            .prop_filter_map("must be a non-safe extension token", |token| {
                let method = Method::from_bytes(token.as_bytes()).ok()?;
                (!GuardConfig::default().safe_methods.contains(&method)).then_some(method)
            })
    }

    /// Any violation cause.
    pub fn violation_cause() -> impl Strategy<Value = ViolationCause> {
        proptest::sample::select(ViolationCause::ALL.to_vec())
    }
}

// Re-export commonly used items
pub use helpers::init_test_tracing;
pub use memory::{Change, InMemorySession, InMemoryStore, SharedSessionProvider};

#[cfg(test)]
mod tests {
    use super::properties::*;
    use proptest::prelude::*;
    use safe_persist_core::{Classification, classify};

    proptest! {
        #[test]
        fn prop_safe_methods_classify_safe(method in safe_method()) {
            prop_assert_eq!(classify(&method), Classification::Safe);
        }

        #[test]
        fn prop_mutating_methods_classify_mutating(method in mutating_method()) {
            prop_assert_eq!(classify(&method), Classification::Mutating);
        }

        #[test]
        fn prop_extension_methods_classify_mutating(method in extension_method()) {
            prop_assert_eq!(classify(&method), Classification::Mutating);
        }
    }
}
