//! Request classification.
//!
//! A request is *safe* when its method is in the configured [`SafeMethods`]
//! set and *mutating* otherwise. Safe requests are not permitted to persist.

use http::Method;
use serde::Serialize;
use std::fmt;

use crate::config::SafeMethods;

/// Outcome of classifying a request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Classification {
    /// Read-only method: persisting is forbidden.
    Safe,
    /// Any other method: persisting is permitted and expected.
    Mutating,
}

impl Classification {
    /// Whether requests of this classification may persist changes.
    #[must_use]
    pub const fn mutation_permitted(self) -> bool {
        matches!(self, Self::Mutating)
    }

    /// Classification matching a `mutation_permitted` flag.
    #[must_use]
    pub const fn from_permission(mutation_permitted: bool) -> Self {
        if mutation_permitted {
            Self::Mutating
        } else {
            Self::Safe
        }
    }

    /// Lowercase label for logs and metrics.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Mutating => "mutating",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Classifies request methods.
///
/// Implemented for [`SafeMethods`] and for any `Fn(&Method) -> Classification`.
pub trait Classifier: Send + Sync {
    /// Classify `method`. Must be pure.
    fn classify(&self, method: &Method) -> Classification;
}

impl Classifier for SafeMethods {
    fn classify(&self, method: &Method) -> Classification {
        if self.contains(method) {
            Classification::Safe
        } else {
            Classification::Mutating
        }
    }
}

impl<F> Classifier for F
where
    F: Fn(&Method) -> Classification + Send + Sync,
{
    fn classify(&self, method: &Method) -> Classification {
        self(method)
    }
}

/// Classify `method` against the default safe-method set.
#[must_use]
pub fn classify(method: &Method) -> Classification {
    SafeMethods::default().classify(method)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_classification() {
        assert_eq!(classify(&Method::GET), Classification::Safe);
        assert_eq!(classify(&Method::HEAD), Classification::Safe);
        assert_eq!(classify(&Method::OPTIONS), Classification::Safe);
        assert_eq!(classify(&Method::POST), Classification::Mutating);
        assert_eq!(classify(&Method::PUT), Classification::Mutating);
        assert_eq!(classify(&Method::PATCH), Classification::Mutating);
        assert_eq!(classify(&Method::DELETE), Classification::Mutating);
    }

    #[test]
    fn test_mutation_permitted() {
        assert!(!Classification::Safe.mutation_permitted());
        assert!(Classification::Mutating.mutation_permitted());
        assert_eq!(Classification::from_permission(true), Classification::Mutating);
        assert_eq!(Classification::from_permission(false), Classification::Safe);
    }

    #[test]
    fn test_custom_set() {
        let safe = SafeMethods::parse("GET").unwrap();
        assert_eq!(safe.classify(&Method::GET), Classification::Safe);
        assert_eq!(safe.classify(&Method::HEAD), Classification::Mutating);
    }

    #[test]
    fn test_closure_classifier() {
        let everything_safe = |_: &Method| Classification::Safe;
        assert_eq!(everything_safe.classify(&Method::DELETE), Classification::Safe);
    }

    #[test]
    fn test_extension_methods_are_mutating() {
        let method = Method::from_bytes(b"PURGE").unwrap();
        assert_eq!(classify(&method), Classification::Mutating);
    }

    proptest! {
        #[test]
        fn prop_classification_follows_membership(token in "[A-Z]{1,12}") {
            let method = Method::from_bytes(token.as_bytes()).unwrap();
            let safe = SafeMethods::default();
            let expected = if safe.contains(&method) {
                Classification::Safe
            } else {
                Classification::Mutating
            };
            prop_assert_eq!(safe.classify(&method), expected);
        }

        #[test]
        fn prop_listed_tokens_are_safe(tokens in proptest::collection::vec("[A-Z]{1,10}", 1..6)) {
            let safe = SafeMethods::from_tokens(&tokens).unwrap();
            for token in &tokens {
                let method = Method::from_bytes(token.as_bytes()).unwrap();
                prop_assert_eq!(safe.classify(&method), Classification::Safe);
            }
        }
    }
}
