//! Guard violations and the per-request slot that carries them.
//!
//! A [`GuardViolation`] is an immutable signal: it names *why* a request broke
//! its guard decision and nothing else. Violations never carry store details,
//! so they are safe to surface to clients through the error responder.
//!
//! # Causes
//!
//! | Cause | Raised by | Meaning |
//! |---|---|---|
//! | `Forbidden` | registry (persist attempt) | a safe request tried to persist |
//! | `ModifiedData` | response checkpoint | a safe request left pending changes behind |
//! | `UnsafedData` | response checkpoint | a mutating request responded without persisting |

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use crate::config::ConfigError;

/// Why a request violated its guard decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ViolationCause {
    /// Pending changes at response time on a request that was allowed to persist.
    UnsafedData,
    /// Pending changes at response time on a request that was not allowed to persist.
    ModifiedData,
    /// A persist attempt on a request that was not allowed to persist.
    Forbidden,
}

impl ViolationCause {
    /// All causes, in declaration order.
    pub const ALL: [Self; 3] = [Self::UnsafedData, Self::ModifiedData, Self::Forbidden];

    /// Stable label used in logs, metrics and configuration.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::UnsafedData => "UnsafedData",
            Self::ModifiedData => "ModifiedData",
            Self::Forbidden => "Forbidden",
        }
    }

    /// Fixed, client-safe explanation of the cause.
    #[must_use]
    pub const fn detail(self) -> &'static str {
        match self {
            Self::UnsafedData => {
                "The request modified data but did not save the changes before \
                 the response was sent. The changes have not been persisted."
            },
            Self::ModifiedData => {
                "The request method does not permit data modification, but unsaved \
                 modifications were detected before the response was sent."
            },
            Self::Forbidden => {
                "The request attempted to save changes although its request method \
                 does not permit data modification. Nothing was persisted."
            },
        }
    }
}

impl fmt::Display for ViolationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ViolationCause {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            // Accepted spelling variant
            "UnsavedData" => Ok(Self::UnsafedData),
            label => Self::ALL
                .into_iter()
                .find(|cause| cause.label() == label)
                .ok_or_else(|| ConfigError::UnknownCause(s.to_string())),
        }
    }
}

/// Signal raised when a request contradicts its guard decision.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("persistence guard violation ({cause}): {}", cause.detail())]
pub struct GuardViolation {
    cause: ViolationCause,
}

impl GuardViolation {
    /// Create a violation for the given cause.
    #[must_use]
    pub const fn new(cause: ViolationCause) -> Self {
        Self { cause }
    }

    /// The cause of this violation.
    #[must_use]
    pub const fn cause(&self) -> ViolationCause {
        self.cause
    }
}

impl From<ViolationCause> for GuardViolation {
    fn from(cause: ViolationCause) -> Self {
        Self::new(cause)
    }
}

#[derive(Debug, Default)]
struct SlotState {
    first: Option<GuardViolation>,
    pending: Option<GuardViolation>,
}

/// Single-assignment cell holding the violation of one request.
///
/// The first raised violation wins; later raises return that same value.
/// [`ViolationSlot::take`] hands it out exactly once.
#[derive(Debug, Clone, Default)]
pub struct ViolationSlot {
    state: Arc<Mutex<SlotState>>,
}

impl ViolationSlot {
    /// Create an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a violation unless one was already raised for this request.
    ///
    /// Returns the violation that is now on record.
    pub fn raise(&self, cause: ViolationCause) -> GuardViolation {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(first) = state.first {
            return first;
        }

        let violation = GuardViolation::new(cause);
        state.first = Some(violation);
        state.pending = Some(violation);
        drop(state);

        tracing::warn!(cause = %cause, "Persistence guard violation raised");
        metrics::counter!("persistence_guard.violations.total", "cause" => cause.label())
            .increment(1);

        violation
    }

    /// Consume the pending violation. Subsequent calls return `None`.
    pub fn take(&self) -> Option<GuardViolation> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .take()
    }

    /// The first violation raised, whether or not it was consumed.
    #[must_use]
    pub fn first(&self) -> Option<GuardViolation> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).first
    }

    /// Whether a violation was raised for this request.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.first().is_some()
    }
}
