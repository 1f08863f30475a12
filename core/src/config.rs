//! Guard configuration.
//!
//! Everything the embedding application may override without recompiling
//! lives here: the safe-method set, the default error response, and how
//! often streamed bodies are checked.
//!
//! # Environment
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `PERSISTENCE_GUARD_SAFE_METHODS` | comma-separated safe method tokens | IANA safe methods |
//! | `PERSISTENCE_GUARD_ERROR_STATUS` | status code of violation responses | `500` |
//! | `PERSISTENCE_GUARD_CHECK_EVERY_FRAME` | re-check on every streamed frame | `true` |
//!
//! # Example
//!
//! ```rust
//! use safe_persist_core::config::{GuardConfig, SafeMethods};
//!
//! let config = GuardConfig::builder()
//!     .safe_methods(SafeMethods::parse("GET, HEAD").unwrap())
//!     .check_every_frame(false)
//!     .build();
//!
//! assert!(config.safe_methods.contains(&http::Method::GET));
//! assert!(!config.safe_methods.contains(&http::Method::OPTIONS));
//! ```

use http::{Method, StatusCode};
use std::collections::HashSet;
use thiserror::Error;

/// Environment variable holding the safe-method list.
pub const SAFE_METHODS_ENV: &str = "PERSISTENCE_GUARD_SAFE_METHODS";

/// Environment variable holding the violation status code.
pub const ERROR_STATUS_ENV: &str = "PERSISTENCE_GUARD_ERROR_STATUS";

/// Environment variable toggling per-frame body checks.
pub const CHECK_EVERY_FRAME_ENV: &str = "PERSISTENCE_GUARD_CHECK_EVERY_FRAME";

/// Generic client-visible message of violation responses.
pub const DEFAULT_ERROR_MESSAGE: &str = "An error occurred while processing a request.";

/// Methods registered as safe in the IANA HTTP method registry.
const DEFAULT_SAFE_METHODS: [&str; 8] = [
    "GET", "HEAD", "OPTIONS", "TRACE", "PROPFIND", "REPORT", "SEARCH", "QUERY",
];

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A method list contained an empty entry.
    #[error("Empty method token in safe-method list")]
    EmptyMethodToken,

    /// A method token is not a valid HTTP method.
    #[error("Invalid HTTP method token: {0}")]
    InvalidMethod(String),

    /// A violation cause label is not known.
    #[error("Unknown violation cause: {0}")]
    UnknownCause(String),

    /// A configuration value could not be parsed.
    #[error("Invalid value for {key}: {value}")]
    InvalidValue {
        /// The configuration key.
        key: String,
        /// The rejected value.
        value: String,
    },
}

/// Set of HTTP methods classified as safe (no persisted state change allowed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeMethods {
    methods: HashSet<Method>,
}

impl SafeMethods {
    /// Build a set from method tokens. Tokens are case-sensitive.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyMethodToken`] for blank entries and
    /// [`ConfigError::InvalidMethod`] for tokens that are not valid methods.
    pub fn from_tokens<I, T>(tokens: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let mut methods = HashSet::new();
        for token in tokens {
            let token = token.as_ref().trim();
            if token.is_empty() {
                return Err(ConfigError::EmptyMethodToken);
            }
            let method = Method::from_bytes(token.as_bytes())
                .map_err(|_| ConfigError::InvalidMethod(token.to_string()))?;
            methods.insert(method);
        }
        Ok(Self { methods })
    }

    /// Parse a comma-separated method list such as `"GET, HEAD, OPTIONS"`.
    ///
    /// # Errors
    ///
    /// See [`SafeMethods::from_tokens`].
    pub fn parse(list: &str) -> Result<Self, ConfigError> {
        Self::from_tokens(list.split(','))
    }

    /// An empty set: every method is mutating.
    #[must_use]
    pub fn none() -> Self {
        Self {
            methods: HashSet::new(),
        }
    }

    /// Whether `method` is in the set.
    #[must_use]
    pub fn contains(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }

    /// Add a method to the set.
    #[must_use]
    pub fn with(mut self, method: Method) -> Self {
        self.methods.insert(method);
        self
    }

    /// Remove a method from the set.
    #[must_use]
    pub fn without(mut self, method: &Method) -> Self {
        self.methods.remove(method);
        self
    }

    /// Number of methods in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Iterate over the methods in the set.
    pub fn iter(&self) -> impl Iterator<Item = &Method> {
        self.methods.iter()
    }
}

impl Default for SafeMethods {
    fn default() -> Self {
        Self {
            methods: DEFAULT_SAFE_METHODS
                .iter()
                .filter_map(|token| Method::from_bytes(token.as_bytes()).ok())
                .collect(),
        }
    }
}

/// Shape of the default violation response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponderConfig {
    /// Status code of violation responses.
    pub status: StatusCode,
    /// Generic message placed in the `message` field.
    pub message: String,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: DEFAULT_ERROR_MESSAGE.to_string(),
        }
    }
}

/// Guard configuration.
///
/// # Default Values
///
/// - `safe_methods`: GET, HEAD, OPTIONS, TRACE, PROPFIND, REPORT, SEARCH, QUERY
/// - `responder`: status 500, generic message
/// - `check_every_frame`: true
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardConfig {
    /// Methods classified as safe.
    pub safe_methods: SafeMethods,
    /// Default error response shape.
    pub responder: ResponderConfig,
    /// Re-check the guard before every streamed data frame, not only before headers.
    pub check_every_frame: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            safe_methods: SafeMethods::default(),
            responder: ResponderConfig::default(),
            check_every_frame: true,
        }
    }
}

impl GuardConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> GuardConfigBuilder {
        GuardConfigBuilder {
            config: Self::default(),
        }
    }

    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Unset keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a key maps to an unparseable value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();

        if let Some(list) = lookup(SAFE_METHODS_ENV) {
            builder = builder.safe_methods(SafeMethods::parse(&list)?);
        }

        if let Some(status) = lookup(ERROR_STATUS_ENV) {
            let code = status
                .trim()
                .parse::<u16>()
                .ok()
                .and_then(|code| StatusCode::from_u16(code).ok())
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: ERROR_STATUS_ENV.to_string(),
                    value: status.clone(),
                })?;
            builder = builder.error_status(code);
        }

        if let Some(flag) = lookup(CHECK_EVERY_FRAME_ENV) {
            let enabled = match flag.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: CHECK_EVERY_FRAME_ENV.to_string(),
                        value: flag,
                    });
                },
            };
            builder = builder.check_every_frame(enabled);
        }

        Ok(builder.build())
    }
}

/// Builder for [`GuardConfig`].
#[derive(Debug, Clone)]
pub struct GuardConfigBuilder {
    config: GuardConfig,
}

impl GuardConfigBuilder {
    /// Set the safe-method set.
    #[must_use]
    pub fn safe_methods(mut self, methods: SafeMethods) -> Self {
        self.config.safe_methods = methods;
        self
    }

    /// Set the status code of violation responses.
    #[must_use]
    pub const fn error_status(mut self, status: StatusCode) -> Self {
        self.config.responder.status = status;
        self
    }

    /// Set the generic message of violation responses.
    #[must_use]
    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.config.responder.message = message.into();
        self
    }

    /// Enable or disable per-frame checks on streamed bodies.
    #[must_use]
    pub const fn check_every_frame(mut self, enabled: bool) -> Self {
        self.config.check_every_frame = enabled;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> GuardConfig {
        self.config
    }
}
