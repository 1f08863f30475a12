//! Translation of guard violations into client-visible responses.
//!
//! The default [`JsonErrorResponder`] produces:
//!
//! ```json
//! {
//!   "statusCode": 500,
//!   "message": "An error occurred while processing a request.",
//!   "detailed": "<cause-specific text>"
//! }
//! ```
//!
//! No store details or internal state are ever included; `detailed` is the
//! fixed text of the cause.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use safe_persist_core::{GuardContext, GuardViolation, ResponderConfig};
use serde::Serialize;

/// Produces the response sent in place of a violated one.
///
/// Implemented for closures `Fn(GuardViolation, &GuardContext, &ResponderConfig) -> Response`.
pub trait ErrorResponder: Send + Sync + 'static {
    /// Build the response for `violation`.
    fn respond(
        &self,
        violation: GuardViolation,
        context: &GuardContext,
        config: &ResponderConfig,
    ) -> Response;
}

impl<F> ErrorResponder for F
where
    F: Fn(GuardViolation, &GuardContext, &ResponderConfig) -> Response + Send + Sync + 'static,
{
    fn respond(
        &self,
        violation: GuardViolation,
        context: &GuardContext,
        config: &ResponderConfig,
    ) -> Response {
        self(violation, context, config)
    }
}

/// Violation response body.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ViolationBody {
    /// Numeric status code, mirrored from the response status.
    pub status_code: u16,
    /// Generic message.
    pub message: String,
    /// Fixed explanation of the cause.
    pub detailed: String,
}

impl ViolationBody {
    /// Body for `violation` under `config`.
    #[must_use]
    pub fn new(violation: GuardViolation, config: &ResponderConfig) -> Self {
        Self {
            status_code: config.status.as_u16(),
            message: config.message.clone(),
            detailed: violation.cause().detail().to_string(),
        }
    }
}

/// Default responder: structured JSON error.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonErrorResponder;

impl ErrorResponder for JsonErrorResponder {
    fn respond(
        &self,
        violation: GuardViolation,
        context: &GuardContext,
        config: &ResponderConfig,
    ) -> Response {
        tracing::error!(
            request_id = %context.request_id(),
            method = %context.method(),
            cause = %violation.cause(),
            status = %config.status,
            "Request violated its persistence guard"
        );

        (config.status, Json(ViolationBody::new(violation, config))).into_response()
    }
}

/// Responder that hands the violation to an outer layer.
///
/// Returns a bodyless 500 whose extensions carry the [`GuardViolation`], for
/// applications that funnel all faults through one generic handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct EscalatingResponder;

impl ErrorResponder for EscalatingResponder {
    fn respond(
        &self,
        violation: GuardViolation,
        context: &GuardContext,
        _config: &ResponderConfig,
    ) -> Response {
        tracing::debug!(
            request_id = %context.request_id(),
            cause = %violation.cause(),
            "Escalating persistence guard violation"
        );

        let mut response = StatusCode::INTERNAL_SERVER_ERROR.into_response();
        response.extensions_mut().insert(violation);
        response
    }
}
