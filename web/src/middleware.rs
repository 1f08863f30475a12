//! Tower middleware enforcing the persistence guard per request.
//!
//! # Lifecycle
//!
//! ```text
//! Entered ──▶ Guarded ──▶ Completed ──┐
//!                    └──▶ Violated ───┴──▶ Torn-down
//! ```
//!
//! 1. **Entered**: classify the method, build the [`GuardContext`], run
//!    [`GuardHooks::on_enter`], freeze the decision
//! 2. **Guarded**: acquire the request's persistence instance, apply the
//!    tracking hint, register the decision, insert [`GuardedPersistence`] and
//!    the context into request extensions, run the inner service inside the
//!    task-local scopes of the context and the registry
//! 3. **Completed**: no violation was raised and the pre-transmission
//!    checkpoint passes; the body is wrapped in [`GuardedBody`], which checks
//!    again before each frame
//! 4. **Violated**: the handler's response is discarded and the
//!    [`ErrorResponder`] builds the response instead
//! 5. **Torn-down**: always, exactly once, when the request's [`Teardown`]
//!    guard drops (end of the body on success; end of the call otherwise,
//!    including inner-service errors, panics and cancellation)
//!
//! Errors of the inner service that are not guard violations pass through
//! unchanged.
//!
//! # Example
//!
//! ```ignore
//! use axum::{Router, routing::get};
//! use safe_persist_web::guard_layer;
//!
//! let store = InMemoryStore::new();
//! let app = Router::new()
//!     .route("/items", get(list_items).post(create_item))
//!     .layer(guard_layer(store));
//! ```

use axum::{
    body::Body,
    extract::Request,
    response::{IntoResponse, Response},
};
use safe_persist_core::{
    GuardConfig, GuardContext, GuardViolation, GuardedPersistence, Persistence,
    PersistenceGuardRegistry, PersistenceProvider, ResponseCheckpoint, ViolationSlot,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::Instrument;

use crate::body::GuardedBody;
use crate::error::AppError;
use crate::hooks::{DefaultHooks, GuardHooks};
use crate::responder::{ErrorResponder, JsonErrorResponder};
use crate::stats::{GuardStats, Teardown};

/// Create a guard layer with default hooks, responder and configuration.
#[must_use]
pub fn guard_layer<P: PersistenceProvider>(provider: P) -> GuardLayer<P> {
    GuardLayer::new(provider)
}

/// Layer installing [`GuardMiddleware`].
pub struct GuardLayer<P, H = DefaultHooks, R = JsonErrorResponder> {
    provider: Arc<P>,
    hooks: Arc<H>,
    responder: Arc<R>,
    config: Arc<GuardConfig>,
    registry: PersistenceGuardRegistry,
    stats: GuardStats,
}

impl<P, H, R> Clone for GuardLayer<P, H, R> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            hooks: Arc::clone(&self.hooks),
            responder: Arc::clone(&self.responder),
            config: Arc::clone(&self.config),
            registry: self.registry.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<P, H, R> std::fmt::Debug for GuardLayer<P, H, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardLayer")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<P: PersistenceProvider> GuardLayer<P> {
    /// Create a layer around `provider` using the process-wide registry.
    #[must_use]
    pub fn new(provider: P) -> Self {
        Self {
            provider: Arc::new(provider),
            hooks: Arc::new(DefaultHooks),
            responder: Arc::new(JsonErrorResponder),
            config: Arc::new(GuardConfig::default()),
            registry: PersistenceGuardRegistry::global(),
            stats: GuardStats::new(),
        }
    }
}

impl<P, H, R> GuardLayer<P, H, R> {
    /// Replace the hooks.
    #[must_use]
    pub fn with_hooks<H2: GuardHooks>(self, hooks: H2) -> GuardLayer<P, H2, R> {
        GuardLayer {
            provider: self.provider,
            hooks: Arc::new(hooks),
            responder: self.responder,
            config: self.config,
            registry: self.registry,
            stats: self.stats,
        }
    }

    /// Replace the violation responder.
    #[must_use]
    pub fn with_responder<R2: ErrorResponder>(self, responder: R2) -> GuardLayer<P, H, R2> {
        GuardLayer {
            provider: self.provider,
            hooks: self.hooks,
            responder: Arc::new(responder),
            config: self.config,
            registry: self.registry,
            stats: self.stats,
        }
    }

    /// Replace the configuration.
    #[must_use]
    pub fn with_config(mut self, config: GuardConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Use a specific registry instead of the process-wide one.
    #[must_use]
    pub fn with_registry(mut self, registry: PersistenceGuardRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Lifecycle counters shared by every service this layer creates.
    #[must_use]
    pub fn stats(&self) -> GuardStats {
        self.stats.clone()
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }
}

impl<S, P, H, R> Layer<S> for GuardLayer<P, H, R> {
    type Service = GuardMiddleware<S, P, H, R>;

    fn layer(&self, inner: S) -> Self::Service {
        GuardMiddleware {
            inner,
            layer: self.clone(),
        }
    }
}

/// Middleware service enforcing the persistence guard.
pub struct GuardMiddleware<S, P, H = DefaultHooks, R = JsonErrorResponder> {
    inner: S,
    layer: GuardLayer<P, H, R>,
}

impl<S: Clone, P, H, R> Clone for GuardMiddleware<S, P, H, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            layer: self.layer.clone(),
        }
    }
}

impl<S, P, H, R> std::fmt::Debug for GuardMiddleware<S, P, H, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardMiddleware")
            .field("layer", &self.layer)
            .finish_non_exhaustive()
    }
}

impl<P, H, R> GuardLayer<P, H, R>
where
    R: ErrorResponder,
{
    fn violated(&self, violation: GuardViolation, context: &GuardContext) -> Response {
        self.stats.record_violation(violation.cause());
        self.responder
            .respond(violation, context, &self.config.responder)
    }
}

impl<S, P, H, R> Service<Request> for GuardMiddleware<S, P, H, R>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
    P: PersistenceProvider,
    H: GuardHooks,
    R: ErrorResponder,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let layer = self.layer.clone();

        // Entered
        let classification = layer.hooks.classify(req.method(), &layer.config.safe_methods);
        let mut context = GuardContext::new(req.method().clone(), classification);
        layer.hooks.on_enter(&mut context, &req);
        let decision = context.decision();

        metrics::counter!(
            "persistence_guard.requests.total",
            "classification" => context.classification().label()
        )
        .increment(1);

        let span = tracing::info_span!(
            "persistence_guard",
            request_id = %context.request_id(),
            method = %context.method(),
            mutation_permitted = decision.mutation_permitted(),
        );

        // Guarded
        let mut teardown = Teardown::enter(layer.stats.clone(), &context);
        let persistence = layer.provider.acquire();
        persistence.set_tracking_mode(context.tracking_hint().into());

        let violations = ViolationSlot::new();
        match layer.registry.register(&persistence, decision) {
            Ok(registration) => teardown.hold(registration.report_to(&violations)),
            Err(err) => {
                span.in_scope(|| {
                    tracing::error!(error = %err, "Persistence instance shared across conflicting requests");
                });
                return Box::pin(async move {
                    drop(teardown);
                    Ok(AppError::internal("An internal error occurred").into_response())
                });
            },
        }

        let guarded = GuardedPersistence::new(
            Arc::clone(&persistence),
            decision,
            layer.registry.clone(),
            violations.clone(),
        );
        req.extensions_mut().insert(guarded);
        req.extensions_mut().insert(context.clone());

        let hooks = Arc::clone(&layer.hooks);
        let checkpoint = ResponseCheckpoint::new(
            decision,
            Arc::new(move || hooks.has_changes(&*persistence)),
            violations.clone(),
        );

        let future = context
            .clone()
            .scope(layer.registry.clone().scope(self.inner.call(req)));

        Box::pin(
            async move {
                let response = future.await?;

                if let Some(violation) = violations.take() {
                    drop(response);
                    let response = layer.violated(violation, &context);
                    drop(teardown);
                    return Ok(response);
                }

                // Headers are the first bytes to leave; check before handing them over
                if let Err(violation) = checkpoint.check() {
                    violations.take();
                    drop(response);
                    let response = layer.violated(violation, &context);
                    drop(teardown);
                    return Ok(response);
                }

                // Completed
                let (parts, body) = response.into_parts();
                let body = GuardedBody::new(body, checkpoint, layer.config.check_every_frame)
                    .with_registry(layer.registry.clone())
                    .with_teardown(teardown);
                Ok(Response::from_parts(parts, Body::new(body)))
            }
            .instrument(span),
        )
    }
}
