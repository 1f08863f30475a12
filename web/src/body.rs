//! Response body wrapper that checkpoints the guard before each frame.
//!
//! The middleware already checks once before the response head is handed
//! to the transport. Streaming bodies produce bytes later, possibly while
//! handler code is still mutating state, so every data frame (and the
//! trailers) is checked again right before it is yielded. On a violation the
//! body yields an error instead of the frame and the transport aborts the
//! response; the frame never reaches the client.

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use safe_persist_core::{GuardViolation, PersistenceGuardRegistry, ResponseCheckpoint};
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use thiserror::Error;

use crate::stats::Teardown;

/// Boxed error type of wrapped bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors yielded by [`GuardedBody`].
#[derive(Error, Debug)]
pub enum GuardBodyError {
    /// The guard stopped transmission.
    #[error(transparent)]
    Violation(GuardViolation),

    /// The wrapped body failed.
    #[error("Response body error: {0}")]
    Inner(BoxError),
}

/// [`Body`] wrapper enforcing a [`ResponseCheckpoint`].
///
/// `is_end_stream` and `size_hint` pass through unchecked.
pub struct GuardedBody<B> {
    inner: B,
    checkpoint: ResponseCheckpoint,
    check_every_frame: bool,
    checked: bool,
    failed: bool,
    registry: Option<PersistenceGuardRegistry>,
    teardown: Option<Teardown>,
}

impl<B> GuardedBody<B> {
    /// Wrap `inner`.
    ///
    /// With `check_every_frame` disabled only the first data frame and the
    /// trailers are checked.
    pub const fn new(inner: B, checkpoint: ResponseCheckpoint, check_every_frame: bool) -> Self {
        Self {
            inner,
            checkpoint,
            check_every_frame,
            checked: false,
            failed: false,
            registry: None,
            teardown: None,
        }
    }

    /// Poll the wrapped body with `registry` scoped as the current registry.
    #[must_use]
    pub fn with_registry(mut self, registry: PersistenceGuardRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub(crate) fn with_teardown(mut self, teardown: Teardown) -> Self {
        self.teardown = Some(teardown);
        self
    }

    /// Restore the original body.
    pub fn into_inner(self) -> B {
        self.inner
    }

    fn finish(&mut self) {
        self.teardown.take();
    }
}

impl<B> Body for GuardedBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = GuardBodyError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        if this.failed {
            return Poll::Ready(None);
        }

        let inner = Pin::new(&mut this.inner);
        let polled = match &this.registry {
            Some(registry) => registry.enter(|| inner.poll_frame(cx)),
            None => inner.poll_frame(cx),
        };

        match ready!(polled) {
            None => {
                this.finish();
                Poll::Ready(None)
            },
            Some(Err(err)) => {
                this.failed = true;
                this.finish();
                Poll::Ready(Some(Err(GuardBodyError::Inner(err.into()))))
            },
            Some(Ok(frame)) => {
                let must_check = !frame.is_data() || this.check_every_frame || !this.checked;
                if must_check {
                    this.checked = true;
                    if let Err(violation) = this.checkpoint.check() {
                        tracing::warn!(
                            cause = %violation.cause(),
                            "Aborting response stream: persistence guard violated mid-stream"
                        );
                        if let Some(teardown) = &this.teardown {
                            teardown.record_violation(violation.cause());
                        }
                        this.failed = true;
                        this.finish();
                        return Poll::Ready(Some(Err(GuardBodyError::Violation(violation))));
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        self.failed || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
