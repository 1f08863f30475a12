//! Response-time checkpoint and the guarded output sink.
//!
//! The checkpoint is the last line of defense: right before response bytes
//! are committed to the transport it asks whether unpersisted changes exist.
//!
//! 1. No pending changes: transmission proceeds.
//! 2. Pending changes on a request permitted to persist: the handler forgot
//!    to persist, [`ViolationCause::UnsafedData`].
//! 3. Pending changes on a request not permitted to persist: an unauthorized
//!    mutation, [`ViolationCause::ModifiedData`].
//!
//! A violation already raised for the request (e.g. a blocked persist) also
//! stops transmission.
//!
//! [`GuardedWriter`] applies the checkpoint to any [`AsyncWrite`] sink. Only
//! operations that commit bytes are checked; reads and seeks pass through.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, ReadBuf};

use crate::context::GuardDecision;
use crate::persistence::Persistence;
use crate::violation::{GuardViolation, ViolationCause, ViolationSlot};

/// Probe reporting whether unpersisted changes exist.
pub type PendingProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// Decision plus pending-changes probe, evaluated before each transmission.
#[derive(Clone)]
pub struct ResponseCheckpoint {
    decision: GuardDecision,
    probe: PendingProbe,
    violations: ViolationSlot,
}

impl fmt::Debug for ResponseCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCheckpoint")
            .field("decision", &self.decision)
            .field("violations", &self.violations)
            .finish_non_exhaustive()
    }
}

impl ResponseCheckpoint {
    /// Create a checkpoint from an arbitrary probe.
    #[must_use]
    pub fn new(decision: GuardDecision, probe: PendingProbe, violations: ViolationSlot) -> Self {
        Self {
            decision,
            probe,
            violations,
        }
    }

    /// Create a checkpoint that probes `persistence` directly.
    #[must_use]
    pub fn for_persistence<P: Persistence>(
        persistence: Arc<P>,
        decision: GuardDecision,
        violations: ViolationSlot,
    ) -> Self {
        Self::new(
            decision,
            Arc::new(move || persistence.has_pending_changes()),
            violations,
        )
    }

    /// The decision being enforced.
    #[must_use]
    pub const fn decision(&self) -> GuardDecision {
        self.decision
    }

    /// The request's violation slot.
    #[must_use]
    pub const fn violations(&self) -> &ViolationSlot {
        &self.violations
    }

    /// Verify that transmission may proceed.
    ///
    /// # Errors
    ///
    /// Returns the request's violation if one was already raised, otherwise
    /// raises [`ViolationCause::UnsafedData`] or [`ViolationCause::ModifiedData`]
    /// when pending changes exist.
    pub fn check(&self) -> Result<(), GuardViolation> {
        if let Some(violation) = self.violations.first() {
            return Err(violation);
        }

        if !(self.probe)() {
            return Ok(());
        }

        let cause = if self.decision.mutation_permitted() {
            ViolationCause::UnsafedData
        } else {
            ViolationCause::ModifiedData
        };
        Err(self.violations.raise(cause))
    }
}

/// Extract a guard violation carried by an I/O error from [`GuardedWriter`].
#[must_use]
pub fn violation_from_io(err: &io::Error) -> Option<GuardViolation> {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<GuardViolation>())
        .copied()
}

/// [`AsyncWrite`] sink that runs a [`ResponseCheckpoint`] before committing bytes.
///
/// Writes, vectored writes, flushes and shutdown are checked; a violation is
/// reported as an [`io::ErrorKind::PermissionDenied`] error wrapping the
/// [`GuardViolation`], and nothing is forwarded to the inner sink.
#[derive(Debug)]
pub struct GuardedWriter<W> {
    inner: W,
    checkpoint: ResponseCheckpoint,
}

impl<W> GuardedWriter<W> {
    /// Wrap `inner`.
    pub const fn new(inner: W, checkpoint: ResponseCheckpoint) -> Self {
        Self { inner, checkpoint }
    }

    /// The wrapped sink.
    pub const fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Restore the original sink.
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// The checkpoint in use.
    pub const fn checkpoint(&self) -> &ResponseCheckpoint {
        &self.checkpoint
    }

    fn guard(&self) -> io::Result<()> {
        self.checkpoint
            .check()
            .map_err(|violation| io::Error::new(io::ErrorKind::PermissionDenied, violation))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for GuardedWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if !buf.is_empty() {
            if let Err(err) = self.guard() {
                return Poll::Ready(Err(err));
            }
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        if bufs.iter().any(|buf| !buf.is_empty()) {
            if let Err(err) = self.guard() {
                return Poll::Ready(Err(err));
            }
        }
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Err(err) = self.guard() {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Err(err) = self.guard() {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<W: AsyncRead + Unpin> AsyncRead for GuardedWriter<W> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<W: AsyncSeek + Unpin> AsyncSeek for GuardedWriter<W> {
    fn start_seek(mut self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.inner).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.inner).poll_complete(cx)
    }
}
