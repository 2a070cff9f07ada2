use std::io;

/// Errors surfaced by the RMA operation entry points.
///
/// [`RmaError::Again`] is the single distinguished retryable signal: it
/// promises that no shared state changed (no ring cursor advanced, no pool
/// slot remains acquired) and that retrying after the peer makes progress is
/// the correct reaction. Every other variant is a non-retryable failure of
/// the specific operation.
#[derive(Debug)]
pub enum RmaError {
    /// Backpressure: insufficient ring credit, full response ring, exhausted
    /// pool, unresolved peer, full completion queue, or an active segmented
    /// transfer to the same peer. Retry later; nothing was committed.
    Again,
    /// The cross-process copy primitive failed (e.g. the peer exited).
    Copy(io::Error),
}

impl RmaError {
    /// True for the distinguished retryable signal.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Again)
    }
}

impl std::fmt::Display for RmaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Again => write!(f, "resource busy, retry after peer progress"),
            Self::Copy(e) => write!(f, "cross-process copy failed: {}", e),
        }
    }
}

impl std::error::Error for RmaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Copy(e) => Some(e),
            _ => None,
        }
    }
}

/// How an accepted operation will complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Data movement finished before the call returned; a local completion
    /// was posted (or its failure logged).
    Sync,
    /// A response slot and pending entry were reserved; the completion is
    /// signaled later by the peer through the response ring.
    Deferred,
}
