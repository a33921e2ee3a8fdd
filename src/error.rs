// Error taxonomy shared by every callback waiting on a transfer.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

/// Failure delivered to callers. Cloneable because one failure fans out to every waiter.
#[derive(Debug, Clone, Error)]
pub enum TransferError {
    /// The transport reported an error for the transfer. The cause is passed through verbatim.
    #[error("transfer failed: {0}")]
    TransferFailed(Arc<anyhow::Error>),

    /// The request had no resolvable target (e.g. a malformed URL).
    #[error("no transfer handle for {0:?}")]
    NoHandle(String),

    /// The session for the requested configuration could not be built.
    #[error("session unavailable: {0}")]
    SessionUnavailable(Arc<anyhow::Error>),
}

impl TransferError {
    pub fn failed(cause: impl Into<anyhow::Error>) -> Self {
        Self::TransferFailed(Arc::new(cause.into()))
    }

    pub fn session_unavailable(cause: impl Into<anyhow::Error>) -> Self {
        Self::SessionUnavailable(Arc::new(cause.into()))
    }
}

/// What every result consumer receives: the full payload or the shared failure.
pub type TransferResult = Result<Bytes, TransferError>;

/// A result consumer. Each one runs exactly once.
pub type TransferCallback = Box<dyn FnOnce(TransferResult) + Send + 'static>;
