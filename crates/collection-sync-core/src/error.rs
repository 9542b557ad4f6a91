use crate::types::CollectionIdentifier;
use thiserror::Error;

/// A batch that cannot be applied incrementally.
///
/// Faults never leave the synchronizer: the worker answers them with a full
/// rebuild from the batch's row snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SyncFault {
    #[error("malformed batch: {reason}")]
    MalformedBatch { reason: String },
    #[error("attaching {key} would create a cycle")]
    CycleDetected { key: CollectionIdentifier },
}

impl SyncFault {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedBatch {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("synchronizer has been cancelled")]
    Cancelled,
    #[error("no tokio runtime to run the worker on: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
    #[error(transparent)]
    Fault(#[from] SyncFault),
}
