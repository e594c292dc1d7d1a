// Error taxonomy shared by the storage, selection and delivery layers.

use thiserror::Error;

use crate::delivery::SendError;

/// Failures raised by a storage collaborator.
///
/// Business-rule outcomes (no templates, too few participants) are not errors;
/// they are reported through [`crate::selector::BlockReason`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable during {operation}: {source}")]
    Unavailable {
        operation: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("stored template {id} is invalid: {reason}")]
    InvalidTemplate { id: String, reason: String },

    #[error("failed to encode {what}: {source}")]
    Encoding {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Build a closure that wraps a rusqlite error with the failing operation
    /// name, for use with `map_err`.
    pub(crate) fn unavailable(operation: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| StoreError::Unavailable { operation, source }
    }
}

/// Why a delivery attempt ended in the `Failed` state.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("poll could not be sent: {0}")]
    Send(SendError),
}
