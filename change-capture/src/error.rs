use thiserror::Error;

use crate::checkpoint::CheckpointError;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to parse change record: {0}")]
    RecordParsingError(#[from] serde_json::Error),
    #[error("structurally malformed change record: {0}")]
    MalformedRecord(String),

    #[error("transient publish error, please retry")]
    RetryablePublishError,
    #[error("event could not be published and retrying will not help")]
    NonRetryablePublishError,

    #[error("checkpoint store error: {0}")]
    CheckpointError(#[from] CheckpointError),

    #[error("change source error: {0}")]
    SourceError(String),
}

impl CaptureError {
    /// Malformed input is isolated to the dead-letter path; everything else
    /// either retries or aborts the worker.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            CaptureError::RecordParsingError(_) | CaptureError::MalformedRecord(_)
        )
    }
}
