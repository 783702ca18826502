use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("document is unreadable: {0}")]
    UnreadableDocument(String),

    #[error("extracted text too short: {chars} chars (minimum {minimum})")]
    ExtractedTextTooShort { chars: usize, minimum: usize },

    #[error("document not found: {0}")]
    DocumentNotFound(Uuid),

    #[error("storage access denied: {0}")]
    StorageDenied(String),

    #[error("no chunks found for document {0}")]
    NoChunksFound(Uuid),

    #[error("embedding failed for {failed} of {total} chunks")]
    PartialEmbeddingFailure { failed: usize, total: usize },

    #[error("segmentation response did not match the expected schema: {0}")]
    MalformedSegmentation(String),

    #[error("completion request failed: {0}")]
    CompletionFailed(String),

    #[error("embedding request failed: {0}")]
    EmbeddingFailed(String),

    #[error("another invocation is already working on document {0}")]
    StageInProgress(Uuid),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Failures that move the document to `error` and stay there until an
    /// explicit retry, as opposed to transient ones the next run re-attempts.
    pub fn is_fatal_for_document(&self) -> bool {
        matches!(
            self,
            PipelineError::UnreadableDocument(_)
                | PipelineError::ExtractedTextTooShort { .. }
                | PipelineError::DocumentNotFound(_)
                | PipelineError::StorageDenied(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    Denied(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
