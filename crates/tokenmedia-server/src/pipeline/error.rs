use thiserror::Error;

use crate::media::FetchError;
use crate::providers::ProviderError;

/// Why a job did not complete normally
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Metadata or media is fundamentally unusable
    #[error("Bad token: {0}")]
    BadToken(String),

    #[error("Token is not signed by the required platform")]
    RequiredSignedToken,

    #[error("Image result required but the image was not cached")]
    ImageResultRequired,

    #[error("Transient failure: {0}")]
    Transient(String),

    /// Another run holds the token lock
    #[error("Token is already being processed: {0}")]
    BusyDuplicate(String),

    #[error("Contract not indexed by provider: {0}")]
    ProviderNotFound(String),

    /// The run could not be persisted
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::BadToken(_) => "bad_token",
            PipelineError::RequiredSignedToken => "required_signed_token",
            PipelineError::ImageResultRequired => "image_result_required",
            PipelineError::Transient(_) => "transient",
            PipelineError::BusyDuplicate(_) => "busy_duplicate",
            PipelineError::ProviderNotFound(_) => "provider_not_found",
            PipelineError::Fatal(_) => "fatal",
        }
    }

    /// Worth redelivering from the queue
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Transient(_) | PipelineError::BusyDuplicate(_) | PipelineError::Fatal(_)
        )
    }
}

impl From<ProviderError> for PipelineError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(m) => PipelineError::ProviderNotFound(m),
            ProviderError::Transient(m) => PipelineError::Transient(m),
            ProviderError::Cancelled => PipelineError::Transient("metadata fetch cancelled".into()),
            ProviderError::Permanent(m) => PipelineError::BadToken(m),
            ProviderError::Unsupported(capability) => {
                PipelineError::BadToken(format!("unsupported: {capability}"))
            }
        }
    }
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transient(m) => PipelineError::Transient(m),
            FetchError::Cancelled => PipelineError::Transient("download cancelled".into()),
            FetchError::NotFound(m) | FetchError::Permanent(m) => PipelineError::BadToken(m),
        }
    }
}
