//! Token media processing
//!
//! Given a token identifier, a run fetches metadata, discovers the image and
//! animation URLs, downloads and classifies both, derives thumbnails and
//! previews, keeps the cached artifact set coherent and persists one row
//! describing the outcome.

pub mod discovery;
pub mod download;
pub mod error;
pub mod lock;
pub mod metadata;
pub mod options;
pub mod processor;

pub use error::PipelineError;
pub use lock::{MemoryTokenLock, PgTokenLock, TokenLock};
pub use metadata::{PipelineMetadata, Step, StepState};
pub use options::{Job, JobCause, JobOptions, JobOptionsPayload};
pub use processor::{JobOutcome, ProcessorSettings, TokenProcessor};
