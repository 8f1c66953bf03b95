//! Media fetching, classification and derivation

pub mod classify;
pub mod command;
pub mod dimensions;
pub mod transcode;
pub mod transport;

pub use classify::Classifier;
pub use transcode::{FfmpegTranscoder, TranscodeError, Transcoder};
pub use transport::{FetchError, FetchedMedia, MediaSource, Transport};
