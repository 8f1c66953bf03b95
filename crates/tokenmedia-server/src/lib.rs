//! Token Media Server Library
#![recursion_limit = "256"]
//!
//! Turns on-chain tokens into cached, classified media.
//!
//! # Overview
//!
//! For one token identifier the server:
//!
//! - **Fetches metadata** from a chain indexer, falling back across providers
//! - **Discovers media** (image and animation URLs) and downloads both
//! - **Classifies** each body by sniffing its bytes, swapping slots when the
//!   image key actually points at a video
//! - **Derives** thumbnails and live previews with ffmpeg
//! - **Caches** artifacts in an S3-compatible bucket and keeps the set coherent
//!   with the resolved media type
//! - **Persists** one row per run describing the outcome
//!
//! # Architecture
//!
//! Webhooks from the chain indexer are turned into transfer tasks. Tasks are
//! delivered back to this server through a queue (or directly in local mode)
//! and fan out into media jobs. A media job runs under a per-token lock so at
//! most one run per token is in flight.
//!
//! ## Framework Stack
//!
//! - **Axum**: webhook, task and read routes
//! - **SQLx**: Postgres persistence and the token lock
//! - **Tower**: request tracing middleware
//!
//! # Example
//!
//! ```no_run
//! use tokenmedia_server::config::Config;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     println!("listening on {}:{}", config.server.host, config.server.port);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod media;
pub mod middleware;
pub mod pipeline;
pub mod providers;
pub mod storage;
pub mod tasks;
pub mod webhooks;

// Re-export commonly used types
pub use error::AppError;
