//! Token Media Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the token media workspace.
//!
//! # Overview
//!
//! This crate provides common functionality used by every workspace member:
//!
//! - **Types**: chains, token identifiers, raw token metadata, media types, dimensions
//! - **Error Handling**: the shared error enum and result alias
//! - **Checksums**: content hashing used to deduplicate cached artifacts
//! - **Logging**: tracing subscriber setup driven by `LOG_*` environment variables
//!
//! # Example
//!
//! ```no_run
//! use tokenmedia_common::{Chain, TokenIdentifier};
//!
//! fn parse() -> tokenmedia_common::Result<()> {
//!     let token = TokenIdentifier::parse(Chain::Ethereum, "0xABC0000000000000000000000000000000000001", "42")?;
//!     println!("processing {}", token);
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{Result, TokenMediaError};
pub use types::{
    Address, Chain, Dimensions, MediaType, TokenIdentifier, TokenId, TokenMetadata,
};
