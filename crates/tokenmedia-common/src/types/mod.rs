//! Domain value types shared by every crate

mod chain;
mod media;
mod metadata;
mod token;

pub use chain::Chain;
pub use media::{Dimensions, MediaType};
pub use metadata::TokenMetadata;
pub use token::{Address, TokenId, TokenIdentifier};
