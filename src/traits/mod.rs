//! Trait definitions for chain access and leaf decoding

pub mod chain;
pub mod decoder;

pub use chain::ChainFetcher;
pub use decoder::{AssetUpdate, CreatorShare, DecodedLeaf, LeafDecoder};
