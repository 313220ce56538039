//! Leaf payload decoding

use serde::{Deserialize, Serialize};

use crate::error::ReplicaResult;
use crate::types::{Discriminator, Pubkey};

/// Creator entry with royalty share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatorShare {
    #[serde(with = "hex::serde")]
    pub address: Pubkey,
    pub share: u8,
    #[serde(default)]
    pub verified: bool,
}

/// Asset-level fields extracted from a leaf
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetUpdate {
    pub owner: Option<Pubkey>,
    pub delegate: Option<Pubkey>,
    pub authority: Option<Pubkey>,

    /// `(group_key, group_value)` pairs, e.g. `("collection", <hex>)`
    pub grouping: Vec<(String, String)>,

    /// `None` leaves the stored creator list untouched
    pub creators: Option<Vec<CreatorShare>>,
    pub burnt: bool,
}

/// Result of decoding a leaf payload
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLeaf {
    /// Structured representation stored in `parsed`
    pub parsed: serde_json::Value,

    /// Present when the leaf describes an asset
    pub asset: Option<AssetUpdate>,
}

/// Decoder for one account type
///
/// Decoders are pure: same bytes, same result. They must not panic on
/// malformed input; return `ReplicaError::Decode` instead.
pub trait LeafDecoder: Send + Sync {
    /// Account-type tag this decoder handles
    fn discriminator(&self) -> Discriminator;

    /// Decoder name for logs
    fn name(&self) -> &'static str;

    fn decode(&self, data: &[u8]) -> ReplicaResult<DecodedLeaf>;
}
