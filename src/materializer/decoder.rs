// File: src/materializer/decoder.rs

//! Decoder registry and built-in leaf decoders

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ReplicaError, ReplicaResult};
use crate::traits::{AssetUpdate, CreatorShare, DecodedLeaf, LeafDecoder};
use crate::types::{Discriminator, Pubkey};

/// Discriminator of leaves holding a free-form JSON document
pub const JSON_LEAF: Discriminator = *b"jsonleaf";

/// Discriminator of leaves holding a JSON-encoded asset
pub const ASSET_LEAF_V1: Discriminator = *b"assetv1\0";

/// Discriminator → decoder lookup
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    decoders: HashMap<Discriminator, Arc<dyn LeafDecoder>>,
}

impl DecoderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in JSON and asset decoders
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(JsonLeafDecoder::new(JSON_LEAF)));
        registry.register(Arc::new(AssetLeafDecoder));
        registry
    }

    /// Add or replace the decoder for its discriminator
    pub fn register(&mut self, decoder: Arc<dyn LeafDecoder>) {
        let discriminator = decoder.discriminator();
        if let Some(previous) = self.decoders.insert(discriminator, decoder) {
            tracing::warn!(
                discriminator = %hex::encode(discriminator),
                replaced = previous.name(),
                "Leaf decoder replaced"
            );
        }
    }

    pub fn get(&self, discriminator: &Discriminator) -> Option<&Arc<dyn LeafDecoder>> {
        self.decoders.get(discriminator)
    }

    /// Decode with the registered decoder
    pub fn decode(&self, discriminator: &Discriminator, data: &[u8]) -> ReplicaResult<DecodedLeaf> {
        let decoder = self.get(discriminator).ok_or_else(|| {
            ReplicaError::Decode(format!(
                "no decoder for discriminator {}",
                hex::encode(discriminator)
            ))
        })?;
        decoder.decode(data)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.decoders.values().map(|d| d.name()).collect();
        names.sort_unstable();
        f.debug_struct("DecoderRegistry")
            .field("decoders", &names)
            .finish()
    }
}

/// Leaf data is a UTF-8 JSON document stored as-is
#[derive(Debug, Clone, Copy)]
pub struct JsonLeafDecoder {
    discriminator: Discriminator,
}

impl JsonLeafDecoder {
    pub fn new(discriminator: Discriminator) -> Self {
        Self { discriminator }
    }
}

impl LeafDecoder for JsonLeafDecoder {
    fn discriminator(&self) -> Discriminator {
        self.discriminator
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn decode(&self, data: &[u8]) -> ReplicaResult<DecodedLeaf> {
        let parsed = serde_json::from_slice(data)
            .map_err(|e| ReplicaError::Decode(format!("invalid JSON leaf: {}", e)))?;
        Ok(DecodedLeaf {
            parsed,
            asset: None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct AssetLeafV1 {
    owner: String,
    #[serde(default)]
    delegate: Option<String>,
    #[serde(default)]
    authority: Option<String>,
    #[serde(default)]
    collection: Option<String>,
    #[serde(default)]
    creators: Option<Vec<CreatorShare>>,
    #[serde(default)]
    burnt: bool,
}

/// Leaf data is a JSON asset record with ownership, grouping and creators
#[derive(Debug, Clone, Copy)]
pub struct AssetLeafDecoder;

impl LeafDecoder for AssetLeafDecoder {
    fn discriminator(&self) -> Discriminator {
        ASSET_LEAF_V1
    }

    fn name(&self) -> &'static str {
        "asset_v1"
    }

    fn decode(&self, data: &[u8]) -> ReplicaResult<DecodedLeaf> {
        let parsed: serde_json::Value = serde_json::from_slice(data)
            .map_err(|e| ReplicaError::Decode(format!("invalid asset leaf: {}", e)))?;
        let leaf: AssetLeafV1 = serde_json::from_value(parsed.clone())
            .map_err(|e| ReplicaError::Decode(format!("invalid asset leaf: {}", e)))?;

        if let Some(creators) = &leaf.creators {
            let total: u32 = creators.iter().map(|c| c.share as u32).sum();
            if !creators.is_empty() && total != 100 {
                return Err(ReplicaError::Decode(format!(
                    "creator shares sum to {}, expected 100",
                    total
                )));
            }
        }

        let mut grouping = Vec::new();
        if let Some(collection) = &leaf.collection {
            parse_pubkey(collection, "collection")?;
            grouping.push(("collection".to_string(), collection.to_ascii_lowercase()));
        }

        let asset = AssetUpdate {
            owner: Some(parse_pubkey(&leaf.owner, "owner")?),
            delegate: leaf
                .delegate
                .as_deref()
                .map(|d| parse_pubkey(d, "delegate"))
                .transpose()?,
            authority: leaf
                .authority
                .as_deref()
                .map(|a| parse_pubkey(a, "authority"))
                .transpose()?,
            grouping,
            creators: leaf.creators,
            burnt: leaf.burnt,
        };

        Ok(DecodedLeaf {
            parsed,
            asset: Some(asset),
        })
    }
}

fn parse_pubkey(s: &str, field: &str) -> ReplicaResult<Pubkey> {
    let bytes = hex::decode(s)
        .map_err(|e| ReplicaError::Decode(format!("{}: {}", field, e)))?;
    bytes
        .try_into()
        .map_err(|_| ReplicaError::Decode(format!("{}: expected 32 bytes", field)))
}
