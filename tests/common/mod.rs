//! Common test utilities and fixtures
//!
//! This module provides shared test infrastructure including:
//! - A mock chain that produces path-consistent tree revisions
//! - A scripted `ChainFetcher` backed by that chain
//! - Replica setup with in-memory or file-backed storage
//! - Assertions on replica state

#![allow(dead_code)]

pub mod assertions;
pub mod fixtures;

// Re-export commonly used items
pub use assertions::*;
pub use fixtures::*;

pub use std::sync::Arc;
