//! Internal implementation details for Kestrel.
//!
//! This module contains the anchor resolver, the resource tracker and the reference engine.
//! They are re-exported from the crate root where they are part of the public API.

pub mod anchor;
pub mod engine;
pub mod timeline;
pub mod tracker;
