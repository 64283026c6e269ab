//! Qdrant vector store backend.

pub mod client;
pub mod filters;
pub(crate) mod payload;
pub(crate) mod types;

pub use client::QdrantStore;
pub use filters::{build_search_filter, build_stale_filter};
