#![deny(missing_docs)]

//! Document ingestion and retrieval pipeline: normalize, chunk, embed, and index documents
//! behind circuit-broken gateways, then serve cursor-paginated ranked search.

/// HTTP routing and REST handlers.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// Timeout, retry, and circuit breaking for external calls.
pub mod gateway;
/// Structured logging and tracing setup.
pub mod logging;
/// Pipeline counters.
pub mod metrics;
/// Ingestion jobs: stages, registry, orchestrator, and progress streaming.
pub mod pipeline;
/// Pure document transforms: decoding, chunking, tag sanitation.
pub mod processing;
/// Qdrant vector store backend.
pub mod qdrant;
/// Ranked, paginated search.
pub mod search;
/// Service facade consumed by the HTTP layer.
pub mod service;
/// Object store capability and backends.
pub mod storage;
/// Vector store capability and the in-process backend.
pub mod vector;
