#![deny(missing_docs)]

//! Core library for Policy Digest, an asynchronous summarizer for government documents.

/// HTTP routing and REST handlers.
pub mod api;
/// Work queue between the dispatcher and the workers.
pub mod broker;
/// Chunk budget derivation and paragraph-aware splitting.
pub mod chunking;
/// Environment-driven configuration management.
pub mod config;
/// PDF and plain-text extraction.
pub mod extraction;
/// Structured logging and tracing setup.
pub mod logging;
/// Pipeline metrics helpers.
pub mod metrics;
/// Job dispatch, workers, aggregation and lease recovery.
pub mod pipeline;
/// Durable job, task and document storage.
pub mod store;
/// Summarization client abstraction and model backends.
pub mod summarization;
