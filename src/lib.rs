//! # bostadsrag: retrieval-augmented assistant for a housing marketplace
//!
//! Answers Swedish questions about the housing market by letting a language
//! model call a fixed set of retrieval tools over domain records (interest
//! rates, traffic, schools, land registry, statistics, brokers, FAQ), then
//! streams the grounded answer back to the client.
//!
//! ## Architecture
//!
//! - **[`config`]**: Configuration loading, validation, and env overrides
//! - **[`db`]**: SQLite + sqlite-vec record store (pooled, cosine search)
//! - **[`embedder`]**: Embedding trait, HTTP and mock backends, chunking
//! - **[`retrieval`]**: Named relevance policies per domain
//! - **[`tools`]**: Closed tool registry, argument validation, dispatch
//! - **[`llm`]**: Language-model seam and OpenAI-compatible streaming client
//! - **[`chat`]**: Bounded orchestration loop and SSE transport
//! - **[`mcp`]**: The same tools over MCP stdio (rmcp)
//! - **[`ingest`]**: Loading documents and record exports into domains

pub mod app;
pub mod chat;
pub mod config;
pub mod db;
pub mod embedder;
pub mod ingest;
pub mod llm;
pub mod mcp;
pub mod retrieval;
pub mod tools;
