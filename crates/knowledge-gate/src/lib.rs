//! # Knowledge Gate
//!
//! Resident- and persona-scoped knowledge retrieval for a conversational
//! assistant, with every retrieval gated through a multi-stage safety
//! validation pipeline before it reaches the language model or the user.
//!
//! ## Architecture
//!
//! ```text
//! query ──▶ cache ──▶ embed ──▶ vector search ──▶ validation ──▶ verdict
//!             │       (remote ▸   (tenant +        (6 stages)       │
//!             │        local      persona filter)                   ▼
//!             │        fallback)                              audit record
//!            hit ───────────────────────────────────────────▶ + escalation
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | SQLite connection and schema |
//! | [`sqlite_store`] | SQLite-backed vector store |
//! | [`embedding`] | Remote/local embedding providers with fallback |
//! | [`cache`] | Single-flight LRU cache |
//! | [`ingest`] | Document chunking and ingestion |
//! | [`orchestrator`] | The retrieval control loop |
//! | [`policy_store`] | Persona policy loading and hot reload |
//! | [`sinks`] | Durable audit and escalation sinks |
//! | [`server`] | HTTP query API |

pub mod cache;
pub mod config;
pub mod db;
pub mod embedding;
pub mod ingest;
pub mod orchestrator;
pub mod policy_store;
pub mod server;
pub mod sinks;
pub mod sqlite_store;
