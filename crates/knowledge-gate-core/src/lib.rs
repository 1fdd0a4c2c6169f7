//! # Knowledge Gate Core
//!
//! Shared logic for Knowledge Gate: data models, persona access policy,
//! embedding trait, vector store abstraction, the validation pipeline,
//! and the audit/escalation sink traits.
//!
//! This crate contains no tokio runtime, sqlx, network, or filesystem
//! dependencies. Every component here is testable in isolation; the
//! concrete backends (SQLite store, HTTP embedding providers, durable
//! sinks) live in the `knowledge-gate` app crate.

pub mod embedding;
pub mod error;
pub mod models;
pub mod policy;
pub mod sink;
pub mod store;
pub mod validate;
