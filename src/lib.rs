//! Persistent fragment memory for AI agents — cross-session, structured, queryable via MCP.
//!
//! mnemon is an [MCP](https://modelcontextprotocol.io/) server that gives stateless
//! agents a durable memory. Knowledge is stored as **fragments** — short, typed,
//! PII-redacted records with importance, lifecycle tiers, and a link graph:
//!
//! | Type | Default importance | Default tier |
//! |------|--------------------|--------------|
//! | **preference** | 0.95 | permanent |
//! | **error** | 0.90 | hot |
//! | **decision** | 0.80 | permanent |
//! | **procedure** | 0.70 | hot |
//! | **relation** | 0.60 | warm |
//! | **fact** | 0.50 | warm |
//!
//! # Architecture
//!
//! - **Storage**: SQLite with FTS5 for keyword overlap and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for vector search
//! - **Retrieval**: three-tier cascade — in-process keyword sets (L1), durable
//!   keyword overlap (L2), cosine similarity (L3) — merged and ranked by a
//!   composite importance/recency score under a token budget
//! - **Lifecycle**: importance decay, tier transitions, expiry sweeps, anchors,
//!   and an eleven-stage consolidation pipeline with hybrid NLI + LLM
//!   contradiction detection
//! - **Transport**: MCP over stdio (primary) or streamable HTTP
//!
//! # Modules
//!
//! - [`config`] — Configuration loading from TOML files and environment variables
//! - [`db`] — SQLite database initialization, schema, migrations, and health checks
//! - [`embedding`] — Remote text-embedding provider (1536-dim unit vectors)
//! - [`llm`] — JSON-completion client for evaluation, reflection, and arbitration
//! - [`nli`] — Entailment/contradiction classifier (local ONNX or remote HTTP)
//! - [`memory`] — Core engine: factory, index, store, search, lifecycle, facade

pub mod config;
pub mod db;
pub mod embedding;
pub mod llm;
pub mod memory;
pub mod nli;
