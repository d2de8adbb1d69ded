//! # codescope
//!
//! Semantic code analysis over repository snapshots.
//!
//! codescope ingests a repository (local directory, `.zip` archive, or git
//! URL) into an immutable snapshot, chunks and embeds its code into a
//! vector index, runs a dependency-ordered team of analysis roles over
//! that index to produce a structured report, and answers questions
//! grounded in retrieved code, prior findings and the chat history.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   Sources    │──▶│ Chunk+Embed  │──▶│    SQLite    │
//! │ dir/zip/git  │   │  (pipeline)  │   │ + VectorIndex│
//! └──────────────┘   └──────────────┘   └──────┬───────┘
//!                                              │
//!                         ┌────────────────────┤
//!                         ▼                    ▼
//!                  ┌──────────────┐     ┌──────────────┐
//!                  │ Orchestrator │────▶│     Chat     │
//!                  │ (task graph) │     │  (context)   │
//!                  └──────────────┘     └──────────────┘
//! ```
//!
//! Pure logic (chunker, index, task graph, context assembly) lives in
//! [`codescope_core`]; this crate supplies configuration, persistence,
//! HTTP model providers and the command implementations.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`source`] | Directory, archive and git sources |
//! | [`ingest`] | Snapshot ingestion and re-indexing |
//! | [`index_build`] | Embedding pipeline and index swap |
//! | [`embedding`] | Embedding providers |
//! | [`generation`] | Text generation providers |
//! | [`retry`] | Timeout and backoff around provider calls |
//! | [`orchestrator`] | Analysis run scheduler |
//! | [`chat`] | Question answering over a snapshot |
//! | [`services`] | Shared handles and snapshot resolution |
//! | [`sqlite_store`] | SQLite implementation of the store |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`http`] | Shared HTTP client and error classification |
//! | [`progress`] | Progress reporting on stderr |
//! | [`status`], [`search`], [`report`] | Command output rendering |

pub mod chat;
pub mod config;
pub mod db;
pub mod embedding;
pub mod generation;
pub mod http;
pub mod index_build;
pub mod ingest;
pub mod migrate;
pub mod orchestrator;
pub mod progress;
pub mod report;
pub mod retry;
pub mod search;
pub mod services;
pub mod source;
pub mod sqlite_store;
pub mod status;
