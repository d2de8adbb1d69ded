//! # codescope core
//!
//! Pure logic shared by the `codescope` CLI: data models, the error
//! taxonomy, the code chunker, the embedding index and retriever, the
//! project overview, the agent task graph, reports, and chat context
//! assembly.
//!
//! This crate performs no filesystem, network, or database I/O. External
//! capabilities (embedding, text generation, persistence) are expressed
//! as traits and implemented by the application crate.

pub mod analysis;
pub mod chunk;
pub mod context;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod graph;
pub mod index;
pub mod models;
pub mod overview;
pub mod report;
pub mod retrieve;
pub mod roles;
pub mod session;
pub mod store;
