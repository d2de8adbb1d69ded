//! Error taxonomy for the analysis and retrieval pipeline.
//!
//! Per-file, per-chunk and per-node failures are values recorded in
//! snapshot statistics or reports. Only run-level errors
//! ([`IngestionError`] when nothing could be ingested, [`InvalidTaskGraph`])
//! abort an operation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::roles::AgentRole;

/// Failures while obtaining or decoding repository contents.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestionError {
    /// The directory, archive, or remote repository could not be read.
    #[error("source unavailable: {source_ref}: {reason}")]
    SourceUnavailable { source_ref: String, reason: String },

    /// The uploaded archive could not be opened or contains unsafe entries.
    #[error("archive corrupt: {reason}")]
    ArchiveCorrupt { reason: String },

    /// A single file is not valid UTF-8 text.
    #[error("unsupported encoding: {path}")]
    UnsupportedEncoding { path: String },

    /// Every candidate file was skipped or failed to decode.
    #[error("no usable files in {source_ref}")]
    NoUsableFiles { source_ref: String },
}

/// Failure of the external `embed` capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct EmbeddingError {
    pub message: String,
    /// Transient failures (rate limits, timeouts, 5xx) may be retried.
    pub retryable: bool,
}

impl EmbeddingError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Failure of the external `generate` capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ModelError {
    pub message: String,
    pub retryable: bool,
}

impl ModelError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// The task graph cannot be scheduled. Detected before any node runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidTaskGraph {
    #[error("task graph has no nodes")]
    Empty,

    #[error("role '{0}' is declared more than once")]
    DuplicateRole(AgentRole),

    #[error("role '{role}' depends on '{dependency}', which is not part of the graph")]
    UnknownDependency {
        role: AgentRole,
        dependency: AgentRole,
    },

    /// Roles that participate in (or sit downstream of) a dependency cycle.
    #[error("dependency cycle among roles: {}", format_roles(.0))]
    Cycle(Vec<AgentRole>),
}

fn format_roles(roles: &[AgentRole]) -> String {
    roles
        .iter()
        .map(|r| r.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Terminal failure marker for one task-graph node.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The generation call failed (after retries, for transient errors).
    #[error("model error: {message}")]
    Model { message: String, retryable: bool },

    /// The model answered, but not with the structured output the role requires.
    #[error("invalid output: {message}")]
    InvalidOutput { message: String },

    /// A dependency failed, so this node was never invoked.
    #[error("upstream role '{upstream}' failed")]
    UpstreamFailure { upstream: AgentRole },

    /// The node's task panicked; siblings keep running.
    #[error("task panicked: {message}")]
    Panicked { message: String },

    #[error("cancelled")]
    Cancelled,
}

impl From<ModelError> for FailureReason {
    fn from(err: ModelError) -> Self {
        FailureReason::Model {
            message: err.message,
            retryable: err.retryable,
        }
    }
}
