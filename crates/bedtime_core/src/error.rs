//! crates/bedtime_core/src/error.rs
//!
//! Defines the error type produced by a pipeline run. Its `Display` text is what
//! ends up in a failed story's error field.

use crate::outline::OutlineViolation;
use crate::ports::PortError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The account has no story quota left for the current window.
    #[error("Story limit reached: {0}")]
    Admission(String),

    /// The outline failed validation even after the repair request.
    #[error("Outline does not match the expected structure: {0}")]
    Schema(#[from] OutlineViolation),

    /// A model response could not be read as JSON.
    #[error("Could not parse model response: {0}")]
    Parse(String),

    /// Represents an error that propagated up from one of the core service ports.
    #[error("Service Port Error: {0}")]
    Port(#[from] PortError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
