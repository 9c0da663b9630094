//! Custom error types for the SPEC file writer.
//!
//! This module defines the primary error type, `SpecError`, shared by every stage of the
//! export pipeline. Using the `thiserror` crate, it gives the classifier, the serializer
//! and the export driver a single vocabulary for failures.
//!
//! ## Error Hierarchy
//!
//! - **`UnsupportedPlanKind`**: The run's plan is not a count, scan or relative scan. This
//!   is recoverable: nothing has been written for the run and callers usually skip it.
//! - **`OutOfOrderDocument`**: A document arrived in a state that does not allow it. The
//!   serializer closes itself and refuses further documents.
//! - **`ColumnMismatch`**: An event cannot be mapped onto the registered column layout.
//!   The scan in progress is discarded rather than written with a malformed row.
//! - **`Template`**: A file prefix template references a field the run start lacks.
//! - **`Io`**, **`Json`**, **`Config`**: Wrapped errors from the underlying libraries.
//!
//! By using `#[from]`, `SpecError` can be created from underlying error types with `?`.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type SpecResult<T> = std::result::Result<T, SpecError>;

/// Errors raised while classifying, serializing or exporting run documents.
#[derive(Error, Debug)]
pub enum SpecError {
    /// The plan is not one of the shapes the SPEC format can describe.
    #[error("Unsupported plan '{plan_name}': {reason}")]
    UnsupportedPlanKind {
        /// Plan name recorded in the run start.
        plan_name: String,
        /// Why the plan could not be classified.
        reason: String,
    },

    /// A document arrived in a state that does not permit it.
    #[error("Out of order document: '{kind}' received while {state}")]
    OutOfOrderDocument {
        /// Serializer state when the document arrived.
        state: String,
        /// Document kind that was rejected.
        kind: String,
    },

    /// An event does not fit the column layout registered for its stream.
    #[error("Column mismatch in stream '{stream}': {detail}")]
    ColumnMismatch {
        /// Stream (or descriptor uid, when unknown) the event belongs to.
        stream: String,
        /// Description of the mismatch.
        detail: String,
    },

    /// A file prefix template could not be resolved.
    #[error("File prefix template error: {0}")]
    Template(String),

    /// Configuration loaded but holds invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration sources could not be read or merged.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Output file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A document could not be decoded.
    #[error("Document decode error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SpecError {
    /// Returns `true` when the error only affects the current run and the export
    /// session may continue with the next one.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SpecError::UnsupportedPlanKind { .. } | SpecError::ColumnMismatch { .. }
        )
    }

    pub(crate) fn unsupported(plan_name: &str, reason: impl Into<String>) -> Self {
        SpecError::UnsupportedPlanKind {
            plan_name: plan_name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn mismatch(stream: &str, detail: impl Into<String>) -> Self {
        SpecError::ColumnMismatch {
            stream: stream.to_string(),
            detail: detail.into(),
        }
    }
}

impl From<figment::Error> for SpecError {
    fn from(err: figment::Error) -> Self {
        SpecError::Config(Box::new(err))
    }
}
