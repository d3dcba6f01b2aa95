//! Error types for the coverage tracer

use crate::code::CodeId;
use crate::monitor::ToolId;

/// Result type for tracer operations
pub type TraceResult<T> = Result<T, TraceError>;

/// Errors raised while starting the tracer or handling a VM event
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceError {
    /// A collaborator required by `start()` was never attached
    #[error("Tracer is missing its {0} collaborator")]
    MissingCollaborator(&'static str),

    /// The data store records a different mode than the tracer was configured for
    #[error("Data store records {store}, but the tracer was configured for {tracer}")]
    ModeMismatch {
        /// Mode of the attached data store
        store: &'static str,
        /// Mode of the tracer configuration
        tracer: &'static str,
    },

    /// The host refused to hand out the tool identity
    #[error("Tool id {tool} unavailable: {message}")]
    ToolUnavailable {
        /// Requested tool id
        tool: ToolId,
        /// Reason given by the host
        message: String,
    },

    /// An exit-type event arrived with no matching entry on the frame stack
    #[error("Frame stack underflow on exit from code {code}")]
    StackUnderflow {
        /// Code unit the exit event was delivered for
        code: CodeId,
    },

    /// The trace-decision predicate failed for a file
    #[error("should_trace failed for '{file}': {message}")]
    ShouldTrace {
        /// File name being decided
        file: String,
        /// Failure reported by the predicate
        message: String,
    },

    /// Deciding a file triggered a decision for the same file on the same thread
    #[error("should_trace for '{file}' re-entered its own decision")]
    ReentrantDecision {
        /// File name being decided
        file: String,
    },

    /// A code unit's instruction table cannot be turned into a line index
    #[error("Malformed code unit {code}: {reason}")]
    MalformedCode {
        /// Offending code unit
        code: CodeId,
        /// What is wrong with it
        reason: String,
    },
}

impl TraceError {
    /// Create a malformed-code error
    pub fn malformed(code: CodeId, reason: impl Into<String>) -> Self {
        Self::MalformedCode {
            code,
            reason: reason.into(),
        }
    }

    /// Whether this error ends the tracing session.
    ///
    /// Collaborator failures leave the tracer consistent and the failing file
    /// undecided, so the owner may retry; everything else is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TraceError::ShouldTrace { .. })
    }
}
