//! Error types for the backend core.
//!
//! Using thiserror for idiomatic error handling. Every failure here is
//! recoverable at function granularity: the caller stops generating the
//! current function, discards its buffer, and reports a diagnostic.

use thiserror::Error;

/// Main error type for code generation and optimization.
#[derive(Error, Debug)]
pub enum CodegenError {
    #[error("Invalid {opcode} instruction: {reason}")]
    InvalidInstruction { opcode: &'static str, reason: String },

    #[error("Register allocation failed: {reason}")]
    RegisterAllocationFailed { reason: String },

    #[error("Label not found: {name}")]
    LabelNotFound { name: String },

    #[error("Label already defined: {name}")]
    LabelRedefined { name: String },

    #[error("Unsupported operation: {what}")]
    UnsupportedOperation { what: String },

    #[error("ABI violation: {reason}")]
    AbiViolation { reason: String },

    #[error("Malformed control-flow graph: {reason}")]
    MalformedCfg { reason: String },

    #[error("Assembly output buffer exhausted")]
    OutputExhausted,
}

impl CodegenError {
    /// Shorthand for the common unsupported-construct case.
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::UnsupportedOperation { what: what.into() }
    }
}

/// Result type alias for backend operations.
pub type CodegenResult<T> = Result<T, CodegenError>;
