//! Error model for parameters and validation.

use thiserror::Error;

/// Result of validating a set of job parameters.
pub type ValidationResult = Result<(), ValidationError>;

/// Job parameters were rejected before the job started.
///
/// Returned by validators; the launcher refuses to create any execution record
/// when it sees one of these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// One or more required keys are absent.
    #[error("missing required parameters: {}", .0.join(", "))]
    MissingKeys(Vec<String>),

    /// A parameter is present but its value breaks a rule.
    #[error("invalid parameter '{name}': {reason}")]
    InvalidValue { name: String, reason: String },

    /// Free-form rejection from a custom validator.
    #[error("{0}")]
    Rejected(String),
}

impl ValidationError {
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }
}

/// A parameter could not be built, converted or read with the requested type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParameterError {
    #[error("malformed parameter definition: {0}")]
    Malformed(String),

    #[error("unknown parameter type '{0}'")]
    UnknownType(String),

    #[error("invalid value for '{name}': {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("parameter '{name}' is a {actual}, not a {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
}

impl ParameterError {
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Reading or writing an execution context entry failed.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("context value for '{key}' could not be converted: {source}")]
    Conversion {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}
