//! Error types for the template engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for template engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Template {template_id} rejected: {reason}")]
    Template { template_id: String, reason: String },

    #[error("Request generation failed: {reason}")]
    Generation { reason: String },

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Out-of-band interaction failed: {0}")]
    Oob(#[from] OobError),

    #[error("Configuration error: {component} - {reason}")]
    Configuration { component: String, reason: String },

    #[error("Execution cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("I/O error: {error}")]
    Io { error: String },

    #[error("Serialization error: {error}")]
    Serialization { error: String },
}

/// Failures raised by the expression evaluator and by pattern compilation
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("Syntax error at offset {position}: {reason}")]
    Syntax { position: usize, reason: String },

    #[error("Undefined variable: {name}")]
    UndefinedVariable { name: String },

    #[error("Unknown function: {name}")]
    UnknownFunction { name: String },

    #[error("Invalid arguments for {function}: {reason}")]
    InvalidArguments { function: String, reason: String },

    #[error("Type mismatch: {reason}")]
    Type { reason: String },

    #[error("Invalid pattern {pattern}: {reason}")]
    Pattern { pattern: String, reason: String },
}

/// Failures raised by HTTP and raw TCP transports
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportError {
    #[error("Connection to {target} failed: {reason}")]
    Connection { target: String, reason: String },

    #[error("Timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("Malformed request packet: {reason}")]
    MalformedRequest { reason: String },

    #[error("Unsupported by this transport: {reason}")]
    Unsupported { reason: String },

    #[error("I/O error: {reason}")]
    Io { reason: String },
}

/// Failures raised by out-of-band providers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OobError {
    #[error("No OOB provider registered under {name}")]
    UnknownProvider { name: String },

    #[error("Provider {provider} could not allocate an address: {reason}")]
    Acquire { provider: String, reason: String },

    #[error("Polling {provider} failed: {reason}")]
    Poll { provider: String, reason: String },
}

/// Coarse grouping of errors used for logging and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Template,
    Generation,
    Transport,
    Evaluation,
    Configuration,
    Cancellation,
    System,
}

impl EngineError {
    /// Create a template error for the given template id
    pub fn template(template_id: &str, reason: impl Into<String>) -> Self {
        Self::Template {
            template_id: template_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a request generation error
    pub fn generation(reason: impl Into<String>) -> Self {
        Self::Generation {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: &str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: &str) -> Self {
        Self::Cancelled {
            operation: operation.to_string(),
        }
    }

    /// Check if the failure only affects one piece of work and the caller may carry on
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Generation { .. } => true,
            EngineError::Transport(_) => true,
            EngineError::Evaluation(_) => true,
            EngineError::Io { .. } => true,

            EngineError::Template { .. } => false,
            EngineError::Oob(_) => false,
            EngineError::Configuration { .. } => false,
            EngineError::Cancelled { .. } => false,
            EngineError::Serialization { .. } => false,
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Template { .. } => ErrorCategory::Template,
            EngineError::Generation { .. } => ErrorCategory::Generation,
            EngineError::Transport(_) => ErrorCategory::Transport,
            EngineError::Oob(_) => ErrorCategory::Transport,
            EngineError::Evaluation(_) => ErrorCategory::Evaluation,
            EngineError::Configuration { .. } => ErrorCategory::Configuration,
            EngineError::Cancelled { .. } => ErrorCategory::Cancellation,
            EngineError::Io { .. } | EngineError::Serialization { .. } => ErrorCategory::System,
        }
    }
}

impl EvaluationError {
    pub fn invalid_arguments(function: &str, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            function: function.to_string(),
            reason: reason.into(),
        }
    }

    pub fn pattern(pattern: &str, reason: impl ToString) -> Self {
        Self::Pattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether evaluation failed only because a name could not be looked up
    pub fn is_undefined(&self) -> bool {
        matches!(
            self,
            EvaluationError::UndefinedVariable { .. } | EvaluationError::UnknownFunction { .. }
        )
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io {
            error: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization {
            error: err.to_string(),
        }
    }
}

impl From<url::ParseError> for EngineError {
    fn from(err: url::ParseError) -> Self {
        EngineError::Generation {
            reason: format!("invalid target URL: {}", err),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => TransportError::Timeout { duration_ms: 0 },
            _ => TransportError::Io {
                reason: err.to_string(),
            },
        }
    }
}
