use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the Bear library
#[derive(Debug, Error)]
pub enum BearError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// The worker pool was closed before the work could run
    #[error("Worker pool shut down: {operation}")]
    PoolShutdown { operation: String },

    /// A remote command exited unsuccessfully
    #[error("Command failed on {host}: `{command}` exited with {exit_code}")]
    Command {
        host: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// Release bookkeeping errors
    #[error("Release error: {message}")]
    Release { message: String },

    /// Network/IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A grid cell lookup or aggregation failed
    #[error(transparent)]
    Phase(#[from] PhaseError),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl BearError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error for a specific field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error with field
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn pool_shutdown<S: Into<String>>(operation: S) -> Self {
        Self::PoolShutdown {
            operation: operation.into(),
        }
    }

    /// Create a command error from a failed remote invocation
    pub fn command<H: Into<String>, C: Into<String>>(
        host: H,
        command: C,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        Self::Command {
            host: host.into(),
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    pub fn release<S: Into<String>>(message: S) -> Self {
        Self::Release {
            message: message.into(),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } | Self::Command { .. } => true,
            Self::Phase(err) => err.is_timeout(),
            Self::Configuration { .. } | Self::Validation { .. } => false,
            Self::PoolShutdown { .. } | Self::Release { .. } => false,
            _ => false,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::Validation { .. } => "validation",
            Self::PoolShutdown { .. } => "pool",
            Self::Command { .. } => "command",
            Self::Release { .. } => "release",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Phase(_) => "phase",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, BearError>;

impl From<std::io::Error> for BearError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for BearError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for BearError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<anyhow::Error> for BearError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
            source: Some(err.into()),
        }
    }
}

/// How a single (phase, party) cell failed.
///
/// Every reader of a cell observes the same value, so the causes are shared
/// behind `Arc`. `Computation`, `Upstream` and `Timeout` are the ordinary
/// outcomes; `TypeMismatch` and `Aborted` signal misuse of a lookup and a
/// worker pool that was shut down before the party could run.
#[derive(Debug, Clone, Error)]
pub enum PhaseError {
    /// The phase computation itself returned an error or panicked
    #[error("phase {phase} failed for party {party}: {cause:#}")]
    Computation {
        phase: usize,
        party: usize,
        cause: Arc<anyhow::Error>,
    },

    /// The party broke in an earlier phase; this phase never ran
    #[error("phase {phase} skipped for party {party}: upstream failure in phase {failed_phase}: {cause:#}")]
    Upstream {
        phase: usize,
        party: usize,
        failed_phase: usize,
        cause: Arc<anyhow::Error>,
    },

    /// A bounded wait elapsed before the cell resolved
    #[error("timed out after {waited:?} waiting for phase {phase} of party {party}")]
    Timeout {
        phase: usize,
        party: usize,
        waited: Duration,
    },

    #[error("phase {phase} of party {party} holds {actual}, not {expected}")]
    TypeMismatch {
        phase: usize,
        party: usize,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("phase {phase} of party {party} never ran: worker pool shut down")]
    Aborted { phase: usize, party: usize },
}

impl PhaseError {
    pub fn computation(phase: usize, party: usize, cause: anyhow::Error) -> Self {
        Self::Computation {
            phase,
            party,
            cause: Arc::new(cause),
        }
    }

    /// Phase index of the cell this error was recorded on
    pub fn phase(&self) -> usize {
        match self {
            Self::Computation { phase, .. }
            | Self::Upstream { phase, .. }
            | Self::Timeout { phase, .. }
            | Self::TypeMismatch { phase, .. }
            | Self::Aborted { phase, .. } => *phase,
        }
    }

    /// Party index of the cell this error was recorded on
    pub fn party(&self) -> usize {
        match self {
            Self::Computation { party, .. }
            | Self::Upstream { party, .. }
            | Self::Timeout { party, .. }
            | Self::TypeMismatch { party, .. }
            | Self::Aborted { party, .. } => *party,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream { .. })
    }

    /// The underlying computation error, if there is one
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Computation { cause, .. } | Self::Upstream { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }

    /// Finds a `PhaseError` a computation propagated from one of its own
    /// dependency waits.
    pub fn dependency(&self) -> Option<&PhaseError> {
        self.cause()
            .and_then(|cause| cause.chain().find_map(|e| e.downcast_ref::<PhaseError>()))
    }
}

/// Failure of a single-flight operation, shared by every joiner
#[derive(Debug, Clone, Error)]
#[error("shared operation failed: {cause:#}")]
pub struct FlightError {
    cause: Arc<anyhow::Error>,
}

impl FlightError {
    pub fn new(cause: anyhow::Error) -> Self {
        Self {
            cause: Arc::new(cause),
        }
    }

    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }

    /// True when both handles refer to the very same recorded failure
    pub fn same_failure(&self, other: &FlightError) -> bool {
        Arc::ptr_eq(&self.cause, &other.cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = BearError::configuration("max_workers must be greater than 0");
        assert!(matches!(err, BearError::Configuration { .. }));
        assert_eq!(err.category(), "configuration");
    }

    #[test]
    fn test_error_recoverability() {
        let timeout = PhaseError::Timeout {
            phase: 0,
            party: 2,
            waited: Duration::from_millis(500),
        };
        assert!(BearError::from(timeout).is_recoverable());
        assert!(!BearError::validation("test").is_recoverable());
        assert!(!BearError::release("won't delete current release").is_recoverable());
    }

    #[test]
    fn test_phase_error_accessors() {
        let err = PhaseError::computation(1, 2, anyhow::anyhow!("boom"));
        assert_eq!(err.phase(), 1);
        assert_eq!(err.party(), 2);
        assert!(!err.is_timeout());
        assert_eq!(err.cause().map(|c| c.to_string()), Some("boom".to_string()));
        assert!(err.to_string().contains("phase 1 failed for party 2: boom"));
    }

    #[test]
    fn test_dependency_is_found_through_context() {
        let upstream = PhaseError::computation(0, 2, anyhow::anyhow!("2"));
        let cause = anyhow::Error::new(upstream).context("waiting on build of party 2");
        let err = PhaseError::computation(1, 0, cause);

        let dep = err.dependency().expect("dependency error");
        assert_eq!((dep.phase(), dep.party()), (0, 2));
        assert!(!dep.is_timeout());
    }

    #[test]
    fn test_flight_error_identity() {
        let err = FlightError::new(anyhow::anyhow!("download failed"));
        let joined = err.clone();
        assert!(err.same_failure(&joined));
        assert!(!err.same_failure(&FlightError::new(anyhow::anyhow!("download failed"))));
    }
}
