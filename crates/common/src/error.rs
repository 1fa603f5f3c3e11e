//! Error types for clnrm

use std::time::Duration;
use thiserror::Error;

use crate::types::LifecycleState;

/// Result type alias using the clnrm Error
pub type Result<T> = std::result::Result<T, Error>;

/// clnrm error types
///
/// Step failures and trace assertion failures are not errors: they are test
/// outcomes recorded in `StepResult` and `AssertionOutcome`. Everything here
/// means the run could not be carried out as declared.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error at {path}: {message}")]
    Validation { path: String, message: String },

    #[error("Unknown service plugin '{plugin}'{}", required_by(.service))]
    PluginNotFound { plugin: String, service: String },

    #[error("Service {service} failed to start via plugin {plugin} (last state: {last_state}): {reason}")]
    ServiceStart {
        service: String,
        plugin: String,
        last_state: LifecycleState,
        reason: String,
    },

    #[error("Service {service} did not become healthy within {waited:?}")]
    HealthCheckTimeout { service: String, waited: Duration },

    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    /// The runtime was reachable but refused the request (bad image, port conflict)
    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn required_by(service: &str) -> String {
    if service.is_empty() {
        String::new()
    } else {
        format!(" (required by service {})", service)
    }
}

/// Coarse classification used to pick process exit codes and report buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    ServiceStart,
    Infrastructure,
    Internal,
}

impl Error {
    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Error::Infrastructure(message.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Validation { .. } | Error::PluginNotFound { .. } | Error::Toml(_) | Error::Regex(_) => {
                ErrorClass::Validation
            }
            Error::ServiceStart { .. } | Error::HealthCheckTimeout { .. } | Error::Runtime(_) => {
                ErrorClass::ServiceStart
            }
            Error::Infrastructure(_) | Error::Io(_) | Error::Database(_) => ErrorClass::Infrastructure,
            Error::Cancelled | Error::Serialization(_) | Error::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Whether the error is a structural problem with the test definition
    pub fn is_validation(&self) -> bool {
        self.class() == ErrorClass::Validation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            Error::validation("services.db.depends_on[0]", "cycle").class(),
            ErrorClass::Validation
        );
        assert_eq!(Error::infrastructure("docker down").class(), ErrorClass::Infrastructure);
        assert_eq!(
            Error::Runtime("pull access denied".into()).class(),
            ErrorClass::ServiceStart
        );
        let err = Error::HealthCheckTimeout {
            service: "db".into(),
            waited: Duration::from_secs(3),
        };
        assert_eq!(err.class(), ErrorClass::ServiceStart);
    }

    #[test]
    fn test_validation_message_carries_path() {
        let err = Error::validation("steps[2].service", "unknown service 'cache'");
        assert_eq!(
            err.to_string(),
            "Validation error at steps[2].service: unknown service 'cache'"
        );
    }
}
