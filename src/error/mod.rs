//! Error types for relocation operations
//!
//! Every fallible operation in the crate returns [`RegistryError`]. Errors that
//! concern a particular artifact are wrapped with [`RegistryError::Reference`] so a
//! failure deep inside index recursion still names the reference at fault.

pub mod handlers;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Transport level failures (connection reset, timeout, DNS)
    #[error("Network error: {0}")]
    Network(String),
    /// Registry answered with an unexpected status
    #[error("Registry error: {0}")]
    Registry(String),
    /// Unauthorized or forbidden
    #[error("Authentication error: {0}")]
    Auth(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Validation error: {0}")]
    Validation(String),
    /// Artifact uses a format this crate cannot relocate (Docker schema 1)
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    /// Content arrived but does not match the digest that was requested
    #[error("Verification failed: {0}")]
    Verification(String),
    /// Broken internal invariant. Must never occur in correct operation.
    #[error("Internal inconsistency: {0}")]
    Internal(String),
    #[error("{reference}: {source}")]
    Reference {
        reference: String,
        #[source]
        source: Box<RegistryError>,
    },
    /// Marks an error that must not be retried regardless of its kind
    #[error("{0}")]
    NonRetryable(Box<RegistryError>),
}

impl RegistryError {
    /// Wraps the error with the name of the reference it concerns
    pub fn with_reference(self, reference: impl Into<String>) -> Self {
        RegistryError::Reference {
            reference: reference.into(),
            source: Box::new(self),
        }
    }

    pub fn non_retryable(self) -> Self {
        match self {
            RegistryError::NonRetryable(_) => self,
            other => RegistryError::NonRetryable(Box::new(other)),
        }
    }

    /// The innermost error, looking through reference wrappers
    pub fn root(&self) -> &RegistryError {
        match self {
            RegistryError::Reference { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            RegistryError::Network(_) | RegistryError::Registry(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        match self.root() {
            RegistryError::NotFound(_) => true,
            RegistryError::NonRetryable(inner) => inner.is_not_found(),
            _ => false,
        }
    }

    pub fn is_internal(&self) -> bool {
        match self.root() {
            RegistryError::Internal(_) => true,
            RegistryError::NonRetryable(inner) => inner.is_internal(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        RegistryError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        handlers::NetworkErrorHandler::handle_network_error(&err, "request")
    }
}

impl From<url::ParseError> for RegistryError {
    fn from(err: url::ParseError) -> Self {
        RegistryError::Validation(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for RegistryError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        RegistryError::Parse(format!("UTF-8 conversion error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_wrapping_keeps_classification() {
        let err = RegistryError::Network("connection reset".to_string())
            .with_reference("registry.example.com/app@sha256:abc");
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "registry.example.com/app@sha256:abc: Network error: connection reset"
        );
    }

    #[test]
    fn test_non_retryable_short_circuits() {
        let err = RegistryError::Network("flaky".to_string()).non_retryable();
        assert!(!err.is_retryable());
        assert!(!RegistryError::Auth("denied".to_string()).is_retryable());
        assert!(!RegistryError::NotFound("gone".to_string()).is_retryable());
    }

    #[test]
    fn test_internal_detection() {
        let err = RegistryError::Internal("layer missing".to_string()).with_reference("x");
        assert!(err.is_internal());
        assert!(!RegistryError::Validation("bad".to_string()).is_internal());
    }
}
