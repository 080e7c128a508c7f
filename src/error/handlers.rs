//! Mapping of HTTP and transport failures onto [`RegistryError`]

use crate::error::RegistryError;
use reqwest::StatusCode;

/// Standard error handler for registry HTTP responses
pub struct HttpErrorHandler;

impl HttpErrorHandler {
    /// Map a failed registry response to an error kind the retry policy understands
    pub fn handle_registry_error(
        status: StatusCode,
        error_text: &str,
        operation: &str,
    ) -> RegistryError {
        match status.as_u16() {
            401 => RegistryError::Auth(format!(
                "Unauthorized to perform {} operation: {}",
                operation, error_text
            )),
            403 => RegistryError::Auth(format!(
                "Forbidden: insufficient permissions for {}: {}",
                operation, error_text
            )),
            404 => RegistryError::NotFound(format!(
                "Resource not found for {}: {}",
                operation, error_text
            )),
            400 | 405 | 413 | 422 => RegistryError::Registry(format!(
                "{} rejected (status {}): {}",
                operation, status, error_text
            ))
            .non_retryable(),
            429 => RegistryError::Registry(format!(
                "Rate limited during {}: {}",
                operation, error_text
            )),
            500 => RegistryError::Registry(format!(
                "Registry server error during {}: {}",
                operation, error_text
            )),
            502 | 503 => RegistryError::Registry(format!(
                "Registry unavailable for {}: {}",
                operation, error_text
            )),
            _ => RegistryError::Registry(format!(
                "{} failed (status {}): {}",
                operation, status, error_text
            )),
        }
    }
}

/// Network error categorization
pub struct NetworkErrorHandler;

impl NetworkErrorHandler {
    pub fn handle_network_error(error: &reqwest::Error, context: &str) -> RegistryError {
        if error.is_timeout() {
            RegistryError::Network(format!("{} timeout: {}", context, error))
        } else if error.is_connect() {
            RegistryError::Network(format!("Connection error during {}: {}", context, error))
        } else if error.is_decode() {
            RegistryError::Parse(format!("Malformed response during {}: {}", context, error))
        } else if error.to_string().contains("certificate") {
            RegistryError::Network(format!(
                "TLS certificate error during {}: {}",
                context, error
            ))
            .non_retryable()
        } else {
            RegistryError::Network(format!("{} network error: {}", context, error))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let unauthorized =
            HttpErrorHandler::handle_registry_error(StatusCode::UNAUTHORIZED, "", "manifest get");
        assert!(matches!(unauthorized, RegistryError::Auth(_)));
        assert!(!unauthorized.is_retryable());

        let missing =
            HttpErrorHandler::handle_registry_error(StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN", "get");
        assert!(missing.is_not_found());

        let busy =
            HttpErrorHandler::handle_registry_error(StatusCode::SERVICE_UNAVAILABLE, "", "blob get");
        assert!(busy.is_retryable());

        let bad = HttpErrorHandler::handle_registry_error(StatusCode::BAD_REQUEST, "", "put");
        assert!(!bad.is_retryable());
    }
}
