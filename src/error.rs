//! Error taxonomy shared by the selector, backends, gates, and pipelines.
//!
//! Every failure that crosses a component boundary is a [`RagError`].
//! Selector-level variants (`UnsupportedBackendKind`, `MissingConfiguration`,
//! `BackendConnectionError`) are fatal to the request or session; the
//! conversation loop recovers locally from `GenerationBackendError` and
//! friends. The server maps each variant to an HTTP status and a
//! machine-readable code via [`RagError::status`] and [`RagError::error_code`].

use axum::http::StatusCode;
use thiserror::Error;

/// Backend family named in selector errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendFamily {
    Store,
    Embedding,
    Generation,
}

impl std::fmt::Display for BackendFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendFamily::Store => write!(f, "store"),
            BackendFamily::Embedding => write!(f, "embedding"),
            BackendFamily::Generation => write!(f, "generation-framework"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RagError {
    /// The requested kind is not one of the enumerated variants of its family.
    #[error("unsupported {family} kind: '{value}'")]
    UnsupportedBackendKind { family: BackendFamily, value: String },

    /// A required parameter is absent after merging caller values over defaults.
    #[error("missing configuration for {family} backend: '{key}'")]
    MissingConfiguration { family: BackendFamily, key: String },

    /// The backend could not be opened: unreachable, bad credentials, or misconfigured.
    #[error("backend connection error ({backend}): {message}")]
    BackendConnectionError { backend: String, message: String },

    /// Embedding vectors were absent, non-numeric, or of the wrong length.
    #[error("embedding failure: {0}")]
    EmbeddingFailure(String),

    /// A write was rejected as a whole; `failed` lists the offending indices.
    #[error("write rejected, failed documents at indices {failed:?}: {reason}")]
    PartialWriteError { failed: Vec<usize>, reason: String },

    /// The language-generation provider returned an error or an unusable reply.
    #[error("generation backend error{}: {message}", status_suffix(.status))]
    GenerationBackendError { status: Option<u16>, message: String },

    /// Token missing, invalid, or expired.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Token valid but lacks the required role.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Request payload could not be interpreted (bad CSV row, unknown job id format, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" {}", s)).unwrap_or_default()
}

pub type RagResult<T> = std::result::Result<T, RagError>;

impl RagError {
    pub fn connection(backend: impl Into<String>, message: impl std::fmt::Display) -> Self {
        RagError::BackendConnectionError {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    pub fn generation(status: Option<u16>, message: impl Into<String>) -> Self {
        RagError::GenerationBackendError {
            status,
            message: message.into(),
        }
    }

    /// Machine-readable code used in API error bodies and logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            RagError::UnsupportedBackendKind { .. } => "UNSUPPORTED_BACKEND_KIND",
            RagError::MissingConfiguration { .. } => "MISSING_CONFIGURATION",
            RagError::BackendConnectionError { .. } => "BACKEND_CONNECTION_ERROR",
            RagError::EmbeddingFailure(_) => "EMBEDDING_FAILURE",
            RagError::PartialWriteError { .. } => "PARTIAL_WRITE_ERROR",
            RagError::GenerationBackendError { .. } => "GENERATION_BACKEND_ERROR",
            RagError::Unauthorized(_) => "UNAUTHORIZED",
            RagError::Forbidden(_) => "FORBIDDEN",
            RagError::InvalidRequest(_) => "INVALID_REQUEST",
            RagError::NotFound(_) => "NOT_FOUND",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RagError::UnsupportedBackendKind { .. }
            | RagError::MissingConfiguration { .. }
            | RagError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RagError::PartialWriteError { .. } | RagError::EmbeddingFailure(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            RagError::BackendConnectionError { .. } | RagError::GenerationBackendError { .. } => {
                StatusCode::BAD_GATEWAY
            }
            RagError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RagError::Forbidden(_) => StatusCode::FORBIDDEN,
            RagError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::BackendConnectionError { .. } | RagError::GenerationBackendError { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_unique() {
        let errors = vec![
            RagError::UnsupportedBackendKind {
                family: BackendFamily::Store,
                value: "x".into(),
            },
            RagError::MissingConfiguration {
                family: BackendFamily::Store,
                key: "path".into(),
            },
            RagError::connection("sqlite", "nope"),
            RagError::EmbeddingFailure("bad".into()),
            RagError::PartialWriteError {
                failed: vec![1],
                reason: "bad".into(),
            },
            RagError::generation(Some(500), "boom"),
            RagError::Unauthorized("t".into()),
            RagError::Forbidden("t".into()),
            RagError::InvalidRequest("t".into()),
            RagError::NotFound("t".into()),
        ];
        let mut codes: Vec<&str> = errors.iter().map(|e| e.error_code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_messages_name_family_and_value() {
        let err = RagError::UnsupportedBackendKind {
            family: BackendFamily::Embedding,
            value: "word2vec".into(),
        };
        assert_eq!(err.to_string(), "unsupported embedding kind: 'word2vec'");

        let err = RagError::MissingConfiguration {
            family: BackendFamily::Store,
            key: "password".into(),
        };
        assert!(err.to_string().contains("'password'"));
    }

    #[test]
    fn test_generation_error_includes_status() {
        let err = RagError::generation(Some(429), "rate limited");
        assert_eq!(err.to_string(), "generation backend error 429: rate limited");
        let err = RagError::generation(None, "empty reply");
        assert_eq!(err.to_string(), "generation backend error: empty reply");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_auth_statuses() {
        assert_eq!(
            RagError::Unauthorized("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(RagError::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
    }
}
