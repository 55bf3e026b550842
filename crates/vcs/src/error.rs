//! Error types for the VCS integration.

use axum::http::StatusCode;
use thiserror::Error;
use uuid::Uuid;

use crate::models::ReleaseStatus;

/// Result alias used throughout the crate.
pub type VcsResult<T> = Result<T, VcsError>;

/// Errors raised while syncing repositories and processing releases.
#[derive(Debug, Error)]
pub enum VcsError {
    /// The user has no access relation to the repository.
    #[error("{}", .message.as_deref().unwrap_or("The user cannot access this repository"))]
    RepositoryAccess {
        user_id: Option<i64>,
        repository: Option<String>,
        message: Option<String>,
    },

    #[error("{}", .message.as_deref().unwrap_or("This repository is not enabled for webhooks."))]
    RepositoryDisabled {
        repository: String,
        message: Option<String>,
    },

    #[error("{}", .message.as_deref().unwrap_or("The repository does not exist."))]
    RepositoryNotFound {
        repository: String,
        message: Option<String>,
    },

    #[error("Repository {provider}:{provider_id} already exists")]
    RepositoryAlreadyExists {
        provider: String,
        provider_id: String,
    },

    /// The event sender cannot be attributed to a platform user.
    #[error("{}", .message.as_deref().unwrap_or("Invalid sender for event"))]
    InvalidSender {
        sender: Option<String>,
        message: Option<String>,
    },

    #[error("{}", .message.as_deref().unwrap_or("The release has already been received."))]
    ReleaseAlreadyReceived {
        release: String,
        message: Option<String>,
    },

    /// Publishing failed and must not be retried.
    #[error("{message}")]
    ReleaseNoRetry { message: String },

    #[error("{}", .message.as_deref().unwrap_or("Release does not exist."))]
    ReleaseNotFound { message: Option<String> },

    #[error("Invalid status transition for release '{release_id}': {from} -> {to}")]
    InvalidTransition {
        release_id: Uuid,
        from: ReleaseStatus,
        to: ReleaseStatus,
    },

    #[error("{}", .message.as_deref().unwrap_or("The OAuth session token was not found."))]
    TokenNotFound {
        user_id: i64,
        message: Option<String>,
    },

    #[error("{}", .message.as_deref().unwrap_or("RemoteAccount not found for user"))]
    RemoteAccountNotFound {
        user_id: i64,
        message: Option<String>,
    },

    #[error("{}", .message.as_deref().unwrap_or("RemoteAccount extra data not set for user."))]
    RemoteAccountDataNotSet {
        user_id: i64,
        message: Option<String>,
    },

    #[error("{}", .message.as_deref().unwrap_or("Provider API returned an unexpected error."))]
    UnexpectedProviderResponse { message: Option<String> },

    #[error("{}", .message.as_deref().unwrap_or("Error fetching release zipball file."))]
    ReleaseZipballFetch { message: Option<String> },

    #[error("{}", .message.as_deref().unwrap_or("Provider did not return user profile information."))]
    UserInfoNone { message: Option<String> },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Provider '{0}' is not registered")]
    ProviderNotRegistered(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VcsError {
    pub fn repository_not_found(repository: impl Into<String>) -> Self {
        Self::RepositoryNotFound {
            repository: repository.into(),
            message: None,
        }
    }

    pub fn repository_disabled(repository: impl Into<String>) -> Self {
        Self::RepositoryDisabled {
            repository: repository.into(),
            message: None,
        }
    }

    pub fn repository_access(user_id: i64, repository: impl Into<String>) -> Self {
        Self::RepositoryAccess {
            user_id: Some(user_id),
            repository: Some(repository.into()),
            message: None,
        }
    }

    pub fn release_not_found() -> Self {
        Self::ReleaseNotFound { message: None }
    }

    pub fn no_retry(message: impl Into<String>) -> Self {
        Self::ReleaseNoRetry {
            message: message.into(),
        }
    }

    pub fn unexpected_response(message: impl Into<String>) -> Self {
        Self::UnexpectedProviderResponse {
            message: Some(message.into()),
        }
    }

    pub fn zipball_fetch(message: impl Into<String>) -> Self {
        Self::ReleaseZipballFetch {
            message: Some(message.into()),
        }
    }

    /// Whether a release that failed with this error may be processed again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::ReleaseNoRetry { .. }
                | Self::RepositoryDisabled { .. }
                | Self::InvalidSender { .. }
                | Self::ReleaseAlreadyReceived { .. }
                | Self::InvalidUrl(_)
        )
    }

    /// HTTP status used when the error reaches a handler.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::RepositoryNotFound { .. }
            | Self::ReleaseNotFound { .. }
            | Self::RemoteAccountNotFound { .. }
            | Self::ProviderNotRegistered(_) => StatusCode::NOT_FOUND,
            Self::RepositoryAccess { .. } => StatusCode::FORBIDDEN,
            Self::TokenNotFound { .. } => StatusCode::UNAUTHORIZED,
            Self::RepositoryDisabled { .. } | Self::RemoteAccountDataNotSet { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::InvalidSender { .. } | Self::ReleaseNoRetry { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::ReleaseAlreadyReceived { .. }
            | Self::RepositoryAlreadyExists { .. }
            | Self::InvalidTransition { .. } => StatusCode::CONFLICT,
            Self::UnexpectedProviderResponse { .. }
            | Self::ReleaseZipballFetch { .. }
            | Self::UserInfoNone { .. }
            | Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::Serialization(_) | Self::InvalidUrl(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_messages() {
        assert_eq!(
            VcsError::repository_disabled("org/repo").to_string(),
            "This repository is not enabled for webhooks."
        );
        assert_eq!(
            VcsError::release_not_found().to_string(),
            "Release does not exist."
        );
        let err = VcsError::UserInfoNone { message: None };
        assert_eq!(
            err.to_string(),
            "Provider did not return user profile information."
        );
    }

    #[test]
    fn test_message_override() {
        let err = VcsError::RepositoryNotFound {
            repository: "org/repo".to_string(),
            message: Some("gone".to_string()),
        };
        assert_eq!(err.to_string(), "gone");
    }

    #[test]
    fn test_retryable() {
        assert!(!VcsError::no_retry("community required").is_retryable());
        assert!(!VcsError::repository_disabled("x").is_retryable());
        assert!(VcsError::zipball_fetch("timeout").is_retryable());
        assert!(VcsError::unexpected_response("500").is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            VcsError::repository_access(1, "org/repo").status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            VcsError::repository_not_found("org/repo").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            VcsError::ReleaseAlreadyReceived {
                release: "v1".to_string(),
                message: None
            }
            .status_code(),
            StatusCode::CONFLICT
        );
    }
}
