//! Repository, release and account records tracked by the service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::webhooks::ReleaseEvent;

/// Lifecycle of a release, persisted as a single character code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReleaseStatus {
    /// Received and pending processing.
    #[serde(rename = "R")]
    Received,
    /// Still being processed.
    #[serde(rename = "P")]
    Processing,
    /// Processed and published.
    #[serde(rename = "D")]
    Published,
    /// Processing failed.
    #[serde(rename = "F")]
    Failed,
    /// Deleted.
    #[serde(rename = "E")]
    Deleted,
    /// Processed and waiting for an external action, usually the review of a
    /// draft record. While the first release of a repository holds this
    /// status, later releases of that repository are refused.
    #[serde(rename = "S")]
    PublishPending,
}

impl ReleaseStatus {
    pub const ALL: [Self; 6] = [
        Self::Received,
        Self::Processing,
        Self::Published,
        Self::Failed,
        Self::Deleted,
        Self::PublishPending,
    ];

    #[must_use]
    pub const fn code(self) -> char {
        match self {
            Self::Received => 'R',
            Self::Processing => 'P',
            Self::Published => 'D',
            Self::Failed => 'F',
            Self::Deleted => 'E',
            Self::PublishPending => 'S',
        }
    }

    #[must_use]
    pub fn from_code(code: char) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::Received => "Received",
            Self::Processing => "Processing",
            Self::Published => "Published",
            Self::Failed => "Failed",
            Self::Deleted => "Deleted",
            Self::PublishPending => "Publish pending",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Received, Self::Processing)
                | (
                    Self::Processing,
                    Self::Published | Self::PublishPending | Self::Failed
                )
                | (Self::PublishPending, Self::Published | Self::Failed)
                | (Self::Failed, Self::Processing)
                | (
                    Self::Received
                        | Self::Processing
                        | Self::Published
                        | Self::Failed
                        | Self::PublishPending,
                    Self::Deleted
                )
        )
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A repository hosted by a VCS provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    /// Internal identifier.
    pub id: Uuid,
    /// Registered provider id (`github`, `gitlab`).
    pub provider: String,
    /// Identifier given by the provider, stringified.
    ///
    /// Unique together with `provider`. `full_name` is not unique across
    /// all providers.
    pub provider_id: String,
    /// `owner/name`.
    pub full_name: String,
    pub description: Option<String>,
    pub license_spdx: Option<String>,
    pub default_branch: String,
    /// Webhook id given by the provider. `None` while disabled.
    pub hook: Option<String>,
    /// User who last enabled the repository.
    pub enabled_by_user_id: Option<i64>,
    /// Community the first release is submitted to. Weak reference.
    pub record_community_id: Option<Uuid>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Repository {
    pub fn new(
        provider: impl Into<String>,
        provider_id: impl Into<String>,
        full_name: impl Into<String>,
        default_branch: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            provider: provider.into(),
            provider_id: provider_id.into(),
            full_name: full_name.into(),
            description: None,
            license_spdx: None,
            default_branch: default_branch.into(),
            hook: None,
            enabled_by_user_id: None,
            record_community_id: None,
            created: now,
            updated: now,
        }
    }

    /// Whether webhooks are enabled for the repository.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.hook.is_some()
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Repository {}:{}>", self.full_name, self.provider_id)
    }
}

/// A release received from a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: Uuid,
    /// Release identifier given by the provider.
    pub provider_id: Option<String>,
    pub provider: String,
    pub tag: String,
    /// Processing errors, `{ "message": ..., "retryable": ... }`.
    pub errors: Option<Value>,
    pub repository_id: Uuid,
    /// Webhook delivery that created the release.
    pub event_id: Option<Uuid>,
    /// Record created for the release. Weak reference.
    pub record_id: Option<Uuid>,
    /// Whether `record_id` pointed at a draft when it was linked.
    pub record_is_draft: Option<bool>,
    pub status: ReleaseStatus,
    /// Normalized webhook event the release was received with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<ReleaseEvent>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Release {
    pub fn new(
        repository_id: Uuid,
        provider: impl Into<String>,
        provider_id: Option<String>,
        tag: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            provider_id,
            provider: provider.into(),
            tag: tag.into(),
            errors: None,
            repository_id,
            event_id: None,
            record_id: None,
            record_is_draft: None,
            status: ReleaseStatus::Received,
            event: None,
            created: now,
            updated: now,
        }
    }

    /// Whether the stored errors allow the release to be processed again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.errors
            .as_ref()
            .and_then(|e| e.get("retryable"))
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Release {}:{} ({})>",
            self.tag,
            self.provider_id.as_deref().unwrap_or("-"),
            self.status.title()
        )
    }
}

/// Access relation between a user and a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryUser {
    pub repository_id: Uuid,
    pub user_id: i64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// A platform user's linked account on a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteAccount {
    pub user_id: i64,
    pub provider: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    /// `{ "login", "id", "last_sync" }` once known.
    pub extra_data: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_roundtrip() {
        for status in ReleaseStatus::ALL {
            assert_eq!(ReleaseStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(ReleaseStatus::from_code('X'), None);
        assert_eq!(
            serde_json::to_string(&ReleaseStatus::PublishPending).unwrap(),
            "\"S\""
        );
    }

    #[test]
    fn test_status_transitions() {
        use ReleaseStatus::*;

        assert!(Received.can_transition_to(Processing));
        assert!(Processing.can_transition_to(PublishPending));
        assert!(PublishPending.can_transition_to(Published));
        assert!(Failed.can_transition_to(Processing));
        assert!(Published.can_transition_to(Deleted));

        assert!(!Received.can_transition_to(Published));
        assert!(!Published.can_transition_to(Processing));
        assert!(!Deleted.can_transition_to(Deleted));
        assert!(!Deleted.can_transition_to(Processing));
    }

    #[test]
    fn test_repository_enabled() {
        let mut repo = Repository::new("github", "42", "org/repo", "main");
        assert!(!repo.enabled());
        repo.hook = Some("1234".to_string());
        assert!(repo.enabled());
        assert_eq!(repo.to_string(), "<Repository org/repo:42>");
    }

    #[test]
    fn test_release_retryable() {
        let mut release = Release::new(Uuid::new_v4(), "github", Some("9".into()), "v1.0");
        assert_eq!(release.status, ReleaseStatus::Received);
        assert!(release.is_retryable());

        release.errors = Some(serde_json::json!({"message": "no", "retryable": false}));
        assert!(!release.is_retryable());
        assert_eq!(release.to_string(), "<Release v1.0:9 (Received)>");
    }
}
