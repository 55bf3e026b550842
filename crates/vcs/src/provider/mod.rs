//! VCS provider integrations.
//!
//! Each provider implements [`Provider`]:
//!
//! - **GitHub** - [`GitHubProvider`]
//! - **GitLab** - [`GitLabProvider`]
//!
//! The service resolves providers by id through a [`ProviderRegistry`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vcs::provider::{GitHubProvider, ProviderRegistry};
//!
//! # fn example() -> vcs::VcsResult<()> {
//! let github = GitHubProvider::new("https://api.github.com", Some("secret".to_string()))?;
//! let mut registry = ProviderRegistry::new();
//! registry.register(Arc::new(github));
//! assert!(registry.get("github").is_ok());
//! # Ok(())
//! # }
//! ```

mod github;
mod gitlab;

pub use github::GitHubProvider;
pub use gitlab::GitLabProvider;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{VcsError, VcsResult};
use crate::models::Repository;
use crate::webhooks::WebhookEvent;

/// Profile of the account behind an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUser {
    pub id: String,
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Repository metadata as reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRepository {
    pub provider_id: String,
    pub full_name: String,
    pub description: Option<String>,
    pub license_spdx: Option<String>,
    pub default_branch: String,
}

/// A VCS host the service can receive releases from.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registered id, used in URLs and stored on repositories.
    fn id(&self) -> &'static str;

    /// Human readable name.
    fn name(&self) -> &'static str;

    /// Check the authenticity of a delivery. Accepts everything when no
    /// secret is configured.
    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> bool;

    /// Delivery identifier, when the provider sends one.
    fn delivery_id(&self, headers: &HeaderMap) -> Option<String>;

    /// Normalize a delivery into a [`WebhookEvent`].
    fn parse_event(&self, headers: &HeaderMap, body: &[u8]) -> VcsResult<WebhookEvent>;

    async fn fetch_user(&self, token: &str) -> VcsResult<Option<RemoteUser>>;

    /// All repositories the token's owner can administer.
    async fn list_repositories(&self, token: &str) -> VcsResult<Vec<RemoteRepository>>;

    async fn fetch_repository(
        &self,
        token: &str,
        provider_id: &str,
    ) -> VcsResult<Option<RemoteRepository>>;

    /// Create a webhook pointing at `callback_url`, returning its id.
    async fn create_hook(
        &self,
        token: &str,
        repo: &Repository,
        callback_url: &str,
    ) -> VcsResult<String>;

    /// Delete a webhook. A hook that no longer exists is not an error.
    async fn delete_hook(&self, token: &str, repo: &Repository, hook_id: &str) -> VcsResult<()>;

    /// Download the zip archive of the tree at `tag`.
    async fn fetch_archive(&self, token: &str, repo: &Repository, tag: &str) -> VcsResult<Bytes>;
}

/// Providers known to the service, keyed by id.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any with the same id.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    /// Look up a provider by id.
    pub fn get(&self, id: &str) -> VcsResult<Arc<dyn Provider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| VcsError::ProviderNotRegistered(id.to_string()))
    }

    /// Registered ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Append `segments` to `base`, percent-encoding each one.
///
/// A segment may contain `/`, `#` or `?` (git tags, file names) and still
/// stays a single path segment.
pub(crate) fn join_url<'a>(
    base: &str,
    segments: impl IntoIterator<Item = &'a str>,
) -> VcsResult<reqwest::Url> {
    let mut url =
        reqwest::Url::parse(base).map_err(|e| VcsError::InvalidUrl(format!("{base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|()| VcsError::InvalidUrl(format!("{base}: cannot be a base")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Turn a non-success provider response into an error.
pub(crate) async fn check_response(
    response: reqwest::Response,
    action: &str,
) -> VcsResult<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(VcsError::unexpected_response(format!(
        "{action}: {status} - {body}"
    )))
}
