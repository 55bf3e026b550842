//! GitLab provider.

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::HeaderMap;
use reqwest::header::{HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{check_response, Provider, RemoteRepository, RemoteUser};
use crate::error::{VcsError, VcsResult};
use crate::models::Repository;
use crate::webhooks::{verify_token, PushEvent, ReleaseEvent, WebhookEvent, WebhookHeaders};

const PROVIDER_ID: &str = "gitlab";
const PER_PAGE: usize = 100;

/// GitLab provider (gitlab.com or self-managed).
#[derive(Debug, Clone)]
pub struct GitLabProvider {
    client: reqwest::Client,
    api_url: String,
    webhook_secret: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateHookRequest<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
    push_events: bool,
    releases_events: bool,
    tag_push_events: bool,
    enable_ssl_verification: bool,
}

#[derive(Debug, Deserialize)]
struct Hook {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct User {
    id: u64,
    username: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Project {
    id: u64,
    path_with_namespace: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    default_branch: Option<String>,
}

impl From<Project> for RemoteRepository {
    fn from(project: Project) -> Self {
        Self {
            provider_id: project.id.to_string(),
            full_name: project.path_with_namespace,
            description: project.description.filter(|d| !d.is_empty()),
            license_spdx: None,
            default_branch: project.default_branch.unwrap_or_else(|| "main".to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PayloadProject {
    id: u64,
    path_with_namespace: String,
}

#[derive(Debug, Deserialize)]
struct ReleasePayload {
    action: String,
    id: u64,
    tag: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    project: PayloadProject,
    #[serde(default)]
    assets: Option<Assets>,
}

#[derive(Debug, Deserialize)]
struct Assets {
    #[serde(default)]
    sources: Vec<Source>,
}

#[derive(Debug, Deserialize)]
struct Source {
    format: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    ref_name: String,
    #[serde(default)]
    after: Option<String>,
    project: PayloadProject,
    #[serde(default)]
    user_username: Option<String>,
}

impl GitLabProvider {
    /// Create a new GitLab provider for the API at `api_url` (ending in `/api/v4`).
    pub fn new(api_url: &str, webhook_secret: Option<String>) -> VcsResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("vcs-integration/1.0"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            webhook_secret,
        })
    }

    fn request(
        &self,
        method: reqwest::Method,
        token: &str,
        path: &str,
    ) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.api_url))
            .header(AUTHORIZATION, format!("Bearer {token}"))
    }

    fn headers(headers: &HeaderMap) -> WebhookHeaders {
        WebhookHeaders::from_header_map(
            headers,
            "x-gitlab-event-uuid",
            "x-gitlab-event",
            "x-gitlab-token",
        )
    }

    fn parse_release(body: &[u8]) -> VcsResult<WebhookEvent> {
        let payload: ReleasePayload = serde_json::from_slice(body)?;
        if payload.action != "create" {
            return Ok(WebhookEvent::ignored(format!(
                "release_action_{}",
                payload.action
            )));
        }

        let archive_url = payload
            .assets
            .and_then(|a| a.sources.into_iter().find(|s| s.format == "zip"))
            .map(|s| s.url);

        Ok(WebhookEvent::Release(ReleaseEvent {
            provider: PROVIDER_ID.to_string(),
            repository_id: payload.project.id.to_string(),
            repository_full_name: payload.project.path_with_namespace,
            release_id: Some(payload.id.to_string()),
            tag: payload.tag,
            name: payload.name,
            body: payload.description,
            sender_id: None,
            sender_login: None,
            archive_url,
            prerelease: false,
        }))
    }

    fn parse_push(body: &[u8]) -> VcsResult<WebhookEvent> {
        let payload: PushPayload = serde_json::from_slice(body)?;
        Ok(WebhookEvent::Push(PushEvent {
            provider: PROVIDER_ID.to_string(),
            repository_id: payload.project.id.to_string(),
            repository_full_name: payload.project.path_with_namespace,
            ref_name: payload.ref_name,
            head_commit: payload.after,
            sender_login: payload.user_username,
        }))
    }
}

#[async_trait]
impl Provider for GitLabProvider {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn name(&self) -> &'static str {
        "GitLab"
    }

    fn verify_webhook(&self, headers: &HeaderMap, _body: &[u8]) -> bool {
        let Some(secret) = &self.webhook_secret else {
            debug!("No GitLab webhook secret configured, skipping verification");
            return true;
        };
        let Some(token) = Self::headers(headers).signature else {
            warn!("Missing X-Gitlab-Token header");
            return false;
        };
        verify_token(&token, secret)
    }

    fn delivery_id(&self, headers: &HeaderMap) -> Option<String> {
        Self::headers(headers).delivery_id
    }

    fn parse_event(&self, headers: &HeaderMap, body: &[u8]) -> VcsResult<WebhookEvent> {
        let event_type = Self::headers(headers).event_type.unwrap_or_default();
        match event_type.as_str() {
            "Release Hook" => Self::parse_release(body),
            "Push Hook" => Self::parse_push(body),
            other => Ok(WebhookEvent::ignored(format!(
                "unhandled_event_{}",
                other.to_lowercase().replace(' ', "_")
            ))),
        }
    }

    async fn fetch_user(&self, token: &str) -> VcsResult<Option<RemoteUser>> {
        let response = self
            .request(reqwest::Method::GET, token, "/user")
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let user: Option<User> = check_response(response, "GitLab API error fetching user")
            .await?
            .json()
            .await?;

        Ok(user.map(|u| RemoteUser {
            id: u.id.to_string(),
            login: u.username,
            name: u.name,
            email: u.email,
        }))
    }

    async fn list_repositories(&self, token: &str) -> VcsResult<Vec<RemoteRepository>> {
        let mut repositories = Vec::new();

        for page in 1.. {
            let response = self
                .request(reqwest::Method::GET, token, "/projects")
                .query(&[
                    ("membership", "true".to_string()),
                    ("min_access_level", "40".to_string()),
                    ("per_page", PER_PAGE.to_string()),
                    ("page", page.to_string()),
                ])
                .send()
                .await?;

            let batch: Vec<Project> =
                check_response(response, "GitLab API error listing projects")
                    .await?
                    .json()
                    .await?;

            let done = batch.len() < PER_PAGE;
            repositories.extend(batch.into_iter().map(RemoteRepository::from));
            if done {
                break;
            }
        }

        debug!(count = repositories.len(), "Listed GitLab projects");
        Ok(repositories)
    }

    async fn fetch_repository(
        &self,
        token: &str,
        provider_id: &str,
    ) -> VcsResult<Option<RemoteRepository>> {
        let response = self
            .request(reqwest::Method::GET, token, &format!("/projects/{provider_id}"))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let project: Project = check_response(response, "GitLab API error fetching project")
            .await?
            .json()
            .await?;
        Ok(Some(project.into()))
    }

    async fn create_hook(
        &self,
        token: &str,
        repo: &Repository,
        callback_url: &str,
    ) -> VcsResult<String> {
        let request = CreateHookRequest {
            url: callback_url,
            token: self.webhook_secret.as_deref(),
            push_events: true,
            releases_events: true,
            tag_push_events: false,
            enable_ssl_verification: true,
        };

        let response = self
            .request(
                reqwest::Method::POST,
                token,
                &format!("/projects/{}/hooks", repo.provider_id),
            )
            .json(&request)
            .send()
            .await?;

        let hook: Hook = check_response(response, "GitLab API error creating hook")
            .await?
            .json()
            .await?;

        info!(repo = %repo.full_name, hook_id = hook.id, "Created GitLab project hook");
        Ok(hook.id.to_string())
    }

    async fn delete_hook(&self, token: &str, repo: &Repository, hook_id: &str) -> VcsResult<()> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                token,
                &format!("/projects/{}/hooks/{hook_id}", repo.provider_id),
            )
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            warn!(repo = %repo.full_name, hook_id = %hook_id, "GitLab hook already removed");
            return Ok(());
        }
        check_response(response, "GitLab API error deleting hook").await?;
        info!(repo = %repo.full_name, hook_id = %hook_id, "Deleted GitLab project hook");
        Ok(())
    }

    async fn fetch_archive(&self, token: &str, repo: &Repository, tag: &str) -> VcsResult<Bytes> {
        let path = format!("/projects/{}/repository/archive.zip", repo.provider_id);
        let response = self
            .request(reqwest::Method::GET, token, &path)
            .query(&[("sha", tag)])
            .send()
            .await
            .map_err(|e| VcsError::zipball_fetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(VcsError::zipball_fetch(format!(
                "GitLab returned {} for {path}",
                response.status()
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| VcsError::zipball_fetch(e.to_string()))
    }
}
