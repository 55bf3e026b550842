//! GitHub provider: REST API client and webhook parsing.

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::HeaderMap;
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{check_response, join_url, Provider, RemoteRepository, RemoteUser};
use crate::error::{VcsError, VcsResult};
use crate::models::Repository;
use crate::webhooks::{
    verify_hmac_sha256, PushEvent, ReleaseEvent, WebhookEvent, WebhookHeaders,
};

const PROVIDER_ID: &str = "github";
const PER_PAGE: usize = 100;
const HOOK_EVENTS: [&str; 2] = ["release", "push"];

/// Release actions that produce a release record.
const ACCEPTED_RELEASE_ACTIONS: [&str; 2] = ["published", "released"];

/// GitHub provider.
#[derive(Debug, Clone)]
pub struct GitHubProvider {
    client: reqwest::Client,
    api_url: String,
    webhook_secret: Option<String>,
}

/// GitHub webhook configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HookConfig {
    url: String,
    content_type: String,
    #[serde(default)]
    insecure_ssl: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    secret: Option<String>,
}

/// Request to create a webhook.
#[derive(Debug, Serialize)]
struct CreateHookRequest {
    name: String,
    active: bool,
    events: Vec<String>,
    config: HookConfig,
}

#[derive(Debug, Deserialize)]
struct Hook {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct User {
    id: u64,
    login: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct License {
    #[serde(default)]
    spdx_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Repo {
    id: u64,
    full_name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    default_branch: Option<String>,
    #[serde(default)]
    license: Option<License>,
}

impl From<Repo> for RemoteRepository {
    fn from(repo: Repo) -> Self {
        Self {
            provider_id: repo.id.to_string(),
            full_name: repo.full_name,
            description: repo.description,
            // GitHub reports unrecognized licenses as NOASSERTION
            license_spdx: repo
                .license
                .and_then(|l| l.spdx_id)
                .filter(|id| id != "NOASSERTION"),
            default_branch: repo.default_branch.unwrap_or_else(|| "main".to_string()),
        }
    }
}

/// Release webhook payload (simplified)
#[derive(Debug, Deserialize)]
struct ReleasePayload {
    action: String,
    release: ReleaseBody,
    repository: PayloadRepository,
    #[serde(default)]
    sender: Option<Sender>,
}

#[derive(Debug, Deserialize)]
struct ReleaseBody {
    id: u64,
    tag_name: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    zipball_url: Option<String>,
}

/// Push webhook payload (simplified)
#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    ref_name: String,
    #[serde(default)]
    after: Option<String>,
    repository: PayloadRepository,
    #[serde(default)]
    sender: Option<Sender>,
}

#[derive(Debug, Deserialize)]
struct PayloadRepository {
    id: u64,
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct Sender {
    id: u64,
    login: String,
}

impl GitHubProvider {
    /// Create a new GitHub provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(api_url: &str, webhook_secret: Option<String>) -> VcsResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
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

    fn get(&self, token: &str, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{path}", self.api_url))
            .header(AUTHORIZATION, format!("Bearer {token}"))
    }

    fn headers(headers: &HeaderMap) -> WebhookHeaders {
        WebhookHeaders::from_header_map(
            headers,
            "x-github-delivery",
            "x-github-event",
            "x-hub-signature-256",
        )
    }

    fn parse_release(body: &[u8]) -> VcsResult<WebhookEvent> {
        let payload: ReleasePayload = serde_json::from_slice(body)?;

        if !ACCEPTED_RELEASE_ACTIONS.contains(&payload.action.as_str()) {
            return Ok(WebhookEvent::ignored(format!(
                "release_action_{}",
                payload.action
            )));
        }
        if payload.release.draft {
            return Ok(WebhookEvent::ignored("draft_release"));
        }

        Ok(WebhookEvent::Release(ReleaseEvent {
            provider: PROVIDER_ID.to_string(),
            repository_id: payload.repository.id.to_string(),
            repository_full_name: payload.repository.full_name,
            release_id: Some(payload.release.id.to_string()),
            tag: payload.release.tag_name,
            name: payload.release.name,
            body: payload.release.body,
            sender_id: payload.sender.as_ref().map(|s| s.id.to_string()),
            sender_login: payload.sender.map(|s| s.login),
            archive_url: payload.release.zipball_url,
            prerelease: payload.release.prerelease,
        }))
    }

    fn parse_push(body: &[u8]) -> VcsResult<WebhookEvent> {
        let payload: PushPayload = serde_json::from_slice(body)?;
        Ok(WebhookEvent::Push(PushEvent {
            provider: PROVIDER_ID.to_string(),
            repository_id: payload.repository.id.to_string(),
            repository_full_name: payload.repository.full_name,
            ref_name: payload.ref_name,
            head_commit: payload.after,
            sender_login: payload.sender.map(|s| s.login),
        }))
    }
}

#[async_trait]
impl Provider for GitHubProvider {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn name(&self) -> &'static str {
        "GitHub"
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> bool {
        let Some(secret) = &self.webhook_secret else {
            debug!("No GitHub webhook secret configured, skipping verification");
            return true;
        };
        let Some(signature) = Self::headers(headers).signature else {
            warn!("Missing X-Hub-Signature-256 header");
            return false;
        };
        verify_hmac_sha256(body, &signature, secret)
    }

    fn delivery_id(&self, headers: &HeaderMap) -> Option<String> {
        Self::headers(headers).delivery_id
    }

    fn parse_event(&self, headers: &HeaderMap, body: &[u8]) -> VcsResult<WebhookEvent> {
        let event_type = Self::headers(headers).event_type.unwrap_or_default();
        match event_type.as_str() {
            "ping" => Ok(WebhookEvent::Ping),
            "release" => Self::parse_release(body),
            "push" => Self::parse_push(body),
            other => Ok(WebhookEvent::ignored(format!("unhandled_event_{other}"))),
        }
    }

    async fn fetch_user(&self, token: &str) -> VcsResult<Option<RemoteUser>> {
        let response = self.get(token, "/user").send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let user: Option<User> = check_response(response, "GitHub API error fetching user")
            .await?
            .json()
            .await?;

        Ok(user.map(|u| RemoteUser {
            id: u.id.to_string(),
            login: u.login,
            name: u.name,
            email: u.email,
        }))
    }

    async fn list_repositories(&self, token: &str) -> VcsResult<Vec<RemoteRepository>> {
        let mut repositories = Vec::new();

        for page in 1.. {
            let response = self
                .get(token, "/user/repos")
                .query(&[
                    ("per_page", PER_PAGE.to_string()),
                    ("page", page.to_string()),
                    ("affiliation", "owner,collaborator,organization_member".to_string()),
                ])
                .send()
                .await?;

            let batch: Vec<Repo> = check_response(response, "GitHub API error listing repositories")
                .await?
                .json()
                .await?;

            let done = batch.len() < PER_PAGE;
            repositories.extend(batch.into_iter().map(RemoteRepository::from));
            if done {
                break;
            }
        }

        debug!(count = repositories.len(), "Listed GitHub repositories");
        Ok(repositories)
    }

    async fn fetch_repository(
        &self,
        token: &str,
        provider_id: &str,
    ) -> VcsResult<Option<RemoteRepository>> {
        let response = self
            .get(token, &format!("/repositories/{provider_id}"))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let repo: Repo = check_response(response, "GitHub API error fetching repository")
            .await?
            .json()
            .await?;
        Ok(Some(repo.into()))
    }

    async fn create_hook(
        &self,
        token: &str,
        repo: &Repository,
        callback_url: &str,
    ) -> VcsResult<String> {
        let url = format!("{}/repos/{}/hooks", self.api_url, repo.full_name);

        let request = CreateHookRequest {
            name: "web".to_string(),
            active: true,
            events: HOOK_EVENTS.iter().map(ToString::to_string).collect(),
            config: HookConfig {
                url: callback_url.to_string(),
                content_type: "json".to_string(),
                insecure_ssl: "0".to_string(),
                secret: self.webhook_secret.clone(),
            },
        };

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .json(&request)
            .send()
            .await?;

        let hook: Hook = check_response(response, "GitHub API error creating webhook")
            .await?
            .json()
            .await?;

        info!(
            repo = %repo.full_name,
            hook_id = hook.id,
            "Created GitHub webhook"
        );
        Ok(hook.id.to_string())
    }

    async fn delete_hook(&self, token: &str, repo: &Repository, hook_id: &str) -> VcsResult<()> {
        let url = format!("{}/repos/{}/hooks/{hook_id}", self.api_url, repo.full_name);

        let response = self
            .client
            .delete(&url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            warn!(
                repo = %repo.full_name,
                hook_id = %hook_id,
                "GitHub webhook already removed"
            );
            return Ok(());
        }
        check_response(response, "GitHub API error deleting webhook").await?;

        info!(repo = %repo.full_name, hook_id = %hook_id, "Deleted GitHub webhook");
        Ok(())
    }

    async fn fetch_archive(&self, token: &str, repo: &Repository, tag: &str) -> VcsResult<Bytes> {
        let segments = ["repos"]
            .into_iter()
            .chain(repo.full_name.split('/'))
            .chain(["zipball", tag]);
        let url = join_url(&self.api_url, segments)?;
        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .send()
            .await
            .map_err(|e| VcsError::zipball_fetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(VcsError::zipball_fetch(format!(
                "GitHub returned {} for {} at {tag}",
                response.status(),
                repo.full_name
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| VcsError::zipball_fetch(e.to_string()))
    }
}
