//! Repository synchronization and release processing.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{VcsError, VcsResult};
use crate::models::{Release, ReleaseStatus, RemoteAccount, Repository};
use crate::provider::{ProviderRegistry, RemoteRepository};
use crate::publisher::{PublishRequest, PublishedRecord, RecordPublisher};
use crate::store::Store;
use crate::webhooks::ReleaseEvent;

/// Coordinates providers, storage and the record publisher.
#[derive(Clone)]
pub struct VcsService {
    store: Arc<dyn Store>,
    providers: ProviderRegistry,
    publisher: Arc<dyn RecordPublisher>,
    callback_url: String,
}

impl VcsService {
    /// `callback_url` is the public base URL of this service; hooks are
    /// pointed at `{callback_url}/webhooks/{provider}`.
    pub fn new(
        store: Arc<dyn Store>,
        providers: ProviderRegistry,
        publisher: Arc<dyn RecordPublisher>,
        callback_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            providers,
            publisher,
            callback_url: callback_url.into().trim_end_matches('/').to_string(),
        }
    }

    #[must_use]
    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn hook_url(&self, provider: &str) -> String {
        format!("{}/webhooks/{provider}", self.callback_url)
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Link a platform user to their provider account.
    pub async fn link_account(
        &self,
        user_id: i64,
        provider_id: &str,
        token: &str,
    ) -> VcsResult<RemoteAccount> {
        let provider = self.providers.get(provider_id)?;
        let Some(user) = provider.fetch_user(token).await? else {
            return Err(VcsError::UserInfoNone { message: None });
        };

        let account = RemoteAccount {
            user_id,
            provider: provider_id.to_string(),
            access_token: token.to_string(),
            extra_data: Some(json!({ "login": user.login, "id": user.id })),
        };
        self.store.put_remote_account(account.clone()).await?;

        info!(
            user_id = user_id,
            provider = %provider_id,
            login = %user.login,
            "Linked remote account"
        );
        Ok(account)
    }

    async fn remote_account(&self, user_id: i64, provider: &str) -> VcsResult<RemoteAccount> {
        self.store
            .get_remote_account(user_id, provider)
            .await?
            .ok_or(VcsError::RemoteAccountNotFound {
                user_id,
                message: None,
            })
    }

    async fn access_token(&self, user_id: i64, provider: &str) -> VcsResult<String> {
        let account = self.remote_account(user_id, provider).await?;
        if account.access_token.is_empty() {
            return Err(VcsError::TokenNotFound {
                user_id,
                message: None,
            });
        }
        Ok(account.access_token)
    }

    /// Time of the user's last repository sync with a provider.
    pub async fn last_sync(
        &self,
        user_id: i64,
        provider: &str,
    ) -> VcsResult<Option<DateTime<Utc>>> {
        let account = self.remote_account(user_id, provider).await?;
        let Some(extra) = account.extra_data else {
            return Err(VcsError::RemoteAccountDataNotSet {
                user_id,
                message: None,
            });
        };
        Ok(extra
            .get("last_sync")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    // =========================================================================
    // Repositories
    // =========================================================================

    /// Refresh the repositories a user can access on a provider.
    ///
    /// Access to local repositories the provider no longer lists is revoked.
    pub async fn sync_repositories(
        &self,
        user_id: i64,
        provider_id: &str,
    ) -> VcsResult<Vec<Repository>> {
        let provider = self.providers.get(provider_id)?;
        let token = self.access_token(user_id, provider_id).await?;

        let remotes = provider.list_repositories(&token).await?;

        let mut synced = Vec::with_capacity(remotes.len());
        for remote in remotes {
            let repo = self.upsert_repository(provider_id, remote).await?;
            self.store.add_user(repo.id, user_id).await?;
            synced.push(repo);
        }

        let kept: HashSet<Uuid> = synced.iter().map(|r| r.id).collect();
        for stale in self.store.repositories_for_user(user_id).await? {
            if stale.provider == provider_id && !kept.contains(&stale.id) {
                debug!(
                    user_id = user_id,
                    repo = %stale.full_name,
                    "Revoking access to repository no longer listed"
                );
                self.store.remove_user(stale.id, user_id).await?;
            }
        }

        let mut account = self.remote_account(user_id, provider_id).await?;
        let mut extra = account.extra_data.take().unwrap_or_else(|| json!({}));
        extra["last_sync"] = Value::String(Utc::now().to_rfc3339());
        account.extra_data = Some(extra);
        self.store.put_remote_account(account).await?;

        info!(
            user_id = user_id,
            provider = %provider_id,
            count = synced.len(),
            "Synchronized repositories"
        );
        Ok(synced)
    }

    async fn upsert_repository(
        &self,
        provider: &str,
        remote: RemoteRepository,
    ) -> VcsResult<Repository> {
        match self
            .store
            .get_repository(provider, &remote.provider_id)
            .await?
        {
            Some(mut repo) => {
                let changed = repo.full_name != remote.full_name
                    || repo.description != remote.description
                    || repo.license_spdx != remote.license_spdx
                    || repo.default_branch != remote.default_branch;
                if !changed {
                    return Ok(repo);
                }
                repo.full_name = remote.full_name;
                repo.description = remote.description;
                repo.license_spdx = remote.license_spdx;
                repo.default_branch = remote.default_branch;
                self.store.update_repository(repo).await
            }
            None => {
                let mut repo = Repository::new(
                    provider,
                    remote.provider_id,
                    remote.full_name,
                    remote.default_branch,
                );
                repo.description = remote.description;
                repo.license_spdx = remote.license_spdx;
                self.store.create_repository(repo).await
            }
        }
    }

    /// Fetch a repository the user has access to.
    pub async fn get_repository(
        &self,
        user_id: i64,
        provider: &str,
        provider_id: &str,
    ) -> VcsResult<Repository> {
        let repo = self
            .store
            .get_repository(provider, provider_id)
            .await?
            .ok_or_else(|| VcsError::repository_not_found(format!("{provider}:{provider_id}")))?;

        if !self.store.user_has_access(repo.id, user_id).await? {
            return Err(VcsError::repository_access(user_id, repo.full_name));
        }
        Ok(repo)
    }

    /// Create the provider webhook for a repository.
    pub async fn enable_repository(
        &self,
        user_id: i64,
        provider_id: &str,
        repo_provider_id: &str,
    ) -> VcsResult<Repository> {
        let mut repo = self
            .get_repository(user_id, provider_id, repo_provider_id)
            .await?;
        if repo.enabled() {
            debug!(repo = %repo.full_name, "Repository already enabled");
            return Ok(repo);
        }

        let provider = self.providers.get(provider_id)?;
        let token = self.access_token(user_id, provider_id).await?;
        let hook_id = provider
            .create_hook(&token, &repo, &self.hook_url(provider_id))
            .await?;

        repo.hook = Some(hook_id);
        repo.enabled_by_user_id = Some(user_id);
        let repo = self.store.update_repository(repo).await?;

        info!(
            user_id = user_id,
            repo = %repo.full_name,
            hook = ?repo.hook,
            "Enabled repository"
        );
        Ok(repo)
    }

    /// Remove the provider webhook for a repository.
    pub async fn disable_repository(
        &self,
        user_id: i64,
        provider_id: &str,
        repo_provider_id: &str,
    ) -> VcsResult<Repository> {
        let mut repo = self
            .get_repository(user_id, provider_id, repo_provider_id)
            .await?;
        let Some(hook_id) = repo.hook.clone() else {
            debug!(repo = %repo.full_name, "Repository already disabled");
            return Ok(repo);
        };

        let provider = self.providers.get(provider_id)?;
        let token = self.access_token(user_id, provider_id).await?;
        provider.delete_hook(&token, &repo, &hook_id).await?;

        repo.hook = None;
        let repo = self.store.update_repository(repo).await?;

        info!(user_id = user_id, repo = %repo.full_name, "Disabled repository");
        Ok(repo)
    }

    /// Set the community the repository's releases are submitted to.
    pub async fn set_community(
        &self,
        user_id: i64,
        provider_id: &str,
        repo_provider_id: &str,
        community_id: Option<Uuid>,
    ) -> VcsResult<Repository> {
        let mut repo = self
            .get_repository(user_id, provider_id, repo_provider_id)
            .await?;
        repo.record_community_id = community_id;
        self.store.update_repository(repo).await
    }

    // =========================================================================
    // Releases
    // =========================================================================

    /// Record a release announced by a webhook.
    pub async fn receive_release(
        &self,
        event: &ReleaseEvent,
        event_id: Option<Uuid>,
    ) -> VcsResult<Release> {
        let repo = self
            .store
            .get_repository(&event.provider, &event.repository_id)
            .await?
            .ok_or_else(|| VcsError::repository_not_found(&event.repository_full_name))?;

        if !repo.enabled() {
            return Err(VcsError::repository_disabled(repo.full_name));
        }
        if repo.enabled_by_user_id.is_none() {
            return Err(VcsError::InvalidSender {
                sender: event.sender_login.clone(),
                message: None,
            });
        }

        let mut release = Release::new(
            repo.id,
            &event.provider,
            event.release_id.clone(),
            &event.tag,
        );
        release.event_id = event_id;
        release.event = Some(event.clone());
        let release = self.store.create_release(release).await?;

        info!(
            release_id = %release.id,
            repo = %repo.full_name,
            tag = %release.tag,
            "Received release"
        );
        Ok(release)
    }

    /// Process a release in the background.
    pub fn spawn_processing(&self, release_id: Uuid) {
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = service.process_release(release_id).await {
                error!(release_id = %release_id, error = %e, "Release processing failed");
            }
        });
    }

    /// Publish a received (or retried) release.
    ///
    /// Publishing failures are stored on the release, which is returned in
    /// the `Failed` state. Errors are returned only when the release cannot
    /// enter processing at all. If the release left `Processing` while it
    /// was being published (it was deleted), the outcome is dropped and the
    /// stored release is returned.
    pub async fn process_release(&self, release_id: Uuid) -> VcsResult<Release> {
        let release = self.get_release(release_id).await?;
        let repo = self
            .store
            .get_repository_by_id(release.repository_id)
            .await?
            .ok_or_else(|| VcsError::repository_not_found(release.repository_id.to_string()))?;

        let mut release = self.transition(release, ReleaseStatus::Processing).await?;
        debug!(release_id = %release.id, tag = %release.tag, "Processing release");

        // A record created by an earlier attempt is reused
        let mut record = release.record_id.map(|record_id| PublishedRecord {
            record_id,
            is_draft: release.record_is_draft.unwrap_or(false),
        });
        let outcome = self.publish(&repo, &release, &mut record).await;

        release.record_id = record.as_ref().map(|r| r.record_id);
        release.record_is_draft = record.as_ref().map(|r| r.is_draft);
        let status = match &outcome {
            Ok(()) => {
                release.errors = None;
                if release.record_is_draft == Some(true) {
                    ReleaseStatus::PublishPending
                } else {
                    ReleaseStatus::Published
                }
            }
            Err(e) => {
                warn!(
                    release_id = %release.id,
                    repo = %repo.full_name,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Release publishing failed"
                );
                release.errors = Some(json!({
                    "message": e.to_string(),
                    "retryable": e.is_retryable(),
                }));
                ReleaseStatus::Failed
            }
        };

        match self.transition(release, status).await {
            Ok(release) => {
                if outcome.is_ok() {
                    info!(
                        release_id = %release.id,
                        record_id = ?release.record_id,
                        status = release.status.title(),
                        "Release processed"
                    );
                }
                Ok(release)
            }
            Err(VcsError::InvalidTransition { from, .. }) => {
                warn!(
                    release_id = %release_id,
                    status = from.title(),
                    "Release changed while processing, discarding result"
                );
                self.get_release(release_id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn publish(
        &self,
        repo: &Repository,
        release: &Release,
        record: &mut Option<PublishedRecord>,
    ) -> VcsResult<()> {
        if let Some(first) = self.store.first_release(repo.id).await? {
            if first.id != release.id && first.status == ReleaseStatus::PublishPending {
                return Err(VcsError::no_retry(format!(
                    "The first release of {} ({}) is awaiting publication; \
                     later releases cannot be published until it completes.",
                    repo.full_name, first.tag
                )));
            }
        }

        let user_id = repo
            .enabled_by_user_id
            .ok_or(VcsError::InvalidSender {
                sender: None,
                message: None,
            })?;
        let provider = self.providers.get(&repo.provider)?;
        let token = self.access_token(user_id, &repo.provider).await?;

        let archive = provider.fetch_archive(&token, repo, &release.tag).await?;
        let archive_sha256 = hex::encode(Sha256::digest(&archive));
        debug!(
            release_id = %release.id,
            size = archive.len(),
            sha256 = %archive_sha256,
            "Fetched release archive"
        );

        let event = release.event.as_ref();
        let request = PublishRequest {
            provider: repo.provider.clone(),
            repository_full_name: repo.full_name.clone(),
            tag: release.tag.clone(),
            name: event.and_then(|e| e.name.clone()),
            body: event.and_then(|e| e.body.clone()),
            license_spdx: repo.license_spdx.clone(),
            community_id: repo.record_community_id,
            archive_name: archive_name(&repo.full_name, &release.tag),
            archive,
            archive_sha256,
        };

        let created = match record.take() {
            Some(existing) => existing,
            None => self.publisher.create_record(&request).await?,
        };
        let created = record.insert(created);
        self.publisher.upload_archive(created, &request).await
    }

    /// Move a release to `to`, provided the stored release is still in the
    /// status this copy was read in.
    async fn transition(&self, mut release: Release, to: ReleaseStatus) -> VcsResult<Release> {
        let from = release.status;
        release.status = to;
        self.store.transition_release(release, from).await
    }

    /// Fetch a release whose repository the user has access to.
    pub async fn release_for_user(&self, user_id: i64, release_id: Uuid) -> VcsResult<Release> {
        let release = self.get_release(release_id).await?;
        if !self
            .store
            .user_has_access(release.repository_id, user_id)
            .await?
        {
            let repository = self
                .store
                .get_repository_by_id(release.repository_id)
                .await?
                .map_or_else(|| release.repository_id.to_string(), |r| r.full_name);
            return Err(VcsError::repository_access(user_id, repository));
        }
        Ok(release)
    }

    /// Process a failed release again, unless its failure was final.
    pub async fn retry_release(&self, release_id: Uuid) -> VcsResult<Release> {
        let release = self.get_release(release_id).await?;
        if release.status != ReleaseStatus::Failed {
            return Err(VcsError::InvalidTransition {
                release_id,
                from: release.status,
                to: ReleaseStatus::Processing,
            });
        }
        if !release.is_retryable() {
            let message = release
                .errors
                .as_ref()
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("The release cannot be retried.")
                .to_string();
            return Err(VcsError::no_retry(message));
        }

        info!(release_id = %release_id, "Retrying release");
        self.process_release(release_id).await
    }

    /// Mark the draft record of a release as published.
    pub async fn record_published(&self, record_id: Uuid) -> VcsResult<Release> {
        let mut release = self
            .store
            .release_for_record(record_id, true)
            .await?
            .ok_or_else(VcsError::release_not_found)?;

        release.record_is_draft = Some(false);
        let release = if release.status == ReleaseStatus::Published {
            self.store.update_release(release).await?
        } else {
            self.transition(release, ReleaseStatus::Published).await?
        };

        info!(
            release_id = %release.id,
            record_id = %record_id,
            "Draft record published"
        );
        Ok(release)
    }

    pub async fn delete_release(&self, release_id: Uuid) -> VcsResult<Release> {
        let release = self.get_release(release_id).await?;
        let release = self.transition(release, ReleaseStatus::Deleted).await?;
        info!(release_id = %release_id, "Deleted release");
        Ok(release)
    }

    pub async fn get_release(&self, release_id: Uuid) -> VcsResult<Release> {
        self.store
            .get_release(release_id)
            .await?
            .ok_or_else(VcsError::release_not_found)
    }

    /// Releases of a repository the user has access to, newest first.
    pub async fn list_releases(
        &self,
        user_id: i64,
        provider_id: &str,
        repo_provider_id: &str,
    ) -> VcsResult<Vec<Release>> {
        let repo = self
            .get_repository(user_id, provider_id, repo_provider_id)
            .await?;
        self.store.releases_for_repository(repo.id).await
    }

    /// Latest published, non-draft release of a repository.
    pub async fn latest_release(
        &self,
        provider_id: &str,
        repo_provider_id: &str,
    ) -> VcsResult<Option<Release>> {
        let repo = self
            .store
            .get_repository(provider_id, repo_provider_id)
            .await?
            .ok_or_else(|| {
                VcsError::repository_not_found(format!("{provider_id}:{repo_provider_id}"))
            })?;
        self.store.latest_release(repo.id).await
    }
}

/// File name of a release archive. Path separators in the repository name
/// or tag are flattened to `-`.
fn archive_name(full_name: &str, tag: &str) -> String {
    format!("{full_name}-{tag}.zip").replace(['/', '\\'], "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Provider, RemoteUser};
    use crate::store::MemoryStore;
    use crate::webhooks::WebhookEvent;
    use async_trait::async_trait;
    use axum::body::Bytes;
    use axum::http::HeaderMap;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Provider double recording hook calls.
    #[derive(Default)]
    struct FakeProvider {
        repos: Mutex<Vec<RemoteRepository>>,
        deleted_hooks: Mutex<Vec<String>>,
        no_user: bool,
        archive_fails: bool,
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn id(&self) -> &'static str {
            "github"
        }

        fn name(&self) -> &'static str {
            "Fake"
        }

        fn verify_webhook(&self, _headers: &HeaderMap, _body: &[u8]) -> bool {
            true
        }

        fn delivery_id(&self, _headers: &HeaderMap) -> Option<String> {
            None
        }

        fn parse_event(&self, _headers: &HeaderMap, _body: &[u8]) -> VcsResult<WebhookEvent> {
            Ok(WebhookEvent::Ping)
        }

        async fn fetch_user(&self, _token: &str) -> VcsResult<Option<RemoteUser>> {
            if self.no_user {
                return Ok(None);
            }
            Ok(Some(RemoteUser {
                id: "7".to_string(),
                login: "octocat".to_string(),
                name: None,
                email: None,
            }))
        }

        async fn list_repositories(&self, _token: &str) -> VcsResult<Vec<RemoteRepository>> {
            Ok(self.repos.lock().unwrap().clone())
        }

        async fn fetch_repository(
            &self,
            _token: &str,
            provider_id: &str,
        ) -> VcsResult<Option<RemoteRepository>> {
            Ok(self
                .repos
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.provider_id == provider_id)
                .cloned())
        }

        async fn create_hook(
            &self,
            _token: &str,
            _repo: &Repository,
            callback_url: &str,
        ) -> VcsResult<String> {
            assert_eq!(callback_url, "https://vcs.example.com/webhooks/github");
            Ok("hook-1".to_string())
        }

        async fn delete_hook(
            &self,
            _token: &str,
            _repo: &Repository,
            hook_id: &str,
        ) -> VcsResult<()> {
            self.deleted_hooks.lock().unwrap().push(hook_id.to_string());
            Ok(())
        }

        async fn fetch_archive(
            &self,
            _token: &str,
            _repo: &Repository,
            _tag: &str,
        ) -> VcsResult<Bytes> {
            if self.archive_fails {
                return Err(VcsError::zipball_fetch("connection reset"));
            }
            Ok(Bytes::from_static(b"archive"))
        }
    }

    /// Publisher double returning a fixed outcome.
    struct FakePublisher {
        draft: bool,
        fail_final: bool,
        /// Uploads that fail with a retryable error before one succeeds.
        failing_uploads: Mutex<usize>,
        /// When set, uploads wait here until released by the test.
        gate: Option<(Arc<Notify>, Arc<Notify>)>,
        calls: Mutex<Vec<PublishRequest>>,
        uploads: Mutex<Vec<Uuid>>,
    }

    impl FakePublisher {
        fn new(draft: bool) -> Self {
            Self {
                draft,
                fail_final: false,
                failing_uploads: Mutex::new(0),
                gate: None,
                calls: Mutex::new(Vec::new()),
                uploads: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RecordPublisher for FakePublisher {
        async fn create_record(&self, request: &PublishRequest) -> VcsResult<PublishedRecord> {
            self.calls.lock().unwrap().push(request.clone());
            if self.fail_final {
                return Err(VcsError::no_retry("community is required"));
            }
            Ok(PublishedRecord {
                record_id: Uuid::new_v4(),
                is_draft: self.draft,
            })
        }

        async fn upload_archive(
            &self,
            record: &PublishedRecord,
            _request: &PublishRequest,
        ) -> VcsResult<()> {
            if let Some((entered, proceed)) = &self.gate {
                entered.notify_one();
                proceed.notified().await;
            }
            self.uploads.lock().unwrap().push(record.record_id);
            let mut failing = self.failing_uploads.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(VcsError::unexpected_response("503 Service Unavailable"));
            }
            Ok(())
        }
    }

    fn remote(id: &str, name: &str) -> RemoteRepository {
        RemoteRepository {
            provider_id: id.to_string(),
            full_name: name.to_string(),
            description: None,
            license_spdx: Some("MIT".to_string()),
            default_branch: "main".to_string(),
        }
    }

    fn service_with(provider: FakeProvider, publisher: Arc<FakePublisher>) -> VcsService {
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(provider));
        VcsService::new(
            Arc::new(MemoryStore::new()),
            providers,
            publisher,
            "https://vcs.example.com/",
        )
    }

    fn release_event(release_id: &str, tag: &str) -> ReleaseEvent {
        ReleaseEvent {
            provider: "github".to_string(),
            repository_id: "42".to_string(),
            repository_full_name: "org/repo".to_string(),
            release_id: Some(release_id.to_string()),
            tag: tag.to_string(),
            name: Some(format!("Release {tag}")),
            body: None,
            sender_id: Some("7".to_string()),
            sender_login: Some("octocat".to_string()),
            archive_url: None,
            prerelease: false,
        }
    }

    /// Link user 1, sync one repository and enable it.
    async fn enabled_service(publisher: Arc<FakePublisher>) -> VcsService {
        let provider = FakeProvider::default();
        provider.repos.lock().unwrap().push(remote("42", "org/repo"));
        let service = service_with(provider, publisher);

        service.link_account(1, "github", "tok").await.unwrap();
        service.sync_repositories(1, "github").await.unwrap();
        service.enable_repository(1, "github", "42").await.unwrap();
        service
    }

    #[tokio::test]
    async fn test_link_account_requires_user_info() {
        let provider = FakeProvider {
            no_user: true,
            ..FakeProvider::default()
        };
        let service = service_with(provider, Arc::new(FakePublisher::new(false)));

        let err = service.link_account(1, "github", "tok").await.unwrap_err();
        assert!(matches!(err, VcsError::UserInfoNone { .. }));

        let err = service.link_account(1, "gitea", "tok").await.unwrap_err();
        assert!(matches!(err, VcsError::ProviderNotRegistered(_)));
    }

    #[tokio::test]
    async fn test_sync_requires_account_and_token() {
        let service = service_with(FakeProvider::default(), Arc::new(FakePublisher::new(false)));

        let err = service.sync_repositories(1, "github").await.unwrap_err();
        assert!(matches!(err, VcsError::RemoteAccountNotFound { .. }));

        service
            .store()
            .put_remote_account(RemoteAccount {
                user_id: 1,
                provider: "github".to_string(),
                access_token: String::new(),
                extra_data: None,
            })
            .await
            .unwrap();

        let err = service.sync_repositories(1, "github").await.unwrap_err();
        assert!(matches!(err, VcsError::TokenNotFound { .. }));

        let err = service.last_sync(1, "github").await.unwrap_err();
        assert!(matches!(err, VcsError::RemoteAccountDataNotSet { .. }));
    }

    #[tokio::test]
    async fn test_sync_upserts_and_revokes() {
        let provider = FakeProvider::default();
        provider.repos.lock().unwrap().push(remote("1", "org/a"));
        provider.repos.lock().unwrap().push(remote("2", "org/b"));
        let provider = Arc::new(provider);

        let mut providers = ProviderRegistry::new();
        providers.register(provider.clone());
        let service = VcsService::new(
            Arc::new(MemoryStore::new()),
            providers,
            Arc::new(FakePublisher::new(false)),
            "https://vcs.example.com",
        );

        service.link_account(1, "github", "tok").await.unwrap();
        let synced = service.sync_repositories(1, "github").await.unwrap();
        assert_eq!(synced.len(), 2);
        assert!(service.last_sync(1, "github").await.unwrap().is_some());

        // Repository b disappears, a is renamed
        {
            let mut repos = provider.repos.lock().unwrap();
            repos.clear();
            repos.push(remote("1", "org/a-renamed"));
        }
        service.sync_repositories(1, "github").await.unwrap();

        let repo = service.get_repository(1, "github", "1").await.unwrap();
        assert_eq!(repo.full_name, "org/a-renamed");
        assert_eq!(repo.license_spdx.as_deref(), Some("MIT"));

        let err = service.get_repository(1, "github", "2").await.unwrap_err();
        assert!(matches!(err, VcsError::RepositoryAccess { .. }));

        let err = service.get_repository(1, "github", "3").await.unwrap_err();
        assert!(matches!(err, VcsError::RepositoryNotFound { .. }));
    }

    #[tokio::test]
    async fn test_enable_and_disable() {
        let provider = Arc::new(FakeProvider::default());
        provider.repos.lock().unwrap().push(remote("42", "org/repo"));
        let mut providers = ProviderRegistry::new();
        providers.register(provider.clone());
        let service = VcsService::new(
            Arc::new(MemoryStore::new()),
            providers,
            Arc::new(FakePublisher::new(false)),
            "https://vcs.example.com",
        );
        service.link_account(1, "github", "tok").await.unwrap();
        service.sync_repositories(1, "github").await.unwrap();

        let repo = service.enable_repository(1, "github", "42").await.unwrap();
        assert!(repo.enabled());
        assert_eq!(repo.enabled_by_user_id, Some(1));

        // Enabling twice keeps the same hook
        let again = service.enable_repository(1, "github", "42").await.unwrap();
        assert_eq!(again.hook.as_deref(), Some("hook-1"));

        let repo = service.disable_repository(1, "github", "42").await.unwrap();
        assert!(!repo.enabled());
        assert_eq!(*provider.deleted_hooks.lock().unwrap(), vec!["hook-1"]);

        // User without access cannot enable
        let err = service.enable_repository(2, "github", "42").await.unwrap_err();
        assert!(matches!(err, VcsError::RepositoryAccess { .. }));
    }

    #[tokio::test]
    async fn test_community_reaches_publisher() {
        let publisher = Arc::new(FakePublisher::new(false));
        let service = enabled_service(publisher.clone()).await;
        let community = Uuid::new_v4();

        let repo = service
            .set_community(1, "github", "42", Some(community))
            .await
            .unwrap();
        assert_eq!(repo.record_community_id, Some(community));

        let release = service
            .receive_release(&release_event("1", "v1"), None)
            .await
            .unwrap();
        service.process_release(release.id).await.unwrap();
        assert_eq!(
            publisher.calls.lock().unwrap()[0].community_id,
            Some(community)
        );
    }

    #[tokio::test]
    async fn test_receive_release_checks() {
        let service = enabled_service(Arc::new(FakePublisher::new(false))).await;

        let mut unknown = release_event("1", "v1");
        unknown.repository_id = "999".to_string();
        let err = service.receive_release(&unknown, None).await.unwrap_err();
        assert!(matches!(err, VcsError::RepositoryNotFound { .. }));

        let event_id = Uuid::new_v4();
        let release = service
            .receive_release(&release_event("1", "v1"), Some(event_id))
            .await
            .unwrap();
        assert_eq!(release.status, ReleaseStatus::Received);
        assert_eq!(release.event_id, Some(event_id));

        let err = service
            .receive_release(&release_event("1", "v1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, VcsError::ReleaseAlreadyReceived { .. }));

        service.disable_repository(1, "github", "42").await.unwrap();
        let err = service
            .receive_release(&release_event("2", "v2"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, VcsError::RepositoryDisabled { .. }));
    }

    #[tokio::test]
    async fn test_process_release_publishes() {
        let publisher = Arc::new(FakePublisher::new(false));
        let service = enabled_service(publisher.clone()).await;

        let release = service
            .receive_release(&release_event("1", "v1.0"), None)
            .await
            .unwrap();
        let release = service.process_release(release.id).await.unwrap();

        assert_eq!(release.status, ReleaseStatus::Published);
        assert_eq!(release.record_is_draft, Some(false));
        assert!(release.record_id.is_some());

        let calls = publisher.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].archive_name, "org-repo-v1.0.zip");
        assert_eq!(calls[0].name.as_deref(), Some("Release v1.0"));
        assert_eq!(calls[0].archive_sha256, hex::encode(Sha256::digest(b"archive")));
        drop(calls);

        let latest = service.latest_release("github", "42").await.unwrap().unwrap();
        assert_eq!(latest.id, release.id);

        // Published releases cannot be processed again
        let err = service.process_release(release.id).await.unwrap_err();
        assert!(matches!(err, VcsError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_draft_first_release_blocks_later_ones() {
        let service = enabled_service(Arc::new(FakePublisher::new(true))).await;

        let first = service
            .receive_release(&release_event("1", "v1"), None)
            .await
            .unwrap();
        let first = service.process_release(first.id).await.unwrap();
        assert_eq!(first.status, ReleaseStatus::PublishPending);
        assert_eq!(first.record_is_draft, Some(true));
        assert!(service.latest_release("github", "42").await.unwrap().is_none());

        let second = service
            .receive_release(&release_event("2", "v2"), None)
            .await
            .unwrap();
        let second = service.process_release(second.id).await.unwrap();
        assert_eq!(second.status, ReleaseStatus::Failed);
        assert!(!second.is_retryable());

        let err = service.retry_release(second.id).await.unwrap_err();
        assert!(matches!(err, VcsError::ReleaseNoRetry { .. }));

        // Review completes
        let record_id = first.record_id.unwrap();
        let published = service.record_published(record_id).await.unwrap();
        assert_eq!(published.status, ReleaseStatus::Published);
        assert_eq!(published.record_is_draft, Some(false));

        let err = service.record_published(record_id).await.unwrap_err();
        assert!(matches!(err, VcsError::ReleaseNotFound { .. }));
    }

    #[tokio::test]
    async fn test_retry_after_transient_failure() {
        let provider = FakeProvider {
            archive_fails: true,
            ..FakeProvider::default()
        };
        provider.repos.lock().unwrap().push(remote("42", "org/repo"));
        let service = service_with(provider, Arc::new(FakePublisher::new(false)));
        service.link_account(1, "github", "tok").await.unwrap();
        service.sync_repositories(1, "github").await.unwrap();
        service.enable_repository(1, "github", "42").await.unwrap();

        let release = service
            .receive_release(&release_event("1", "v1"), None)
            .await
            .unwrap();
        let failed = service.process_release(release.id).await.unwrap();
        assert_eq!(failed.status, ReleaseStatus::Failed);
        assert!(failed.is_retryable());
        assert_eq!(
            failed.errors.as_ref().unwrap()["message"],
            "connection reset"
        );

        // Retry is allowed but fails the same way
        let retried = service.retry_release(release.id).await.unwrap();
        assert_eq!(retried.status, ReleaseStatus::Failed);
    }

    #[tokio::test]
    async fn test_final_publish_failure_and_delete() {
        let publisher = Arc::new(FakePublisher {
            fail_final: true,
            ..FakePublisher::new(false)
        });
        let service = enabled_service(publisher).await;

        let release = service
            .receive_release(&release_event("1", "v1"), None)
            .await
            .unwrap();
        let failed = service.process_release(release.id).await.unwrap();
        assert_eq!(failed.status, ReleaseStatus::Failed);
        assert!(!failed.is_retryable());

        let deleted = service.delete_release(release.id).await.unwrap();
        assert_eq!(deleted.status, ReleaseStatus::Deleted);

        let err = service.delete_release(release.id).await.unwrap_err();
        assert!(matches!(err, VcsError::InvalidTransition { .. }));

        let err = service.get_release(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, VcsError::ReleaseNotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_while_processing_wins() {
        let entered = Arc::new(Notify::new());
        let proceed = Arc::new(Notify::new());
        let publisher = Arc::new(FakePublisher {
            gate: Some((entered.clone(), proceed.clone())),
            ..FakePublisher::new(false)
        });
        let service = enabled_service(publisher).await;

        let release = service
            .receive_release(&release_event("1", "v1"), None)
            .await
            .unwrap();

        let processing = {
            let service = service.clone();
            tokio::spawn(async move { service.process_release(release.id).await })
        };
        entered.notified().await;

        let deleted = service.delete_release(release.id).await.unwrap();
        assert_eq!(deleted.status, ReleaseStatus::Deleted);

        proceed.notify_one();
        let processed = processing.await.unwrap().unwrap();
        assert_eq!(processed.status, ReleaseStatus::Deleted);

        let stored = service.get_release(release.id).await.unwrap();
        assert_eq!(stored.status, ReleaseStatus::Deleted);
        assert!(service.latest_release("github", "42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_reuses_created_record() {
        let publisher = Arc::new(FakePublisher {
            failing_uploads: Mutex::new(1),
            ..FakePublisher::new(false)
        });
        let service = enabled_service(publisher.clone()).await;

        let release = service
            .receive_release(&release_event("1", "v1"), None)
            .await
            .unwrap();
        let failed = service.process_release(release.id).await.unwrap();
        assert_eq!(failed.status, ReleaseStatus::Failed);
        assert!(failed.is_retryable());
        let record_id = failed.record_id.unwrap();

        let published = service.retry_release(release.id).await.unwrap();
        assert_eq!(published.status, ReleaseStatus::Published);
        assert_eq!(published.record_id, Some(record_id));

        assert_eq!(publisher.calls.lock().unwrap().len(), 1);
        assert_eq!(*publisher.uploads.lock().unwrap(), vec![record_id, record_id]);
    }

    #[tokio::test]
    async fn test_archive_name_flattens_tag() {
        let publisher = Arc::new(FakePublisher::new(false));
        let service = enabled_service(publisher.clone()).await;

        let release = service
            .receive_release(&release_event("1", "release/1.0#rc"), None)
            .await
            .unwrap();
        service.process_release(release.id).await.unwrap();

        assert_eq!(
            publisher.calls.lock().unwrap()[0].archive_name,
            "org-repo-release-1.0#rc.zip"
        );
    }

    #[tokio::test]
    async fn test_release_access_is_checked() {
        let service = enabled_service(Arc::new(FakePublisher::new(false))).await;
        let release = service
            .receive_release(&release_event("1", "v1"), None)
            .await
            .unwrap();

        let found = service.release_for_user(1, release.id).await.unwrap();
        assert_eq!(found.id, release.id);

        let err = service.release_for_user(2, release.id).await.unwrap_err();
        assert!(matches!(err, VcsError::RepositoryAccess { .. }));

        let err = service.release_for_user(1, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, VcsError::ReleaseNotFound { .. }));
    }
}
