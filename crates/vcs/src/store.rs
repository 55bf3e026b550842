//! Persistence for repositories, releases and linked accounts.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{VcsError, VcsResult};
use crate::models::{Release, ReleaseStatus, RemoteAccount, Repository, RepositoryUser};

/// Storage backend used by the service.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a repository. Fails if `(provider, provider_id)` is taken.
    async fn create_repository(&self, repo: Repository) -> VcsResult<Repository>;

    async fn get_repository(&self, provider: &str, provider_id: &str)
        -> VcsResult<Option<Repository>>;

    async fn get_repository_by_id(&self, id: Uuid) -> VcsResult<Option<Repository>>;

    /// Replace a stored repository, bumping its `updated` timestamp.
    async fn update_repository(&self, repo: Repository) -> VcsResult<Repository>;

    /// Grant a user access to a repository. Granting twice is a no-op.
    async fn add_user(&self, repository_id: Uuid, user_id: i64) -> VcsResult<()>;

    async fn remove_user(&self, repository_id: Uuid, user_id: i64) -> VcsResult<()>;

    async fn list_users(&self, repository_id: Uuid) -> VcsResult<Vec<RepositoryUser>>;

    async fn user_has_access(&self, repository_id: Uuid, user_id: i64) -> VcsResult<bool>;

    async fn repositories_for_user(&self, user_id: i64) -> VcsResult<Vec<Repository>>;

    /// Insert a release. Fails if `(provider_id, provider)` was already received.
    async fn create_release(&self, release: Release) -> VcsResult<Release>;

    async fn get_release(&self, id: Uuid) -> VcsResult<Option<Release>>;

    async fn get_release_by_provider_id(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> VcsResult<Option<Release>>;

    async fn update_release(&self, release: Release) -> VcsResult<Release>;

    /// Store `release` only if the stored copy is still in status `from`
    /// and the lifecycle allows `from -> release.status`. Fails with
    /// `InvalidTransition` against the stored status otherwise.
    async fn transition_release(&self, release: Release, from: ReleaseStatus)
        -> VcsResult<Release>;

    /// Releases of a repository, newest first.
    async fn releases_for_repository(&self, repository_id: Uuid) -> VcsResult<Vec<Release>>;

    /// Newest published release whose record is not a draft.
    async fn latest_release(&self, repository_id: Uuid) -> VcsResult<Option<Release>>;

    /// Oldest release of a repository that was not deleted.
    async fn first_release(&self, repository_id: Uuid) -> VcsResult<Option<Release>>;

    /// Release linked to a record. With `only_draft`, only a release whose
    /// record was a draft when linked.
    async fn release_for_record(
        &self,
        record_id: Uuid,
        only_draft: bool,
    ) -> VcsResult<Option<Release>>;

    async fn put_remote_account(&self, account: RemoteAccount) -> VcsResult<()>;

    async fn get_remote_account(
        &self,
        user_id: i64,
        provider: &str,
    ) -> VcsResult<Option<RemoteAccount>>;
}

#[derive(Default)]
struct Tables {
    repositories: HashMap<Uuid, Repository>,
    repository_users: HashMap<(Uuid, i64), RepositoryUser>,
    releases: HashMap<Uuid, Release>,
    accounts: HashMap<(i64, String), RemoteAccount>,
}

/// In-memory store guarded by a single lock.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(mut releases: Vec<Release>) -> Vec<Release> {
    releases.sort_by(|a, b| b.created.cmp(&a.created));
    releases
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_repository(&self, repo: Repository) -> VcsResult<Repository> {
        let mut tables = self.tables.write().await;
        if tables
            .repositories
            .values()
            .any(|r| r.provider == repo.provider && r.provider_id == repo.provider_id)
        {
            return Err(VcsError::RepositoryAlreadyExists {
                provider: repo.provider,
                provider_id: repo.provider_id,
            });
        }
        tables.repositories.insert(repo.id, repo.clone());
        Ok(repo)
    }

    async fn get_repository(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> VcsResult<Option<Repository>> {
        let tables = self.tables.read().await;
        Ok(tables
            .repositories
            .values()
            .find(|r| r.provider == provider && r.provider_id == provider_id)
            .cloned())
    }

    async fn get_repository_by_id(&self, id: Uuid) -> VcsResult<Option<Repository>> {
        Ok(self.tables.read().await.repositories.get(&id).cloned())
    }

    async fn update_repository(&self, mut repo: Repository) -> VcsResult<Repository> {
        let mut tables = self.tables.write().await;
        let Some(slot) = tables.repositories.get_mut(&repo.id) else {
            return Err(VcsError::repository_not_found(repo.full_name));
        };
        repo.updated = Utc::now();
        *slot = repo.clone();
        Ok(repo)
    }

    async fn add_user(&self, repository_id: Uuid, user_id: i64) -> VcsResult<()> {
        let now = Utc::now();
        let mut tables = self.tables.write().await;
        tables
            .repository_users
            .entry((repository_id, user_id))
            .and_modify(|link| link.updated = now)
            .or_insert(RepositoryUser {
                repository_id,
                user_id,
                created: now,
                updated: now,
            });
        Ok(())
    }

    async fn remove_user(&self, repository_id: Uuid, user_id: i64) -> VcsResult<()> {
        self.tables
            .write()
            .await
            .repository_users
            .remove(&(repository_id, user_id));
        Ok(())
    }

    async fn list_users(&self, repository_id: Uuid) -> VcsResult<Vec<RepositoryUser>> {
        let tables = self.tables.read().await;
        let mut users: Vec<_> = tables
            .repository_users
            .values()
            .filter(|link| link.repository_id == repository_id)
            .cloned()
            .collect();
        users.sort_by_key(|link| link.user_id);
        Ok(users)
    }

    async fn user_has_access(&self, repository_id: Uuid, user_id: i64) -> VcsResult<bool> {
        Ok(self
            .tables
            .read()
            .await
            .repository_users
            .contains_key(&(repository_id, user_id)))
    }

    async fn repositories_for_user(&self, user_id: i64) -> VcsResult<Vec<Repository>> {
        let tables = self.tables.read().await;
        let mut repos: Vec<_> = tables
            .repository_users
            .keys()
            .filter(|(_, uid)| *uid == user_id)
            .filter_map(|(repo_id, _)| tables.repositories.get(repo_id).cloned())
            .collect();
        repos.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        Ok(repos)
    }

    async fn create_release(&self, release: Release) -> VcsResult<Release> {
        let mut tables = self.tables.write().await;
        if let Some(provider_id) = &release.provider_id {
            let duplicate = tables.releases.values().any(|r| {
                r.provider == release.provider && r.provider_id.as_ref() == Some(provider_id)
            });
            if duplicate {
                return Err(VcsError::ReleaseAlreadyReceived {
                    release: release.tag,
                    message: None,
                });
            }
        }
        tables.releases.insert(release.id, release.clone());
        Ok(release)
    }

    async fn get_release(&self, id: Uuid) -> VcsResult<Option<Release>> {
        Ok(self.tables.read().await.releases.get(&id).cloned())
    }

    async fn get_release_by_provider_id(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> VcsResult<Option<Release>> {
        let tables = self.tables.read().await;
        Ok(tables
            .releases
            .values()
            .find(|r| r.provider == provider && r.provider_id.as_deref() == Some(provider_id))
            .cloned())
    }

    async fn update_release(&self, mut release: Release) -> VcsResult<Release> {
        let mut tables = self.tables.write().await;
        let Some(slot) = tables.releases.get_mut(&release.id) else {
            return Err(VcsError::release_not_found());
        };
        release.updated = Utc::now();
        *slot = release.clone();
        Ok(release)
    }

    async fn transition_release(
        &self,
        mut release: Release,
        from: ReleaseStatus,
    ) -> VcsResult<Release> {
        let mut tables = self.tables.write().await;
        let Some(slot) = tables.releases.get_mut(&release.id) else {
            return Err(VcsError::release_not_found());
        };
        if slot.status != from || !from.can_transition_to(release.status) {
            return Err(VcsError::InvalidTransition {
                release_id: release.id,
                from: slot.status,
                to: release.status,
            });
        }
        release.updated = Utc::now();
        *slot = release.clone();
        Ok(release)
    }

    async fn releases_for_repository(&self, repository_id: Uuid) -> VcsResult<Vec<Release>> {
        let tables = self.tables.read().await;
        Ok(newest_first(
            tables
                .releases
                .values()
                .filter(|r| r.repository_id == repository_id)
                .cloned()
                .collect(),
        ))
    }

    async fn latest_release(&self, repository_id: Uuid) -> VcsResult<Option<Release>> {
        let releases = self.releases_for_repository(repository_id).await?;
        Ok(releases.into_iter().find(|r| {
            r.status == ReleaseStatus::Published && r.record_is_draft != Some(true)
        }))
    }

    async fn first_release(&self, repository_id: Uuid) -> VcsResult<Option<Release>> {
        let releases = self.releases_for_repository(repository_id).await?;
        Ok(releases
            .into_iter()
            .rev()
            .find(|r| r.status != ReleaseStatus::Deleted))
    }

    async fn release_for_record(
        &self,
        record_id: Uuid,
        only_draft: bool,
    ) -> VcsResult<Option<Release>> {
        let tables = self.tables.read().await;
        Ok(tables
            .releases
            .values()
            .find(|r| {
                r.record_id == Some(record_id) && (!only_draft || r.record_is_draft == Some(true))
            })
            .cloned())
    }

    async fn put_remote_account(&self, account: RemoteAccount) -> VcsResult<()> {
        let key = (account.user_id, account.provider.clone());
        self.tables.write().await.accounts.insert(key, account);
        Ok(())
    }

    async fn get_remote_account(
        &self,
        user_id: i64,
        provider: &str,
    ) -> VcsResult<Option<RemoteAccount>> {
        let tables = self.tables.read().await;
        Ok(tables.accounts.get(&(user_id, provider.to_string())).cloned())
    }
}
