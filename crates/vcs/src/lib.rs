//! VCS release integration for the research data platform.
//!
//! This crate provides:
//! - Provider clients for GitHub and GitLab (repositories, hooks, archives)
//! - Webhook signature verification and event normalization
//! - Repository and release bookkeeping behind a [`Store`] trait
//! - Release processing into records through a [`RecordPublisher`]
//! - HTTP server for webhooks and repository management (standalone service)

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)] // Most operations hit storage or a provider API

pub mod config;
pub mod error;
pub mod models;
pub mod provider;
pub mod publisher;
pub mod server;
pub mod service;
pub mod store;
pub mod webhooks;

pub use config::Config;
pub use error::{VcsError, VcsResult};
pub use models::{Release, ReleaseStatus, RemoteAccount, Repository, RepositoryUser};
pub use provider::{GitHubProvider, GitLabProvider, Provider, ProviderRegistry};
pub use publisher::{HttpRecordPublisher, PublishRequest, PublishedRecord, RecordPublisher};
pub use service::VcsService;
pub use store::{MemoryStore, Store};
pub use webhooks::{verify_hmac_sha256, ReleaseEvent, WebhookEvent};
