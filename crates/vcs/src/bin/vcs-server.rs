//! VCS service binary.
//!
//! Standalone HTTP service receiving GitHub and GitLab webhooks and
//! publishing releases as records.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vcs::{
    config::Config, server, GitHubProvider, GitLabProvider, HttpRecordPublisher, MemoryStore,
    ProviderRegistry, VcsService,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("vcs=info".parse()?))
        .init();

    info!("Starting VCS service...");

    let config = Config::default();

    if !config.enabled {
        error!("VCS_ENABLED is set to false. Service will not process webhooks.");
    }

    let mut providers = ProviderRegistry::new();
    if let Some(github) = &config.github {
        let provider = GitHubProvider::new(&github.api_url, github.webhook_secret.clone())
            .context("Failed to create GitHub provider")?;
        if github.webhook_secret.is_none() {
            info!("No GITHUB_WEBHOOK_SECRET configured - GitHub deliveries will not be verified");
        }
        providers.register(Arc::new(provider));
        info!(api_url = %github.api_url, "GitHub provider configured");
    }
    if let Some(gitlab) = &config.gitlab {
        let provider = GitLabProvider::new(&gitlab.api_url, gitlab.webhook_secret.clone())
            .context("Failed to create GitLab provider")?;
        if gitlab.webhook_secret.is_none() {
            info!("No GITLAB_WEBHOOK_SECRET configured - GitLab deliveries will not be verified");
        }
        providers.register(Arc::new(provider));
        info!(api_url = %gitlab.api_url, "GitLab provider configured");
    }
    if providers.is_empty() {
        error!("No VCS providers enabled");
    }

    let publisher = HttpRecordPublisher::new(
        &config.records_api_url,
        config.records_api_token.clone(),
    )
    .context("Failed to create records API client")?;
    info!(records_api_url = %config.records_api_url, "Records API configured");

    let service = VcsService::new(
        Arc::new(MemoryStore::new()),
        providers,
        Arc::new(publisher),
        config.webhook_callback_url.clone(),
    );

    // Build application state
    let state = server::AppState {
        config: config.clone(),
        service,
    };

    // Build router
    let app = server::build_router(state);

    // Bind and serve
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(port = config.port, "VCS service listening");

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
