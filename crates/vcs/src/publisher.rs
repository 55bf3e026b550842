//! Publishing release archives as records on the host platform.

use async_trait::async_trait;
use axum::body::Bytes;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{VcsError, VcsResult};
use crate::provider::join_url;

/// Everything needed to create a record for a release.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub provider: String,
    pub repository_full_name: String,
    pub tag: String,
    pub name: Option<String>,
    pub body: Option<String>,
    pub license_spdx: Option<String>,
    pub community_id: Option<Uuid>,
    pub archive: Bytes,
    pub archive_name: String,
    /// Hex SHA-256 of `archive`.
    pub archive_sha256: String,
}

/// Record created for a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedRecord {
    #[serde(rename = "id")]
    pub record_id: Uuid,
    /// The record awaits an external action before it is public.
    #[serde(default)]
    pub is_draft: bool,
}

/// Sink that turns releases into records.
///
/// Publishing is split in two steps so a failed upload can be retried
/// against the record that was already created.
#[async_trait]
pub trait RecordPublisher: Send + Sync {
    /// Create the record for a release, without its files.
    async fn create_record(&self, request: &PublishRequest) -> VcsResult<PublishedRecord>;

    /// Attach the release archive to `record`.
    async fn upload_archive(
        &self,
        record: &PublishedRecord,
        request: &PublishRequest,
    ) -> VcsResult<()>;
}

#[derive(Debug, Serialize)]
struct RecordMetadata<'a> {
    title: String,
    description: Option<&'a str>,
    version: &'a str,
    license: Option<&'a str>,
    community_id: Option<Uuid>,
    related_identifier: String,
    files: [FileEntry<'a>; 1],
}

#[derive(Debug, Serialize)]
struct FileEntry<'a> {
    key: &'a str,
    size: usize,
    checksum: String,
}

/// Publisher backed by the platform's records REST API.
#[derive(Debug, Clone)]
pub struct HttpRecordPublisher {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRecordPublisher {
    pub fn new(base_url: &str, token: Option<String>) -> VcsResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("vcs-integration/1.0"));
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.header(AUTHORIZATION, format!("Bearer {token}")),
            None => builder,
        }
    }
}

/// Client errors other than rate limiting will fail the same way again.
async fn classify_failure(response: reqwest::Response, action: &str) -> VcsError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = format!("{action}: {status} - {body}");
    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        VcsError::no_retry(message)
    } else {
        VcsError::unexpected_response(message)
    }
}

#[async_trait]
impl RecordPublisher for HttpRecordPublisher {
    async fn create_record(&self, request: &PublishRequest) -> VcsResult<PublishedRecord> {
        let metadata = RecordMetadata {
            title: format!(
                "{}: {}",
                request.repository_full_name,
                request.name.as_deref().unwrap_or(&request.tag)
            ),
            description: request.body.as_deref(),
            version: &request.tag,
            license: request.license_spdx.as_deref(),
            community_id: request.community_id,
            related_identifier: format!(
                "{}:{}@{}",
                request.provider, request.repository_full_name, request.tag
            ),
            files: [FileEntry {
                key: &request.archive_name,
                size: request.archive.len(),
                checksum: format!("sha256:{}", request.archive_sha256),
            }],
        };

        let url = join_url(&self.base_url, ["records"])?;
        let response = self
            .authorize(self.client.post(url))
            .json(&metadata)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(classify_failure(response, "Records API error creating record").await);
        }
        let record: PublishedRecord = response.json().await?;
        debug!(
            record_id = %record.record_id,
            is_draft = record.is_draft,
            repo = %request.repository_full_name,
            "Created record"
        );
        Ok(record)
    }

    async fn upload_archive(
        &self,
        record: &PublishedRecord,
        request: &PublishRequest,
    ) -> VcsResult<()> {
        let record_id = record.record_id.to_string();
        let url = join_url(
            &self.base_url,
            ["records", record_id.as_str(), "files", request.archive_name.as_str()],
        )?;
        let response = self
            .authorize(self.client.put(url))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(request.archive.clone())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(classify_failure(response, "Records API error uploading archive").await);
        }

        info!(
            record_id = %record.record_id,
            repo = %request.repository_full_name,
            tag = %request.tag,
            size = request.archive.len(),
            "Uploaded release archive"
        );
        Ok(())
    }
}
