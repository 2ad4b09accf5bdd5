use crate::{
    config::DestinationEndpoint,
    http::{build_client, join_url},
    models::{ArtifactContent, PropertySet, TransferUnit},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::{
    Body, Client, RequestBuilder, StatusCode,
    header::{CONTENT_LENGTH, HeaderMap, HeaderName, HeaderValue},
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use url::form_urlencoded;

pub const HEADER_UID: &str = "x-bkrepo-uid";
pub const HEADER_OVERWRITE: &str = "x-bkrepo-overwrite";
pub const HEADER_META_PREFIX: &str = "x-bkrepo-meta-";

/// Envelope code for a successful call.
const CODE_OK: i64 = 0;
/// Envelope code returned when creating a project that already exists.
pub const CODE_PROJECT_EXISTED: i64 = 251005;
/// Envelope code returned when creating a repository that already exists.
pub const CODE_REPOSITORY_EXISTED: i64 = 251007;

#[derive(Debug, Error)]
pub enum ExistenceCheckError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid node url: {0}")]
    Url(#[from] url::ParseError),
    #[error("destination returned non-success status {0}")]
    Status(StatusCode),
    #[error("destination returned error code {code}: {message}")]
    Code { code: i64, message: String },
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid upload url: {0}")]
    Url(#[from] url::ParseError),
    #[error("property {0:?} cannot be sent as a header")]
    InvalidProperty(String),
    #[error("property {0:?} collides with another key once sent as a header")]
    DuplicateProperty(String),
    #[error("invalid actor identity {0:?}")]
    InvalidActor(String),
    #[error("upload rejected with status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid bootstrap url: {0}")]
    Url(#[from] url::ParseError),
    #[error("creating {kind} {name} failed with status {status}: {body}")]
    Rejected {
        kind: &'static str,
        name: String,
        status: StatusCode,
        body: String,
    },
}

/// Node metadata reported by the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DestinationNode {
    pub size: u64,
    #[serde(default)]
    pub folder: bool,
}

#[async_trait::async_trait]
pub trait DestinationStore: Send + Sync {
    /// Looks up the node at `destination_path`. `Ok(None)` means the
    /// destination has nothing there.
    async fn probe(&self, destination_path: &str)
    -> Result<Option<DestinationNode>, ExistenceCheckError>;

    async fn upload(
        &self,
        unit: &TransferUnit,
        content: ArtifactContent,
        properties: &PropertySet,
    ) -> Result<(), UploadError>;

    /// True only when the destination holds a file of exactly the source
    /// size. An inconclusive probe counts as absent.
    async fn exists(&self, unit: &TransferUnit) -> bool {
        match self.probe(&unit.destination_path).await {
            Ok(Some(node)) => !node.folder && node.size == unit.record.size,
            Ok(None) => false,
            Err(error) => {
                debug!(path = %unit.destination_path, error = %error, "existence check inconclusive");
                false
            }
        }
    }
}

/// Idempotent creation of the destination project and repository.
#[async_trait::async_trait]
pub trait NamespaceBootstrap: Send + Sync {
    async fn ensure_namespace(&self) -> Result<(), BootstrapError>;
}

/// Client for a bkrepo-style destination service.
#[derive(Debug, Clone)]
pub struct BkRepoStore {
    client: Client,
    endpoint: DestinationEndpoint,
    operator: String,
}

impl BkRepoStore {
    /// `operator` is the actor for administrative calls and for artifacts
    /// whose owner is unknown.
    pub fn new(
        endpoint: DestinationEndpoint,
        operator: String,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(request_timeout)?,
            endpoint,
            operator,
        })
    }

    fn authorized(&self, request: RequestBuilder, actor: &str) -> RequestBuilder {
        let credentials = format!("{}:{}", self.endpoint.access_key, self.endpoint.secret_key);
        request
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Platform {}", STANDARD.encode(credentials)),
            )
            .header(HEADER_UID, actor)
    }

    fn actor_for<'a>(&'a self, unit: &'a TransferUnit) -> &'a str {
        if unit.record.created_by.is_empty() {
            &self.operator
        } else {
            &unit.record.created_by
        }
    }

    async fn create(
        &self,
        kind: &'static str,
        name: &str,
        segments: [&str; 3],
        payload: serde_json::Value,
        existed_code: i64,
    ) -> Result<(), BootstrapError> {
        let url = join_url(&self.endpoint.base_url, segments)?;
        let response = self
            .authorized(self.client.post(url), &self.operator)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let code = parse_envelope::<serde_json::Value>(&body).map(|envelope| envelope.code);

        match code {
            Some(CODE_OK) if status.is_success() => {
                info!(kind, name, "created");
                Ok(())
            }
            Some(code) if code == existed_code => {
                info!(kind, name, "already exists");
                Ok(())
            }
            _ => Err(BootstrapError::Rejected {
                kind,
                name: name.to_owned(),
                status,
                body,
            }),
        }
    }
}

#[async_trait::async_trait]
impl DestinationStore for BkRepoStore {
    async fn probe(
        &self,
        destination_path: &str,
    ) -> Result<Option<DestinationNode>, ExistenceCheckError> {
        let url = join_url(
            &self.endpoint.base_url,
            [
                "repository/api/node/detail",
                self.endpoint.project.as_str(),
                self.endpoint.repo.as_str(),
                destination_path,
            ],
        )?;
        let response = self
            .authorized(self.client.get(url), &self.operator)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ExistenceCheckError::Status(status));
        }

        let envelope = response.json::<Envelope<DestinationNode>>().await?;
        if envelope.code != CODE_OK {
            return Err(ExistenceCheckError::Code {
                code: envelope.code,
                message: envelope.message.unwrap_or_default(),
            });
        }
        Ok(envelope.data)
    }

    async fn upload(
        &self,
        unit: &TransferUnit,
        content: ArtifactContent,
        properties: &PropertySet,
    ) -> Result<(), UploadError> {
        let url = join_url(
            &self.endpoint.base_url,
            [
                "generic",
                self.endpoint.project.as_str(),
                self.endpoint.repo.as_str(),
                unit.destination_path.as_str(),
            ],
        )?;
        let actor = self.actor_for(unit);
        let headers = upload_headers(content.size(), properties)?;
        HeaderValue::from_str(actor).map_err(|_| UploadError::InvalidActor(actor.to_owned()))?;

        let response = self
            .authorized(self.client.put(url), actor)
            .headers(headers)
            .body(Body::wrap_stream(content.into_checked_stream()))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let rejected_by_code = parse_envelope::<serde_json::Value>(&body)
            .is_some_and(|envelope| envelope.code != CODE_OK);

        if !status.is_success() || rejected_by_code {
            return Err(UploadError::Status { status, body });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl NamespaceBootstrap for BkRepoStore {
    async fn ensure_namespace(&self) -> Result<(), BootstrapError> {
        let project = &self.endpoint.project;
        let repo = &self.endpoint.repo;

        self.create(
            "project",
            project,
            ["repository/api", "project", "create"],
            json!({
                "name": project,
                "displayName": project,
                "description": "created by repomigrate",
            }),
            CODE_PROJECT_EXISTED,
        )
        .await?;

        self.create(
            "repository",
            &format!("{project}/{repo}"),
            ["repository/api", "repo", "create"],
            json!({
                "projectId": project,
                "name": repo,
                "type": "GENERIC",
                "category": "LOCAL",
                "public": false,
                "configuration": { "type": "local" },
                "description": "created by repomigrate",
            }),
            CODE_REPOSITORY_EXISTED,
        )
        .await
    }
}

/// Headers for an upload: declared size, overwrite directive and one header
/// per property. Values are URL-encoded; the destination decodes them.
pub(crate) fn upload_headers(
    size: u64,
    properties: &PropertySet,
) -> Result<HeaderMap, UploadError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(size));
    headers.insert(
        HeaderName::from_static(HEADER_OVERWRITE),
        HeaderValue::from_static("true"),
    );

    for (key, value) in properties {
        let name = HeaderName::from_bytes(format!("{HEADER_META_PREFIX}{key}").as_bytes())
            .map_err(|_| UploadError::InvalidProperty(key.clone()))?;
        // Header names are case-insensitive: `Build` and `build` share a slot.
        if headers.contains_key(&name) {
            return Err(UploadError::DuplicateProperty(key.clone()));
        }
        let encoded: String = form_urlencoded::byte_serialize(value.as_bytes()).collect();
        let value =
            HeaderValue::from_str(&encoded).map_err(|_| UploadError::InvalidProperty(key.clone()))?;
        headers.insert(name, value);
    }

    Ok(headers)
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    message: Option<String>,
    data: Option<T>,
}

fn parse_envelope<T: DeserializeOwned>(body: &str) -> Option<Envelope<T>> {
    serde_json::from_str(body).ok()
}
