use crate::{
    config::SourceEndpoint,
    http::{build_client, join_url},
    models::{ArtifactContent, ArtifactRecord, PropertySet},
    scope::{Scope, ScopeQuery},
};
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::{collections::BTreeMap, io, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

const AQL_INCLUDE: &str = r#".include("size","path","name","created_by")"#;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid search url: {0}")]
    Url(#[from] url::ParseError),
    #[error("search returned non-success status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("all {attempted} discovery queries failed")]
    AllQueriesFailed { attempted: usize },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid artifact url: {0}")]
    Url(#[from] url::ParseError),
    #[error("source returned non-success status {status} for {url}")]
    Status { status: StatusCode, url: String },
}

/// Records found for a scope, plus the sub-queries that could not be run.
#[derive(Debug, Default)]
pub struct Discovery {
    pub records: Vec<ArtifactRecord>,
    pub failed_queries: Vec<ScopeQuery>,
}

#[async_trait::async_trait]
pub trait SourceCatalog: Send + Sync {
    /// Runs a single scope query.
    async fn query(&self, query: &ScopeQuery) -> Result<Vec<ArtifactRecord>, DiscoveryError>;

    async fn fetch_content(&self, record: &ArtifactRecord) -> Result<ArtifactContent, FetchError>;

    /// Properties of the artifact, first value per key. An artifact without
    /// properties yields an empty set.
    async fn fetch_properties(&self, record: &ArtifactRecord) -> Result<PropertySet, FetchError>;

    /// Union of every query in `scope`, in query order. Duplicates are kept.
    ///
    /// A failing query is logged and skipped; the call only fails when every
    /// query failed.
    async fn list_records(&self, scope: &Scope) -> Result<Discovery, DiscoveryError> {
        let queries = scope.queries();
        let mut discovery = Discovery::default();

        for query in &queries {
            match self.query(query).await {
                Ok(records) => {
                    info!(scope = %query, count = records.len(), "discovery query finished");
                    discovery.records.extend(records);
                }
                Err(error) => {
                    warn!(scope = %query, error = %error, "discovery query failed");
                    discovery.failed_queries.push(query.clone());
                }
            }
        }

        if !queries.is_empty() && discovery.failed_queries.len() == queries.len() {
            return Err(DiscoveryError::AllQueriesFailed {
                attempted: queries.len(),
            });
        }

        Ok(discovery)
    }
}

/// Client for an Artifactory-style source service.
#[derive(Debug, Clone)]
pub struct ArtifactoryCatalog {
    client: Client,
    endpoint: SourceEndpoint,
}

impl ArtifactoryCatalog {
    pub fn new(endpoint: SourceEndpoint, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(request_timeout)?,
            endpoint,
        })
    }

    fn artifact_segments<'a>(&'a self, record: &'a ArtifactRecord) -> [&'a str; 3] {
        [
            self.endpoint.repo.as_str(),
            record.source_path.as_str(),
            record.name.as_str(),
        ]
    }
}

#[async_trait::async_trait]
impl SourceCatalog for ArtifactoryCatalog {
    async fn query(&self, query: &ScopeQuery) -> Result<Vec<ArtifactRecord>, DiscoveryError> {
        let url = join_url(&self.endpoint.base_url, ["api/search/aql"])?;
        let body = render_aql(&self.endpoint.repo, &self.endpoint.root, query);

        let response = self
            .client
            .post(url)
            .basic_auth(&self.endpoint.user, Some(&self.endpoint.token))
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DiscoveryError::Status { status, body });
        }

        let result = response.json::<AqlResponse>().await?;
        Ok(result.results.into_iter().map(AqlItem::into_record).collect())
    }

    async fn fetch_content(&self, record: &ArtifactRecord) -> Result<ArtifactContent, FetchError> {
        let url = join_url(&self.endpoint.base_url, self.artifact_segments(record))?;

        let response = self
            .client
            .get(url.clone())
            .basic_auth(&self.endpoint.user, Some(&self.endpoint.token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status,
                url: url.to_string(),
            });
        }

        let stream = response.bytes_stream().map_err(io::Error::other).boxed();
        Ok(ArtifactContent::new(record.size, stream))
    }

    async fn fetch_properties(&self, record: &ArtifactRecord) -> Result<PropertySet, FetchError> {
        let mut url = join_url(
            &self.endpoint.base_url,
            ["api/storage"].into_iter().chain(self.artifact_segments(record)),
        )?;
        url.set_query(Some("properties"));

        let response = self
            .client
            .get(url.clone())
            .basic_auth(&self.endpoint.user, Some(&self.endpoint.token))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(PropertySet::new());
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                status,
                url: url.to_string(),
            });
        }

        let result = response.json::<PropertiesResponse>().await?;
        Ok(first_values(result.properties))
    }
}

/// Builds the AQL search for one scope query. Every query is pinned to the
/// repository and to file entries.
pub(crate) fn render_aql(repo: &str, root: &str, query: &ScopeQuery) -> String {
    let mut criteria = Map::new();
    criteria.insert("repo".to_owned(), Value::from(repo));
    criteria.insert("type".to_owned(), Value::from("file"));

    match query {
        ScopeQuery::WholeProject => {
            if !root.is_empty() {
                criteria.insert("$or".to_owned(), subtree(root));
            }
        }
        ScopeQuery::Path(path) => {
            criteria.insert("$or".to_owned(), subtree(&join_path(root, path)));
        }
        ScopeQuery::Node { dir, name } => {
            let dir = join_path(root, dir);
            let dir = if dir.is_empty() { ".".to_owned() } else { dir };
            criteria.insert("path".to_owned(), Value::String(dir));
            criteria.insert("name".to_owned(), Value::String(name.clone()));
        }
    }

    format!("items.find({}){AQL_INCLUDE}", Value::Object(criteria))
}

fn subtree(path: &str) -> Value {
    json!([
        { "path": path },
        { "path": { "$match": format!("{path}/*") } },
    ])
}

fn join_path(root: &str, relative: &str) -> String {
    match (root.is_empty(), relative.is_empty()) {
        (true, _) => relative.to_owned(),
        (false, true) => root.to_owned(),
        (false, false) => format!("{root}/{relative}"),
    }
}

fn first_values(properties: BTreeMap<String, Vec<String>>) -> PropertySet {
    properties
        .into_iter()
        .filter_map(|(key, values)| values.into_iter().next().map(|value| (key, value)))
        .collect()
}

#[derive(Debug, Deserialize)]
struct AqlResponse {
    results: Vec<AqlItem>,
}

#[derive(Debug, Deserialize)]
struct AqlItem {
    path: String,
    name: String,
    size: u64,
    #[serde(default)]
    created_by: String,
}

impl AqlItem {
    fn into_record(self) -> ArtifactRecord {
        // Files at the repository root are reported with path ".".
        let source_path = if self.path == "." {
            String::new()
        } else {
            self.path.trim_matches('/').to_owned()
        };
        ArtifactRecord {
            source_path,
            name: self.name,
            size: self.size,
            created_by: self.created_by,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PropertiesResponse {
    #[serde(default)]
    properties: BTreeMap<String, Vec<String>>,
}
