use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use futures::{StreamExt, stream};
use repomigrate_pipeline::{
    catalog::{ArtifactoryCatalog, FetchError, SourceCatalog},
    config::{DestinationEndpoint, RunOptions, SourceEndpoint},
    destination::{BkRepoStore, BootstrapError, DestinationStore, NamespaceBootstrap, UploadError},
    models::{ArtifactContent, ArtifactRecord, PropertySet, TransferUnit},
    planner::MigrationPlanner,
    runner::MigrationRunner,
    scope::Scope,
};
use serde_json::json;
use std::{
    collections::HashMap,
    error::Error,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

type TestResult = Result<(), Box<dyn Error>>;

const SOURCE_PREFIX: &str = "/artifactory";
const DEST_PREFIX: &str = "/bkrepo";
const ARTIFACT_BODY: &[u8] = b"0123456789";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct RecordedRequest {
    method: Method,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
}

/// Plays both services: the source under `/artifactory`, the destination
/// under `/bkrepo`.
#[derive(Default)]
struct FakeServices {
    requests: Mutex<Vec<RecordedRequest>>,
    /// Destination node sizes keyed by path inside the destination repository.
    nodes: Mutex<HashMap<String, u64>>,
    repo_create_code: Mutex<i64>,
}

impl FakeServices {
    fn requests_matching(&self, method: &Method, path: &str) -> Vec<RecordedRequest> {
        lock(&self.requests)
            .iter()
            .filter(|request| request.method == *method && request.path == path)
            .cloned()
            .collect()
    }
}

async fn handle(
    State(services): State<Arc<FakeServices>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_owned();
    lock(&services.requests).push(RecordedRequest {
        method: method.clone(),
        path: path.clone(),
        query: uri.query().map(str::to_owned),
        headers,
        body: body.clone(),
    });

    if let Some(rest) = path.strip_prefix(SOURCE_PREFIX) {
        return source_response(&method, rest, &body).await;
    }
    if let Some(rest) = path.strip_prefix(DEST_PREFIX) {
        return destination_response(&services, &method, rest, &body);
    }
    StatusCode::NOT_FOUND.into_response()
}

async fn source_response(method: &Method, path: &str, body: &Bytes) -> Response {
    match (method.as_str(), path) {
        ("POST", "/api/search/aql") => {
            if String::from_utf8_lossy(body).contains("broken") {
                return (StatusCode::INTERNAL_SERVER_ERROR, "search failed").into_response();
            }
            axum::Json(json!({
                "results": [{
                    "repo": "generic-local",
                    "path": "root/proj/data",
                    "name": "a.txt",
                    "type": "file",
                    "size": 10,
                    "created_by": "alice",
                }],
                "range": { "start_pos": 0, "end_pos": 1, "total": 1 },
            }))
            .into_response()
        }
        ("GET", "/generic-local/root/proj/data/a.txt") => ARTIFACT_BODY.to_vec().into_response(),
        ("GET", "/generic-local/root/proj/data/slow.txt") => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            ARTIFACT_BODY.to_vec().into_response()
        }
        ("GET", "/api/storage/generic-local/root/proj/data/a.txt") => axum::Json(json!({
            "properties": { "build": ["42", "43"], "team": ["storage ops"] },
            "uri": "http://source/api/storage/generic-local/root/proj/data/a.txt",
        }))
        .into_response(),
        ("GET", "/api/storage/generic-local/root/proj/data/locked.txt") => {
            (StatusCode::FORBIDDEN, "forbidden").into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

fn destination_response(
    services: &FakeServices,
    method: &Method,
    path: &str,
    body: &Bytes,
) -> Response {
    if *method == Method::GET {
        if let Some(node) = path.strip_prefix("/repository/api/node/detail/proj/generic-local/") {
            if node == "flaky.txt" {
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            let data = lock(&services.nodes)
                .get(node)
                .map(|size| json!({ "size": size, "folder": false, "fullPath": format!("/{node}") }));
            return axum::Json(json!({ "code": 0, "message": null, "data": data })).into_response();
        }
    }

    if *method == Method::PUT {
        if let Some(node) = path.strip_prefix("/generic/proj/generic-local/") {
            match node {
                "broken.txt" => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
                "quota.txt" => {
                    return axum::Json(json!({ "code": 251002, "message": "quota exceeded" }))
                        .into_response();
                }
                _ => {}
            }
            let size = u64::try_from(body.len()).unwrap_or(u64::MAX);
            lock(&services.nodes).insert(node.to_owned(), size);
            return axum::Json(json!({ "code": 0, "data": null })).into_response();
        }
    }

    if *method == Method::POST {
        match path {
            "/repository/api/project/create" => {
                return (
                    StatusCode::BAD_REQUEST,
                    axum::Json(json!({ "code": 251005, "message": "project [proj] existed" })),
                )
                    .into_response();
            }
            "/repository/api/repo/create" => {
                let code = *lock(&services.repo_create_code);
                let status = if code == 0 {
                    StatusCode::OK
                } else {
                    StatusCode::BAD_REQUEST
                };
                return (status, axum::Json(json!({ "code": code, "data": null }))).into_response();
            }
            _ => {}
        }
    }

    StatusCode::NOT_FOUND.into_response()
}

async fn spawn_services(services: Arc<FakeServices>) -> Result<String, std::io::Error> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    let app = Router::new().fallback(handle).with_state(services);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{address}"))
}

fn source_endpoint(base: &str) -> SourceEndpoint {
    SourceEndpoint {
        base_url: format!("{base}{SOURCE_PREFIX}"),
        repo: "generic-local".to_owned(),
        root: "root".to_owned(),
        user: "svc".to_owned(),
        token: "secret".to_owned(),
    }
}

fn destination_endpoint(base: &str) -> DestinationEndpoint {
    DestinationEndpoint {
        base_url: format!("{base}{DEST_PREFIX}"),
        project: "proj".to_owned(),
        repo: "generic-local".to_owned(),
        access_key: "ak".to_owned(),
        secret_key: "sk".to_owned(),
    }
}

fn clients(base: &str) -> Result<(ArtifactoryCatalog, BkRepoStore), reqwest::Error> {
    let timeout = Duration::from_secs(10);
    Ok((
        ArtifactoryCatalog::new(source_endpoint(base), timeout)?,
        BkRepoStore::new(destination_endpoint(base), "admin".to_owned(), timeout)?,
    ))
}

fn record(name: &str) -> ArtifactRecord {
    ArtifactRecord {
        source_path: "root/proj/data".to_owned(),
        name: name.to_owned(),
        size: 10,
        created_by: "alice".to_owned(),
    }
}

fn unit(path: &str) -> TransferUnit {
    TransferUnit {
        destination_path: path.to_owned(),
        record: record("a.txt"),
    }
}

fn artifact_body() -> ArtifactContent {
    let chunks: Vec<std::io::Result<Bytes>> = vec![Ok(Bytes::from_static(ARTIFACT_BODY))];
    ArtifactContent::new(10, stream::iter(chunks).boxed())
}

fn header<'a>(request: &'a RecordedRequest, name: &str) -> Option<&'a str> {
    request.headers.get(name).and_then(|value| value.to_str().ok())
}

#[tokio::test]
async fn discovery_posts_aql_with_basic_auth() -> TestResult {
    let services = Arc::new(FakeServices::default());
    let base = spawn_services(Arc::clone(&services)).await?;
    let (catalog, _) = clients(&base)?;

    let discovery = catalog.list_records(&Scope::whole_project()).await?;

    assert_eq!(discovery.records, vec![record("a.txt")]);
    assert!(discovery.failed_queries.is_empty());

    let searches = services.requests_matching(&Method::POST, "/artifactory/api/search/aql");
    let search = searches.first().ok_or("no search request")?;
    let aql = String::from_utf8_lossy(&search.body).into_owned();
    assert!(aql.starts_with("items.find("));
    assert!(aql.contains(r#""repo":"generic-local""#));
    assert!(aql.ends_with(r#".include("size","path","name","created_by")"#));
    assert_eq!(header(search, "content-type"), Some("text/plain"));
    let expected_auth = format!("Basic {}", STANDARD.encode("svc:secret"));
    assert_eq!(header(search, "authorization"), Some(expected_auth.as_str()));
    Ok(())
}

#[tokio::test]
async fn failing_sub_query_does_not_hide_the_others() -> TestResult {
    let services = Arc::new(FakeServices::default());
    let base = spawn_services(Arc::clone(&services)).await?;
    let (catalog, _) = clients(&base)?;
    let scope = Scope {
        whole_project: false,
        paths: vec!["broken".to_owned(), "proj/data".to_owned()],
        nodes: Vec::new(),
    };

    let discovery = catalog.list_records(&scope).await?;

    assert_eq!(discovery.records.len(), 1);
    assert_eq!(discovery.failed_queries.len(), 1);
    Ok(())
}

#[tokio::test]
async fn content_is_streamed_from_the_source() -> TestResult {
    let services = Arc::new(FakeServices::default());
    let base = spawn_services(services).await?;
    let (catalog, _) = clients(&base)?;

    let content = catalog.fetch_content(&record("a.txt")).await?;
    assert_eq!(content.size(), 10);

    let mut received = Vec::new();
    let mut stream = content.into_checked_stream();
    while let Some(chunk) = stream.next().await {
        received.extend_from_slice(&chunk?);
    }
    assert_eq!(received, ARTIFACT_BODY);
    Ok(())
}

#[tokio::test]
async fn missing_content_is_a_fetch_error() -> TestResult {
    let services = Arc::new(FakeServices::default());
    let base = spawn_services(services).await?;
    let (catalog, _) = clients(&base)?;

    let result = catalog.fetch_content(&record("gone.txt")).await;

    assert!(matches!(
        result,
        Err(FetchError::Status { status, .. }) if status == reqwest::StatusCode::NOT_FOUND
    ));
    Ok(())
}

#[tokio::test]
async fn slow_source_times_out_as_fetch_error() -> TestResult {
    let services = Arc::new(FakeServices::default());
    let base = spawn_services(services).await?;
    let catalog = ArtifactoryCatalog::new(source_endpoint(&base), Duration::from_millis(200))?;

    let result = catalog.fetch_content(&record("slow.txt")).await;

    assert!(matches!(result, Err(FetchError::Http(error)) if error.is_timeout()));
    Ok(())
}

#[tokio::test]
async fn properties_take_the_first_value_and_absence_is_empty() -> TestResult {
    let services = Arc::new(FakeServices::default());
    let base = spawn_services(Arc::clone(&services)).await?;
    let (catalog, _) = clients(&base)?;

    let properties = catalog.fetch_properties(&record("a.txt")).await?;
    assert_eq!(properties.get("build").map(String::as_str), Some("42"));
    assert_eq!(properties.get("team").map(String::as_str), Some("storage ops"));

    let lookups = services.requests_matching(
        &Method::GET,
        "/artifactory/api/storage/generic-local/root/proj/data/a.txt",
    );
    assert_eq!(
        lookups.first().and_then(|request| request.query.as_deref()),
        Some("properties")
    );

    let absent = catalog.fetch_properties(&record("bare.txt")).await?;
    assert!(absent.is_empty());

    let forbidden = catalog.fetch_properties(&record("locked.txt")).await;
    assert!(matches!(forbidden, Err(FetchError::Status { .. })));
    Ok(())
}

#[tokio::test]
async fn existence_requires_matching_size() -> TestResult {
    let services = Arc::new(FakeServices::default());
    lock(&services.nodes).insert("proj/data/a.txt".to_owned(), 10);
    lock(&services.nodes).insert("proj/data/short.txt".to_owned(), 5);
    let base = spawn_services(services).await?;
    let (_, store) = clients(&base)?;

    assert!(store.exists(&unit("proj/data/a.txt")).await);
    assert!(!store.exists(&unit("proj/data/short.txt")).await);
    assert!(!store.exists(&unit("proj/data/none.txt")).await);
    assert!(!store.exists(&unit("flaky.txt")).await);
    Ok(())
}

#[tokio::test]
async fn upload_sends_owner_size_overwrite_and_properties() -> TestResult {
    let services = Arc::new(FakeServices::default());
    let base = spawn_services(Arc::clone(&services)).await?;
    let (catalog, store) = clients(&base)?;

    let mut properties = PropertySet::new();
    properties.insert("build".to_owned(), "42".to_owned());
    let content = catalog.fetch_content(&record("a.txt")).await?;
    store.upload(&unit("proj/data/a.txt"), content, &properties).await?;

    let uploads =
        services.requests_matching(&Method::PUT, "/bkrepo/generic/proj/generic-local/proj/data/a.txt");
    let upload = uploads.first().ok_or("no upload request")?;
    assert_eq!(upload.body.as_ref(), ARTIFACT_BODY);
    assert_eq!(header(upload, "x-bkrepo-uid"), Some("alice"));
    assert_eq!(header(upload, "x-bkrepo-overwrite"), Some("true"));
    assert_eq!(header(upload, "content-length"), Some("10"));
    assert_eq!(header(upload, "x-bkrepo-meta-build"), Some("42"));
    let expected_auth = format!("Platform {}", STANDARD.encode("ak:sk"));
    assert_eq!(header(upload, "authorization"), Some(expected_auth.as_str()));
    Ok(())
}

#[tokio::test]
async fn rejected_upload_is_an_upload_error() -> TestResult {
    let services = Arc::new(FakeServices::default());
    let base = spawn_services(Arc::clone(&services)).await?;
    let (_, store) = clients(&base)?;
    let properties = PropertySet::new();

    let server_error = store.upload(&unit("broken.txt"), artifact_body(), &properties).await;
    assert!(matches!(
        server_error,
        Err(UploadError::Status { status, .. }) if status == reqwest::StatusCode::INTERNAL_SERVER_ERROR
    ));

    let refused = store.upload(&unit("quota.txt"), artifact_body(), &properties).await;
    assert!(matches!(
        refused,
        Err(UploadError::Status { status, ref body }) if status == reqwest::StatusCode::OK && body.contains("251002")
    ));

    assert!(lock(&services.nodes).is_empty());
    Ok(())
}

#[tokio::test]
async fn upload_without_owner_is_attributed_to_the_operator() -> TestResult {
    let services = Arc::new(FakeServices::default());
    let base = spawn_services(Arc::clone(&services)).await?;
    let (_, store) = clients(&base)?;
    let orphan = TransferUnit {
        destination_path: "proj/data/orphan.txt".to_owned(),
        record: ArtifactRecord {
            created_by: String::new(),
            ..record("orphan.txt")
        },
    };

    store.upload(&orphan, artifact_body(), &PropertySet::new()).await?;

    let uploads = services.requests_matching(
        &Method::PUT,
        "/bkrepo/generic/proj/generic-local/proj/data/orphan.txt",
    );
    let upload = uploads.first().ok_or("no upload request")?;
    assert_eq!(header(upload, "x-bkrepo-uid"), Some("admin"));
    Ok(())
}

#[tokio::test]
async fn full_run_against_http_services_is_idempotent() -> TestResult {
    let services = Arc::new(FakeServices::default());
    let base = spawn_services(Arc::clone(&services)).await?;
    let (catalog, store) = clients(&base)?;
    let runner = MigrationRunner::new(
        &catalog,
        &store,
        MigrationPlanner::new("root"),
        RunOptions::default(),
    );

    let first = runner.run(&Scope::whole_project()).await?;
    assert_eq!((first.total, first.succeeded), (1, 1));

    let second = runner.run(&Scope::whole_project()).await?;
    assert_eq!((second.total, second.skipped, second.succeeded), (1, 1, 0));

    let uploads =
        services.requests_matching(&Method::PUT, "/bkrepo/generic/proj/generic-local/proj/data/a.txt");
    assert_eq!(uploads.len(), 1);
    Ok(())
}

#[tokio::test]
async fn bootstrap_accepts_existing_project() -> TestResult {
    let services = Arc::new(FakeServices::default());
    let base = spawn_services(Arc::clone(&services)).await?;
    let (_, store) = clients(&base)?;

    store.ensure_namespace().await?;

    let created = services.requests_matching(&Method::POST, "/bkrepo/repository/api/repo/create");
    let request = created.first().ok_or("no repo create request")?;
    let payload: serde_json::Value = serde_json::from_slice(&request.body)?;
    assert_eq!(payload.get("projectId"), Some(&json!("proj")));
    assert_eq!(payload.get("type"), Some(&json!("GENERIC")));
    assert_eq!(header(request, "x-bkrepo-uid"), Some("admin"));
    Ok(())
}

#[tokio::test]
async fn bootstrap_rejection_is_an_error() -> TestResult {
    let services = Arc::new(FakeServices::default());
    *lock(&services.repo_create_code) = 250_107;
    let base = spawn_services(services).await?;
    let (_, store) = clients(&base)?;

    let result = store.ensure_namespace().await;

    assert!(matches!(
        result,
        Err(BootstrapError::Rejected { kind: "repository", .. })
    ));
    Ok(())
}
