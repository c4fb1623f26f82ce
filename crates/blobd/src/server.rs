use std::{env, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use blob_db::{BlobError, BlobKey, BlobOrder, BlobQuery, Database, NewBlob};
use blob_store::{BlobStore, ObjectStoreConfig, StoreBackend};
use bytes::Bytes;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use utoipa::{Modify, OpenApi, ToSchema};

use crate::auth::{AuthError, Claims, JwtVerifier};
use crate::models::{BlobView, ListBlobsQuery, UpdateBlobBody, UploadAttributes};

/// Default cap on upload size (and request bodies) in bytes.
pub const DEFAULT_SIZE_LIMIT: usize = 100 * 1024 * 1024;

const DEFAULT_LIST_LIMIT: i64 = 1_000;

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let db = Database::connect(&config.db_url)
        .await
        .context("failed to open database")?;

    let store = BlobStore::from_config(&config.store).context("initializing object store")?;

    let pem = std::fs::read(&config.jwt_public_key)
        .with_context(|| format!("reading JWT public key {}", config.jwt_public_key.display()))?;
    let verifier = JwtVerifier::from_rsa_pem(&pem)?;

    let state = Arc::new(AppState {
        db,
        store,
        verifier,
        size_limit: config.size_limit,
    });

    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %config.listen_addr, "blobd listening");
    axum::serve(listener, app)
        .await
        .context("HTTP server exited")?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.size_limit + 64 * 1024; // headroom for multipart framing
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/blobs", get(list_blobs).post(upload_blob))
        .route(
            "/blobs/*path",
            get(get_blob).put(update_blob).delete(delete_blob),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

#[derive(Clone)]
struct AppState {
    db: Database,
    store: BlobStore,
    verifier: JwtVerifier,
    size_limit: usize,
}

#[derive(Debug, Clone)]
struct AppConfig {
    listen_addr: SocketAddr,
    db_url: String,
    jwt_public_key: PathBuf,
    size_limit: usize,
    store: ObjectStoreConfig,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let listen_addr = env::var("BLOBS_API_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid BLOBS_API_ADDR")?;

        let db_url = env::var("BLOBS_DB_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .context("BLOBS_DB_URL or DATABASE_URL must be configured")?;

        let jwt_public_key = env::var("BLOBS_JWT_PUBLIC_KEY")
            .map(PathBuf::from)
            .context("BLOBS_JWT_PUBLIC_KEY must point at an RSA public key PEM")?;

        let size_limit = match env::var("BLOBS_SIZE_LIMIT") {
            Ok(value) => value
                .trim()
                .parse::<usize>()
                .context("invalid BLOBS_SIZE_LIMIT")?,
            Err(_) => DEFAULT_SIZE_LIMIT,
        };

        let backend = env::var("BLOBS_STORE_BACKEND")
            .unwrap_or_else(|_| "s3".to_string())
            .parse::<StoreBackend>()
            .map_err(|err| anyhow::anyhow!("invalid BLOBS_STORE_BACKEND: {err}"))?;

        let store = ObjectStoreConfig {
            backend,
            bucket: env::var("BLOBS_STORE_BUCKET").unwrap_or_else(|_| "blobs".to_string()),
            region: env::var("BLOBS_STORE_REGION").ok().filter(|v| !v.is_empty()),
            endpoint: env::var("BLOBS_STORE_ENDPOINT")
                .ok()
                .filter(|v| !v.is_empty()),
            use_ssl: bool_env("BLOBS_STORE_USE_SSL").unwrap_or(true),
            local_root: env::var("BLOBS_STORE_LOCAL_ROOT").ok().map(PathBuf::from),
        };

        Ok(Self {
            listen_addr,
            db_url,
            jwt_public_key,
            size_limit,
            store,
        })
    }
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy"))
)]
async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[utoipa::path(
    get,
    path = "/metrics",
    responses((status = 200, description = "Prometheus metrics", body = String))
)]
async fn metrics() -> impl IntoResponse {
    (StatusCode::OK, "# metrics placeholder\nblobd_up 1\n")
}

#[utoipa::path(
    get,
    path = "/blobs",
    params(ListBlobsQuery),
    responses(
        (status = 200, description = "List blobs", body = [BlobView]),
        (status = 400, description = "Invalid listing parameters", body = ErrorBody),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn list_blobs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListBlobsQuery>,
) -> Result<Json<Vec<BlobView>>, ApiError> {
    authenticate(&state, &headers)?;

    let offset = query.offset.unwrap_or(0);
    if offset < 0 {
        return Err(ApiError::bad_request("invalid offset"));
    }
    let limit = match query.limit {
        Some(limit) if limit < 0 => return Err(ApiError::bad_request("invalid limit")),
        Some(0) | None => DEFAULT_LIST_LIMIT,
        Some(limit) => limit,
    };
    let order = match query.order_by.as_deref() {
        None | Some("") => BlobOrder::Path,
        Some(raw) => raw
            .parse::<BlobOrder>()
            .map_err(|_| ApiError::bad_request(format!("invalid order_by: {raw}")))?,
    };

    let records = state
        .db
        .list_blobs(BlobQuery {
            offset,
            limit,
            order,
        })
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(records.into_iter().map(BlobView::from).collect()))
}

#[utoipa::path(
    get,
    path = "/blobs/{path}",
    params(("path" = String, Path, description = "Logical blob path")),
    responses(
        (status = 200, description = "Blob metadata (Content-Type: application/json) or the stored bytes"),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 404, description = "Blob not found", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn get_blob(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(rest): Path<String>,
) -> Result<Response, ApiError> {
    authenticate(&state, &headers)?;

    let path = format!("/{rest}");
    let record = state
        .db
        .fetch_blob(BlobKey::ByPath(&path))
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("blob not found"))?;

    // JSON requests get the metadata record; everything else streams the bytes.
    if wants_json(&headers) {
        return Ok(Json(BlobView::from(record)).into_response());
    }

    let file_name = record.file_name().to_string();
    let bytes = state
        .store
        .get(&record.storage_key())
        .await
        .map_err(|err| {
            error!(path = %record.path, %err, "failed to fetch object");
            ApiError::internal("failed to get object")
        })?;

    let response_headers = [
        (
            header::CONTENT_TYPE,
            "application/octet-stream".to_string(),
        ),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        ),
    ];
    Ok((response_headers, bytes).into_response())
}

#[utoipa::path(
    post,
    path = "/blobs",
    responses(
        (status = 201, description = "Blob created or updated", body = BlobView),
        (status = 400, description = "Invalid upload attributes", body = ErrorBody),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn upload_blob(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<(StatusCode, Json<BlobView>), ApiError> {
    let claims = authenticate(&state, &headers)?;

    let (mut attrs, file) = read_upload(multipart).await?;
    attrs.normalize();

    blob_db::validate_path(&attrs.path).map_err(ApiError::from_db)?;
    let declared_size = attrs
        .size
        .ok_or_else(|| ApiError::bad_request("size is required"))?;
    if declared_size <= 0 {
        return Err(ApiError::bad_request("invalid size"));
    }
    if declared_size as u64 > state.size_limit as u64 {
        return Err(ApiError::bad_request("declared size exceeds upload limit"));
    }
    let properties = match attrs.properties {
        Some(value) if !value.is_object() => {
            return Err(ApiError::bad_request("properties must be a JSON object"))
        }
        Some(value) => value,
        None => Value::Object(Default::default()),
    };
    let file = file.ok_or_else(|| ApiError::bad_request("form file missing"))?;

    // Phase one: create or update the metadata record at this path.
    let existing = state
        .db
        .fetch_blob(BlobKey::ByPath(&attrs.path))
        .await
        .map_err(ApiError::internal)?;

    let (record, created) = match existing {
        None => {
            let record = state
                .db
                .insert_blob(NewBlob {
                    path: &attrs.path,
                    size: declared_size,
                    properties: &properties,
                    created_by: &claims.sub,
                })
                .await
                .map_err(ApiError::from_db)?;
            info!(id = %record.id, path = %record.path, "creating blob");
            (record, true)
        }
        Some(existing) => {
            let record = state
                .db
                .update_properties(existing.id, &properties, &claims.sub)
                .await
                .map_err(ApiError::from_db)?
                .ok_or_else(|| ApiError::not_found("blob not found"))?;
            info!(id = %record.id, path = %record.path, "updating blob");
            (record, false)
        }
    };

    // The received byte count must match the declared size before anything
    // is written to the object store.
    if file.len() as i64 != declared_size {
        if created {
            if let Err(err) = state.db.delete_blob(record.id).await {
                warn!(id = %record.id, %err, "failed to remove record after size mismatch");
            }
        }
        return Err(ApiError::bad_request("uploaded size does not match declared size"));
    }

    let mut hasher = Sha256::new();
    hasher.update(&file);
    let sha256 = hex::encode(hasher.finalize());

    let key = record.storage_key();
    info!(id = %record.id, key = %key, size = declared_size, "upload starting");

    if let Err(err) = state.store.put(&key, file).await {
        error!(id = %record.id, key = %key, %err, "error saving object");
        if created {
            if let Err(err) = state.db.delete_blob(record.id).await {
                warn!(id = %record.id, %err, "failed to remove record after store failure");
            }
        }
        return Err(ApiError::internal("error saving file"));
    }

    // Phase two: record the verified size and digest.
    let finalized = state
        .db
        .finalize_upload(record.id, declared_size, &sha256, &claims.sub)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::internal("blob vanished during upload"))?;

    info!(id = %finalized.id, key = %key, size = declared_size, %sha256, "upload complete");

    Ok((StatusCode::CREATED, Json(BlobView::from(finalized))))
}

#[utoipa::path(
    put,
    path = "/blobs/{path}",
    params(("path" = String, Path, description = "Logical blob path")),
    request_body = UpdateBlobBody,
    responses(
        (status = 200, description = "Blob metadata updated", body = BlobView),
        (status = 400, description = "Invalid properties or non-JSON body", body = ErrorBody),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 404, description = "Blob not found", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn update_blob(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(rest): Path<String>,
    body: Result<Json<UpdateBlobBody>, JsonRejection>,
) -> Result<Json<BlobView>, ApiError> {
    let claims = authenticate(&state, &headers)?;

    // Non-JSON content types and malformed payloads are both client errors.
    let Json(body) = body.map_err(|rejection| match rejection {
        JsonRejection::MissingJsonContentType(_) => {
            ApiError::bad_request("only JSON is accepted")
        }
        _ => ApiError::bad_request("invalid JSON body"),
    })?;

    let path = format!("/{rest}");
    let record = state
        .db
        .fetch_blob(BlobKey::ByPath(&path))
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("blob not found"))?;

    if !body.properties.is_object() {
        return Err(ApiError::bad_request("properties must be a JSON object"));
    }

    let updated = state
        .db
        .update_properties(record.id, &body.properties, &claims.sub)
        .await
        .map_err(ApiError::from_db)?
        .ok_or_else(|| ApiError::not_found("blob not found"))?;

    Ok(Json(BlobView::from(updated)))
}

#[utoipa::path(
    delete,
    path = "/blobs/{path}",
    params(("path" = String, Path, description = "Logical blob path")),
    responses(
        (status = 204, description = "Blob deleted"),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 404, description = "Blob not found", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn delete_blob(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(rest): Path<String>,
) -> Result<StatusCode, ApiError> {
    authenticate(&state, &headers)?;

    let path = format!("/{rest}");
    let record = state
        .db
        .fetch_blob(BlobKey::ByPath(&path))
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("blob not found"))?;

    // Object first: a failed object delete leaves the record behind so the
    // blob stays discoverable instead of leaking unreferenced bytes.
    state.store.delete(&record.storage_key()).await.map_err(|err| {
        error!(id = %record.id, %err, "failed to delete object");
        ApiError::internal("failed to delete object")
    })?;

    state
        .db
        .delete_blob(record.id)
        .await
        .map_err(ApiError::internal)?;

    info!(id = %record.id, path = %record.path, "blob deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Collects the non-file fields and the file part from a multipart upload.
async fn read_upload(mut multipart: Multipart) -> Result<(UploadAttributes, Option<Bytes>), ApiError> {
    let mut attrs = UploadAttributes::default();
    let mut file = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::bad_request("malformed multipart body"))?
    {
        let name = field.name().map(ToString::to_string);
        match name.as_deref() {
            Some("path") => {
                attrs.path = field
                    .text()
                    .await
                    .map_err(|_| ApiError::bad_request("bad path field"))?;
            }
            Some("size") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|_| ApiError::bad_request("bad size field"))?;
                attrs.size = Some(
                    raw.trim()
                        .parse::<i64>()
                        .map_err(|_| ApiError::bad_request("invalid size"))?,
                );
            }
            Some("properties") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|_| ApiError::bad_request("bad properties field"))?;
                attrs.properties = Some(
                    serde_json::from_str(&raw)
                        .map_err(|_| ApiError::bad_request("properties must be valid JSON"))?,
                );
            }
            Some("file") => {
                file = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|_| ApiError::bad_request("form file error"))?,
                );
            }
            _ => {}
        }
    }

    Ok((attrs, file))
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/json"))
        .unwrap_or(false)
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Claims, ApiError> {
    let token = require_bearer(headers)?;
    state.verifier.verify(token).map_err(ApiError::from)
}

fn require_bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::unauthorized("missing Authorization bearer token"))?;
    let header_value = value
        .to_str()
        .map_err(|_| ApiError::unauthorized("invalid Authorization header encoding"))?;
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or_else(|| ApiError::unauthorized("Authorization header must be a Bearer token"))
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }

    /// Maps typed metadata-layer failures onto API statuses; anything the
    /// layer did not classify becomes a 500.
    fn from_db(err: anyhow::Error) -> Self {
        match err.downcast::<BlobError>() {
            Ok(BlobError::DuplicatePath(path)) => ApiError::new(
                StatusCode::CONFLICT,
                format!("a blob already exists at path '{path}'"),
            ),
            Ok(BlobError::NotFound(id)) => {
                ApiError::not_found(format!("blob {id} not found"))
            }
            Ok(BlobError::InvalidPath(message)) => {
                ApiError::bad_request(format!("invalid path: {message}"))
            }
            Ok(BlobError::PropertiesTooLarge(len)) => {
                ApiError::bad_request(format!("properties too large ({len} bytes)"))
            }
            Err(other) => ApiError::internal(other),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingToken => {
                ApiError::unauthorized("missing Authorization bearer token")
            }
            AuthError::InvalidToken => ApiError::unauthorized("invalid or expired token"),
            AuthError::InvalidKey(message) => ApiError::internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(status = %self.status, message = %self.message, "api error");
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, serde::Serialize, ToSchema)]
struct ErrorBody {
    error: String,
}

fn bool_env(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .and_then(|value| match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

pub mod docs {
    use super::*;
    use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityRequirement, SecurityScheme};

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Blobs API", version = "0.1.0"),
        paths(
            healthz,
            metrics,
            list_blobs,
            get_blob,
            upload_blob,
            update_blob,
            delete_blob
        ),
        components(schemas(BlobView, UpdateBlobBody, ErrorBody)),
        modifiers(&SecurityAddon)
    )]
    pub struct ApiDoc;

    struct SecurityAddon;

    impl Modify for SecurityAddon {
        fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
            let components = openapi.components.get_or_insert_with(Default::default);
            components.add_security_scheme(
                "bearerAuth",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
            openapi
                .security
                .get_or_insert_with(Default::default)
                .push(SecurityRequirement::new("bearerAuth", Vec::<String>::new()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::Duration as ChronoDuration;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::Service;
    use ulid::Ulid;

    use crate::auth::sign_token;

    const PRIVATE_PEM: &str = include_str!("../testdata/jwt_test_key.pem");
    const PUBLIC_PEM: &str = include_str!("../testdata/jwt_test_key.pub.pem");
    const BOUNDARY: &str = "blobd-test-boundary";

    async fn setup_test_app() -> (Arc<AppState>, Router, TempDir) {
        let temp = TempDir::new().expect("tempdir");
        let db_path = temp.path().join(format!("db-{}.sqlite", Ulid::new()));
        let db = Database::connect_file(&db_path).await.expect("db");

        let state = Arc::new(AppState {
            db,
            store: BlobStore::in_memory(),
            verifier: JwtVerifier::from_rsa_pem(PUBLIC_PEM.as_bytes()).expect("verifier"),
            size_limit: 1024 * 1024,
        });
        let router = build_router(state.clone());
        (state, router, temp)
    }

    fn token_for(subject: &str) -> String {
        sign_token(
            PRIVATE_PEM.as_bytes(),
            subject,
            subject,
            false,
            ChronoDuration::hours(1),
        )
        .expect("token")
    }

    fn multipart_body(fields: &[(&str, &str)], file: Option<&[u8]>) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some(data) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"upload.bin\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(token: &str, fields: &[(&str, &str)], file: Option<&[u8]>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/blobs")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(multipart_body(fields, file)))
            .expect("request")
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn requests_without_valid_token_are_rejected() {
        let (_state, mut router, _tmp) = setup_test_app().await;

        let request = Request::builder()
            .method("GET")
            .uri("/blobs")
            .body(Body::empty())
            .expect("request");
        let response = router.call(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .method("GET")
            .uri("/blobs")
            .header("authorization", "Bearer not-a-jwt")
            .body(Body::empty())
            .expect("request");
        let response = router.call(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn upload_create_then_fetch_roundtrip() {
        let (state, mut router, _tmp) = setup_test_app().await;
        let token = token_for("user-1");
        let data = b"hello blob";

        let response = router
            .call(upload_request(
                &token,
                &[
                    ("path", "/docs/hello.txt"),
                    ("size", "10"),
                    ("properties", r#"{"kind":"greeting"}"#),
                ],
                Some(data),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["path"], "/docs/hello.txt");
        assert_eq!(created["size"], 10);
        assert_eq!(created["created_by"], "user-1");
        assert_eq!(created["properties"]["kind"], "greeting");
        assert!(!created["sha256"].as_str().unwrap().is_empty());

        // Content-Type: application/json selects the metadata record.
        let request = Request::builder()
            .method("GET")
            .uri("/blobs/docs/hello.txt")
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::empty())
            .expect("request");
        let response = router.call(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let metadata = body_json(response).await;
        assert_eq!(metadata["id"], created["id"]);

        // Anything else returns the stored bytes.
        let request = Request::builder()
            .method("GET")
            .uri("/blobs/docs/hello.txt")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request");
        let response = router.call(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/octet-stream"
        );
        assert_eq!(
            response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"hello.txt\""
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        assert_eq!(bytes.as_ref(), data);

        // The object landed under the id-derived storage key.
        let record = state
            .db
            .fetch_blob(BlobKey::ByPath("/docs/hello.txt"))
            .await
            .unwrap()
            .unwrap();
        assert!(state.store.get(&record.storage_key()).await.is_ok());
    }

    #[tokio::test]
    async fn upload_size_mismatch_is_rejected_and_compensated() {
        let (state, mut router, _tmp) = setup_test_app().await;
        let token = token_for("user-1");

        let response = router
            .call(upload_request(
                &token,
                &[("path", "/short.bin"), ("size", "99")],
                Some(b"tiny"),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // The freshly created record must not survive the failed upload.
        let leftover = state
            .db
            .fetch_blob(BlobKey::ByPath("/short.bin"))
            .await
            .unwrap();
        assert!(leftover.is_none());
    }

    #[tokio::test]
    async fn upload_to_existing_path_updates_in_place() {
        let (state, mut router, _tmp) = setup_test_app().await;
        let token = token_for("user-2");

        let response = router
            .call(upload_request(
                &token,
                &[("path", "/note.txt"), ("size", "5"), ("properties", r#"{"v":1}"#)],
                Some(b"first"),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        let first = body_json(response).await;

        let response = router
            .call(upload_request(
                &token,
                &[("path", "/note.txt"), ("size", "6"), ("properties", r#"{"v":2}"#)],
                Some(b"second"),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        let second = body_json(response).await;

        // Same identity, updated metadata, replaced bytes.
        assert_eq!(second["id"], first["id"]);
        assert_eq!(second["properties"]["v"], 2);
        assert_eq!(second["size"], 6);

        let record = state
            .db
            .fetch_blob(BlobKey::ByPath("/note.txt"))
            .await
            .unwrap()
            .unwrap();
        let bytes = state.store.get(&record.storage_key()).await.unwrap();
        assert_eq!(bytes.as_ref(), b"second");
    }

    #[tokio::test]
    async fn upload_rejects_bad_attributes() {
        let (_state, mut router, _tmp) = setup_test_app().await;
        let token = token_for("user-1");

        // Relative path.
        let response = router
            .call(upload_request(
                &token,
                &[("path", "relative.txt"), ("size", "4")],
                Some(b"data"),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Missing file part.
        let response = router
            .call(upload_request(&token, &[("path", "/a.txt"), ("size", "4")], None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Declared size beyond the configured limit.
        let response = router
            .call(upload_request(
                &token,
                &[("path", "/b.txt"), ("size", "10485760")],
                Some(b"data"),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Declared size must be positive.
        for size in ["0", "-4"] {
            let response = router
                .call(upload_request(
                    &token,
                    &[("path", "/d.txt"), ("size", size)],
                    Some(b"data"),
                ))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "size {size}");
        }

        // Properties must be an object.
        let response = router
            .call(upload_request(
                &token,
                &[("path", "/c.txt"), ("size", "4"), ("properties", "[1,2]")],
                Some(b"data"),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_blobs_orders_and_validates_parameters() {
        let (state, mut router, _tmp) = setup_test_app().await;
        let token = token_for("user-1");

        let props = json!({});
        for path in ["/b.txt", "/a.txt", "/c.txt"] {
            state
                .db
                .insert_blob(NewBlob {
                    path,
                    size: 1,
                    properties: &props,
                    created_by: "user-1",
                })
                .await
                .unwrap();
        }

        let request = Request::builder()
            .method("GET")
            .uri("/blobs")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request");
        let response = router.call(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let listed = body_json(response).await;
        let paths: Vec<&str> = listed
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["path"].as_str().unwrap())
            .collect();
        assert_eq!(paths, vec!["/a.txt", "/b.txt", "/c.txt"]);

        for bad in ["/blobs?offset=-1", "/blobs?limit=-5", "/blobs?order_by=bogus"] {
            let request = Request::builder()
                .method("GET")
                .uri(bad)
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .expect("request");
            let response = router.call(request).await.expect("response");
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "uri {bad}");
        }

        let request = Request::builder()
            .method("GET")
            .uri("/blobs?offset=1&limit=1&order_by=path")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request");
        let response = router.call(request).await.expect("response");
        let page = body_json(response).await;
        assert_eq!(page.as_array().unwrap().len(), 1);
        assert_eq!(page[0]["path"], "/b.txt");

        // Limits above the default are honored, not clamped.
        let request = Request::builder()
            .method("GET")
            .uri("/blobs?limit=5000")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request");
        let response = router.call(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let all = body_json(response).await;
        assert_eq!(all.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn put_updates_properties_only() {
        let (state, mut router, _tmp) = setup_test_app().await;
        let token = token_for("editor");

        let props = json!({"a": 1});
        let record = state
            .db
            .insert_blob(NewBlob {
                path: "/doc.md",
                size: 7,
                properties: &props,
                created_by: "author",
            })
            .await
            .unwrap();

        let request = Request::builder()
            .method("PUT")
            .uri("/blobs/doc.md")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(
                serde_json::to_vec(&json!({"properties": {"a": 2}})).unwrap(),
            ))
            .expect("request");
        let response = router.call(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let updated = body_json(response).await;
        assert_eq!(updated["properties"]["a"], 2);
        assert_eq!(updated["size"], 7);
        assert_eq!(updated["updated_by"], "editor");
        assert_eq!(updated["created_by"], "author");
        assert_eq!(updated["id"], record.id.to_string());

        // Non-JSON bodies are a client error, not 415.
        let request = Request::builder()
            .method("PUT")
            .uri("/blobs/doc.md")
            .header("content-type", "text/plain")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from("properties=1"))
            .expect("request");
        let response = router.call(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let request = Request::builder()
            .method("PUT")
            .uri("/blobs/missing.md")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(
                serde_json::to_vec(&json!({"properties": {}})).unwrap(),
            ))
            .expect("request");
        let response = router.call(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let oversized = json!({"properties": {"filler": "y".repeat(blob_db::MAX_PROPERTIES_SIZE)}});
        let request = Request::builder()
            .method("PUT")
            .uri("/blobs/doc.md")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(serde_json::to_vec(&oversized).unwrap()))
            .expect("request");
        let response = router.call(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_removes_object_then_record() {
        let (state, mut router, _tmp) = setup_test_app().await;
        let token = token_for("user-1");

        let response = router
            .call(upload_request(
                &token,
                &[("path", "/victim.dat"), ("size", "4")],
                Some(b"data"),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);

        let record = state
            .db
            .fetch_blob(BlobKey::ByPath("/victim.dat"))
            .await
            .unwrap()
            .unwrap();
        let key = record.storage_key();

        let request = Request::builder()
            .method("DELETE")
            .uri("/blobs/victim.dat")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request");
        let response = router.call(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        assert!(state
            .db
            .fetch_blob(BlobKey::ByPath("/victim.dat"))
            .await
            .unwrap()
            .is_none());
        assert!(state.store.get(&key).await.is_err());

        let request = Request::builder()
            .method("DELETE")
            .uri("/blobs/victim.dat")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request");
        let response = router.call(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn healthz_is_open() {
        let (_state, mut router, _tmp) = setup_test_app().await;
        let request = Request::builder()
            .method("GET")
            .uri("/healthz")
            .body(Body::empty())
            .expect("request");
        let response = router.call(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
