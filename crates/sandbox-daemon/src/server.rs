//! HTTP surface: wires `AppConfig`, the persistence layer, the identity
//! store and the sandbox kernel into an Axum router, then serves it.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{FromRef, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::stream::{self, Stream};
use sandbox_db::{Database, SandboxRecord};
use sandbox_kernel::{
    exec::ExecutionError,
    image::{ImageProvisioner, ImageProvisionerConfig},
    lifecycle::LifecycleError,
    runtime::DockerRuntimeAdapter,
    ExecutionOutcome, InstallStatus, SandboxKernel,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::{Modify, OpenApi, ToSchema};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::config::AppConfig;
use crate::identity::{IdentityError, IdentityStore};
use crate::middleware::rate_limit::{rate_limit_layer, RateLimitConfig};
use crate::tools::{SseToolTransport, ToolDispatcher, ToolTransport};

/// Path tool callers POST a `{"tool": ..., "arguments": ...}` envelope to;
/// announced to `/sse` subscribers as the `endpoint` event.
const MESSAGES_PATH: &str = "/messages/";

pub struct AppState {
    pub kernel: SandboxKernel<DockerRuntimeAdapter>,
    pub identity: IdentityStore,
    pub config: AppConfig,
}

impl FromRef<Arc<AppState>> for Arc<AppState> {
    fn from_ref(input: &Arc<AppState>) -> Self {
        input.clone()
    }
}

/// Loads configuration, connects to the database and the Docker engine, and
/// serves the HTTP API until the process is terminated.
pub async fn run() -> Result<()> {
    let config = AppConfig::load()?;

    let db = Database::connect(&config.database.url)
        .await
        .context("failed to open database")?;

    let runtime = Arc::new(DockerRuntimeAdapter::connect().context("connecting to docker engine")?);
    let provisioner = Arc::new(ImageProvisioner::new(
        runtime.clone(),
        ImageProvisionerConfig {
            image_name: config.docker.default_image.clone(),
            dockerfile_path: config.docker.dockerfile_path.clone(),
            build_info_path: config.docker.build_info_file.clone(),
            check_dockerfile_changes: config.docker.check_dockerfile_changes,
        },
    ));

    let kernel = SandboxKernel::new(
        db.clone(),
        runtime,
        provisioner,
        config.auth.user_sandbox_limit,
        config.server.base_url.clone(),
        config.auth.append_api_key_to_file_links,
        config.docker.pip_index_url.clone(),
    );
    let identity = IdentityStore::new(db, config.auth.jwt_secret.clone(), config.auth.jwt_ttl_seconds);

    let listen_addr = config.listen_addr()?;
    let state = Arc::new(AppState {
        kernel,
        identity,
        config,
    });

    let app = build_router(state)
        .layer(rate_limit_layer(RateLimitConfig::default()))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %listen_addr, "sandbox-daemon listening");
    axum::serve(listener, app).await.context("HTTP server exited")?;
    Ok(())
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sse", get(sse_handler))
        .route(MESSAGES_PATH, post(messages_handler))
        .route("/sandbox/file", get(sandbox_file))
        .route("/api/register", post(register))
        .route("/api/token", post(login))
        .route("/sandbox", post(create_sandbox).get(list_sandboxes))
        .route("/sandbox/:id", axum::routing::delete(delete_sandbox))
        .route("/sandbox/:id/execute", post(execute_code))
        .route("/sandbox/:id/command", post(execute_command))
        .route("/sandbox/:id/install", post(install_package))
        .route("/sandbox/:id/file", get(download_file).post(upload_file))
        .with_state(state)
}

#[utoipa::path(get, path = "/health", responses((status = 200, description = "Service is healthy")))]
async fn health() -> Json<Value> {
    Json(serde_json::json!({"status": "healthy"}))
}

/// Announces the `/messages/` endpoint tool callers should POST to. A real
/// MCP transport crate would keep this stream open per session instead of
/// closing after the first event.
async fn sse_handler() -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let transport = SseToolTransport::new(MESSAGES_PATH);
    let event = Event::default()
        .event("endpoint")
        .data(transport.endpoint_path().to_string());
    Sse::new(stream::once(async move { Ok(event) })).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize, ToSchema)]
struct ToolCallEnvelope {
    tool: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    arguments: Value,
}

/// Dispatches a named tool call, the POST leg of the `/sse` transport. Native
/// call sites (the REST handlers below) go through the same
/// [`ToolDispatcher`].
async fn messages_handler(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Json(envelope): Json<ToolCallEnvelope>,
) -> Json<Value> {
    let dispatcher = ToolDispatcher::new(state);
    Json(dispatcher.call(&user, &envelope.tool, &envelope.arguments).await)
}

#[derive(Debug, Deserialize, ToSchema)]
struct SandboxFileQuery {
    sandbox_id: Uuid,
    file_path: String,
}

#[utoipa::path(
    get,
    path = "/sandbox/file",
    params(
        ("sandbox_id" = Uuid, Query, description = "Sandbox identifier"),
        ("file_path" = String, Query, description = "Absolute path to read inside the container")
    ),
    responses(
        (status = 200, description = "File contents", content_type = "application/octet-stream"),
        (status = 403, description = "Not owned by the caller"),
        (status = 404, description = "Sandbox or file not found")
    ),
    security(("bearerAuth" = []))
)]
async fn sandbox_file(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Query(query): Query<SandboxFileQuery>,
) -> Result<Vec<u8>, ApiError> {
    let record = state.kernel.lifecycle.resolve_owned(user.id, query.sandbox_id).await?;
    let container_id = state.kernel.lifecycle.resolve_running(&record).await?;

    state
        .kernel
        .lifecycle
        .runtime()
        .get_file(&container_id, &query.file_path)
        .await
        .map_err(|err| ApiError::new(StatusCode::NOT_FOUND, err.to_string()))
}

#[derive(Debug, Deserialize, ToSchema)]
struct RegisterBody {
    username: String,
    email: String,
    password: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct RegisterResponse {
    id: Uuid,
    username: String,
    api_key: String,
}

#[utoipa::path(
    post,
    path = "/api/register",
    request_body = RegisterBody,
    responses(
        (status = 201, description = "User registered", body = RegisterResponse),
        (status = 409, description = "Username or email already registered")
    )
)]
async fn register(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterBody>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let user = state
        .identity
        .register(&payload.username, &payload.email, &payload.password)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            id: user.id,
            username: user.username,
            api_key: user.api_key,
        }),
    ))
}

#[derive(Debug, Deserialize, ToSchema)]
struct LoginBody {
    username: String,
    password: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
}

#[utoipa::path(
    post,
    path = "/api/token",
    request_body = LoginBody,
    responses(
        (status = 200, description = "Access token issued", body = TokenResponse),
        (status = 401, description = "Invalid credentials")
    )
)]
async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginBody>,
) -> Result<Json<TokenResponse>, ApiError> {
    let token = state.identity.login(&payload.username, &payload.password).await?;
    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer",
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
struct CreateSandboxBody {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
struct SandboxResponse {
    id: Uuid,
    name: String,
    created_at: String,
    installed_packages: Vec<String>,
}

impl SandboxResponse {
    fn base(record: &SandboxRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            created_at: record.created_at.to_rfc3339(),
            installed_packages: Vec::new(),
        }
    }
}

#[utoipa::path(
    post,
    path = "/sandbox",
    request_body = CreateSandboxBody,
    responses(
        (status = 201, description = "Sandbox created", body = SandboxResponse),
        (status = 401, description = "Missing or invalid credentials"),
        (status = 409, description = "User sandbox quota exceeded")
    ),
    security(("bearerAuth" = []))
)]
async fn create_sandbox(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateSandboxBody>,
) -> Result<(StatusCode, Json<SandboxResponse>), ApiError> {
    let existing = state.kernel.lifecycle.list_for_user(user.id).await?;
    let name = payload
        .name
        .unwrap_or_else(|| format!("Sandbox {}", existing.len() + 1));

    let record = state.kernel.lifecycle.create_sandbox(user.id, &name).await?;
    Ok((StatusCode::CREATED, Json(SandboxResponse::base(&record))))
}

#[utoipa::path(
    get,
    path = "/sandbox",
    responses((status = 200, description = "List sandboxes owned by the caller", body = [SandboxResponse])),
    security(("bearerAuth" = []))
)]
async fn list_sandboxes(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
) -> Result<Json<Vec<SandboxResponse>>, ApiError> {
    let records = state.kernel.lifecycle.list_for_user(user.id).await?;
    let mut responses = Vec::with_capacity(records.len());
    for record in records {
        let installed_packages = state
            .kernel
            .install
            .list_installed(record.id, &record.container_id)
            .await
            .into_iter()
            .map(|pkg| pkg.name)
            .collect();
        let mut response = SandboxResponse::base(&record);
        response.installed_packages = installed_packages;
        responses.push(response);
    }
    Ok(Json(responses))
}

#[utoipa::path(
    delete,
    path = "/sandbox/{id}",
    params(("id" = Uuid, Path, description = "Sandbox identifier")),
    responses(
        (status = 204, description = "Sandbox deleted"),
        (status = 403, description = "Not owned by the caller"),
        (status = 404, description = "Sandbox not found")
    ),
    security(("bearerAuth" = []))
)]
async fn delete_sandbox(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let record = state.kernel.lifecycle.resolve_owned(user.id, id).await?;
    state.kernel.lifecycle.delete_sandbox(&record).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, ToSchema)]
struct ExecuteCodeBody {
    code: String,
}

#[derive(Debug, Deserialize, ToSchema)]
struct ExecuteCommandBody {
    command: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
struct ExecutionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    stdout: String,
    stderr: String,
    exit_code: Option<i64>,
    files: Vec<String>,
    file_links: Vec<String>,
}

impl From<ExecutionOutcome> for ExecutionResponse {
    fn from(outcome: ExecutionOutcome) -> Self {
        Self {
            error: None,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: outcome.exit_code,
            files: outcome.touched_files.into_iter().map(|f| f.path).collect(),
            file_links: outcome.file_links,
        }
    }
}

/// Runtime failures never cross the tool boundary as HTTP errors: they come
/// back as a structured, in-band execution record at 200 OK, the same shape
/// a successful run produces.
impl From<ExecutionError> for ExecutionResponse {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::PrepareFailed { stdout, stderr, exit_code } => Self {
                error: Some("Could not write code into container".to_string()),
                stdout,
                stderr,
                exit_code,
                files: Vec::new(),
                file_links: Vec::new(),
            },
            ExecutionError::Runtime(err) => Self {
                error: Some(err.to_string()),
                stdout: String::new(),
                stderr: err.to_string(),
                exit_code: Some(1),
                files: Vec::new(),
                file_links: Vec::new(),
            },
        }
    }
}

#[utoipa::path(
    post,
    path = "/sandbox/{id}/execute",
    params(("id" = Uuid, Path, description = "Sandbox identifier")),
    request_body = ExecuteCodeBody,
    responses(
        (status = 200, description = "Execution result", body = ExecutionResponse),
        (status = 403, description = "Not owned by the caller"),
        (status = 404, description = "Sandbox not found")
    ),
    security(("bearerAuth" = []))
)]
async fn execute_code(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ExecuteCodeBody>,
) -> Result<Json<ExecutionResponse>, ApiError> {
    let record = state.kernel.lifecycle.resolve_owned(user.id, id).await?;
    let container_id = state.kernel.lifecycle.resolve_running(&record).await?;

    let response = match state.kernel.execution.run_code(record.id, &container_id, &payload.code).await {
        Ok(outcome) => ExecutionResponse::from(outcome),
        Err(err) => ExecutionResponse::from(err),
    };

    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/sandbox/{id}/command",
    params(("id" = Uuid, Path, description = "Sandbox identifier")),
    request_body = ExecuteCommandBody,
    responses(
        (status = 200, description = "Execution result", body = ExecutionResponse),
        (status = 403, description = "Not owned by the caller"),
        (status = 404, description = "Sandbox not found")
    ),
    security(("bearerAuth" = []))
)]
async fn execute_command(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ExecuteCommandBody>,
) -> Result<Json<ExecutionResponse>, ApiError> {
    let record = state.kernel.lifecycle.resolve_owned(user.id, id).await?;
    let container_id = state.kernel.lifecycle.resolve_running(&record).await?;

    let response = match state
        .kernel
        .execution
        .run_command(record.id, &container_id, payload.command)
        .await
    {
        Ok(outcome) => ExecutionResponse::from(outcome),
        Err(err) => ExecutionResponse::from(err),
    };

    Ok(Json(response))
}

#[derive(Debug, Deserialize, ToSchema)]
struct InstallPackageBody {
    package: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct InstallResponse {
    status: &'static str,
    detail: Option<String>,
}

#[utoipa::path(
    post,
    path = "/sandbox/{id}/install",
    params(("id" = Uuid, Path, description = "Sandbox identifier")),
    request_body = InstallPackageBody,
    responses(
        (status = 200, description = "Install outcome", body = InstallResponse),
        (status = 403, description = "Not owned by the caller"),
        (status = 404, description = "Sandbox not found")
    ),
    security(("bearerAuth" = []))
)]
async fn install_package(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<InstallPackageBody>,
) -> Result<Json<InstallResponse>, ApiError> {
    let record = state.kernel.lifecycle.resolve_owned(user.id, id).await?;
    let container_id = state.kernel.lifecycle.resolve_running(&record).await?;

    let outcome = state
        .kernel
        .install
        .ensure_installed(record.id, &container_id, &payload.package)
        .await;

    Ok(Json(InstallResponse {
        status: match outcome.status {
            InstallStatus::Installing => "installing",
            InstallStatus::Installed => "installed",
            InstallStatus::Failed => "failed",
        },
        detail: outcome.detail,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
struct FileQuery {
    path: String,
}

#[utoipa::path(
    get,
    path = "/sandbox/{id}/file",
    params(("id" = Uuid, Path, description = "Sandbox identifier"), ("path" = String, Query, description = "Path to read inside /app/results")),
    responses(
        (status = 200, description = "File contents", content_type = "application/octet-stream"),
        (status = 403, description = "Not owned by the caller"),
        (status = 404, description = "Sandbox or file not found")
    ),
    security(("bearerAuth" = []))
)]
async fn download_file(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Query(query): Query<FileQuery>,
) -> Result<Vec<u8>, ApiError> {
    let record = state.kernel.lifecycle.resolve_owned(user.id, id).await?;
    let container_id = state.kernel.lifecycle.resolve_running(&record).await?;

    state
        .kernel
        .lifecycle
        .runtime()
        .get_file(&container_id, &query.path)
        .await
        .map_err(|err| ApiError::new(StatusCode::NOT_FOUND, err.to_string()))
}

#[derive(Debug, Deserialize, ToSchema)]
struct UploadFileBody {
    path: String,
    content_base64: String,
}

#[utoipa::path(
    post,
    path = "/sandbox/{id}/file",
    params(("id" = Uuid, Path, description = "Sandbox identifier")),
    request_body = UploadFileBody,
    responses(
        (status = 204, description = "File written"),
        (status = 403, description = "Not owned by the caller"),
        (status = 404, description = "Sandbox not found")
    ),
    security(("bearerAuth" = []))
)]
async fn upload_file(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UploadFileBody>,
) -> Result<StatusCode, ApiError> {
    let record = state.kernel.lifecycle.resolve_owned(user.id, id).await?;
    let container_id = state.kernel.lifecycle.resolve_running(&record).await?;

    let contents = STANDARD
        .decode(payload.content_base64)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "content_base64 is not valid base64"))?;

    state
        .kernel
        .lifecycle
        .runtime()
        .put_file(&container_id, &payload.path, &contents)
        .await
        .map_err(ApiError::internal)?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug)]
pub struct ApiError {
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

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::NotFound(id) => {
                ApiError::new(StatusCode::NOT_FOUND, format!("sandbox {id} not found"))
            }
            LifecycleError::NotOwned(id) => {
                ApiError::new(StatusCode::FORBIDDEN, format!("sandbox {id} is not owned by this user"))
            }
            LifecycleError::QuotaExceeded(limit) => ApiError::new(
                StatusCode::CONFLICT,
                format!("user has reached the maximum limit of {limit} sandboxes"),
            ),
            other => ApiError::internal(other),
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Conflict => ApiError::new(StatusCode::CONFLICT, err.to_string()),
            IdentityError::InvalidCredentials | IdentityError::Inactive => {
                ApiError::new(StatusCode::UNAUTHORIZED, err.to_string())
            }
            other => ApiError::internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { message: self.message })).into_response()
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    message: String,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        register,
        login,
        create_sandbox,
        list_sandboxes,
        delete_sandbox,
        execute_code,
        execute_command,
        install_package,
        download_file,
        upload_file,
        sandbox_file,
    ),
    components(schemas(
        RegisterBody,
        RegisterResponse,
        LoginBody,
        TokenResponse,
        CreateSandboxBody,
        SandboxResponse,
        ExecuteCodeBody,
        ExecuteCommandBody,
        ExecutionResponse,
        InstallPackageBody,
        InstallResponse,
        UploadFileBody,
        ToolCallEnvelope,
        ErrorBody,
    )),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearerAuth",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).bearer_format("JWT").build()),
            );
        }
    }
}
