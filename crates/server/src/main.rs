use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{ws::Message, DefaultBodyLimit, Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use pipeline::{ChangeFeed, RetryPolicy, StatusAggregator, TriggerRuntime, JOBS_PATTERN};
use serde::Deserialize;
use server_api::{ApiContext, LogoSettings, LogoTarget};
use shared::{
    domain::{Job, JobId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        CreateJobRequest, DropEvent, DropOutcome, LoginRequest, LoginResponse,
        LogoUploadResponse, ServerEvent, StatsResponse, UpdateJobRequest, UpdateStatusRequest,
    },
};
use storage::Storage;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod live;

use auth::{mint_token, verify_token, AuthUser, SessionConfig};
use config::{load_settings, prepare_database_url};
use live::{visible_to, LiveQuery};

/// JSON bodies stay accepted even when logos are capped lower than this.
const MIN_BODY_LIMIT: usize = 64 * 1024;

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    sessions: SessionConfig,
    events: broadcast::Sender<ServerEvent>,
}

type HttpError = (StatusCode, Json<ApiError>);

#[derive(Debug, Deserialize)]
struct LogoUploadQuery {
    filename: Option<String>,
    job_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let (events, _) = broadcast::channel(256);
    let (changes, change_rx) = ChangeFeed::channel();
    let runtime = build_trigger_runtime(&storage, events.clone(), settings.retry_policy())?;
    tokio::spawn(Arc::new(runtime).run(change_rx));

    let api = ApiContext {
        storage,
        changes,
        logos: LogoSettings {
            public_url: settings.public_url(),
            max_bytes: settings.max_logo_bytes,
        },
    };
    let sessions = SessionConfig {
        secret: settings.session_secret.clone(),
        issuer: settings.session_issuer.clone(),
        ttl_seconds: settings.session_ttl_seconds,
    };
    let app = build_router(Arc::new(AppState {
        api,
        sessions,
        events,
    }));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Counters first, then the live-query push that reads them back.
fn build_trigger_runtime(
    storage: &Storage,
    events: broadcast::Sender<ServerEvent>,
    retry: RetryPolicy,
) -> anyhow::Result<TriggerRuntime> {
    let mut runtime = TriggerRuntime::new(retry);
    runtime.register(JOBS_PATTERN, Arc::new(StatusAggregator::new(storage.clone())))?;
    runtime.register(JOBS_PATTERN, Arc::new(LiveQuery::new(storage.clone(), events)))?;
    Ok(runtime)
}

fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.api.logos.max_bytes.max(MIN_BODY_LIMIT);
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/jobs", get(http_list_jobs).post(http_create_job))
        .route("/jobs/drop", post(http_drop_job))
        .route(
            "/jobs/:job_id",
            get(http_get_job)
                .patch(http_update_job)
                .delete(http_delete_job),
        )
        .route("/jobs/:job_id/status", put(http_update_status))
        .route("/stats", get(http_stats))
        .route("/stats/recount", post(http_recount_stats))
        .route("/logos", post(upload_logo))
        .route("/logos/*path", get(download_logo))
        .route("/ws", get(ws_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}

fn http_error(err: ApiError) -> HttpError {
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::UploadFailed => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(|e| {
        error!(error = %e, "health check failed");
        http_error(ApiError::new(ErrorCode::Internal, "storage unavailable"))
    })?;
    Ok("ok")
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, HttpError> {
    let user_id = server_api::login(&state.api, &req.username)
        .await
        .map_err(http_error)?;
    let session = mint_token(&state.sessions, &user_id).map_err(|e| {
        error!(error = %e, "failed to mint session token");
        http_error(ApiError::new(ErrorCode::Internal, "failed to issue session"))
    })?;
    info!(%user_id, "user logged in");

    Ok(Json(LoginResponse {
        user_id,
        token: session.token,
        expires_at: session.expires_at,
    }))
}

async fn http_list_jobs(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<Job>>, HttpError> {
    let jobs = server_api::list_jobs(&state.api, &user)
        .await
        .map_err(http_error)?;
    Ok(Json(jobs))
}

async fn http_create_job(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(req): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<Job>), HttpError> {
    let job = server_api::create_job(&state.api, &user, req)
        .await
        .map_err(http_error)?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn http_get_job(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, HttpError> {
    let job = server_api::get_job(&state.api, &user, &JobId(job_id))
        .await
        .map_err(http_error)?;
    Ok(Json(job))
}

async fn http_update_job(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(job_id): Path<String>,
    Json(req): Json<UpdateJobRequest>,
) -> Result<Json<Job>, HttpError> {
    let job = server_api::update_job(&state.api, &user, &JobId(job_id), req)
        .await
        .map_err(http_error)?;
    Ok(Json(job))
}

async fn http_update_status(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(job_id): Path<String>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<Json<Job>, HttpError> {
    let job = server_api::update_job_status(&state.api, &user, &JobId(job_id), req.status)
        .await
        .map_err(http_error)?;
    Ok(Json(job))
}

async fn http_drop_job(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(event): Json<DropEvent>,
) -> Result<Json<DropOutcome>, HttpError> {
    let outcome = server_api::move_job(&state.api, &user, &event)
        .await
        .map_err(http_error)?;
    Ok(Json(outcome))
}

async fn http_delete_job(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(job_id): Path<String>,
) -> Result<StatusCode, HttpError> {
    server_api::delete_job(&state.api, &user, &JobId(job_id))
        .await
        .map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_stats(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Result<Json<StatsResponse>, HttpError> {
    let counts = server_api::status_counts(&state.api, &user)
        .await
        .map_err(http_error)?;
    Ok(Json(StatsResponse { counts }))
}

async fn http_recount_stats(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Result<Json<StatsResponse>, HttpError> {
    let counts = server_api::recount_stats(&state.api, &user)
        .await
        .map_err(http_error)?;
    Ok(Json(StatsResponse { counts }))
}

async fn upload_logo(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Query(q): Query<LogoUploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<LogoUploadResponse>, HttpError> {
    let target = match (q.filename, q.job_id) {
        (Some(filename), None) => LogoTarget::NewJob { filename },
        (None, Some(job_id)) => LogoTarget::Job(JobId(job_id)),
        _ => {
            return Err(http_error(ApiError::validation(
                "exactly one of filename or job_id is required",
            )))
        }
    };
    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());

    let uploaded = server_api::upload_logo(&state.api, &user, target, &body, mime_type)
        .await
        .map_err(http_error)?;
    Ok(Json(uploaded))
}

async fn download_logo(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    let logo = state
        .api
        .storage
        .load_logo(&format!("logos/{path}"))
        .await
        .map_err(|e| http_error(ApiError::new(ErrorCode::Internal, e.to_string())))?
        .ok_or_else(|| http_error(ApiError::not_found("logo not found")))?;

    let mut headers = HeaderMap::new();
    let content_type = logo
        .mime_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    Ok((StatusCode::OK, headers, logo.bytes))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Result<impl IntoResponse, HttpError> {
    let user_id = verify_token(&state.sessions, &q.token)
        .map_err(|e| http_error(ApiError::unauthorized(e.to_string())))?;
    Ok(ws.on_upgrade(move |socket| ws_connection(state, socket, user_id)))
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    user_id: UserId,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(state.events.subscribe());
    info!(%user_id, "live query subscribed");

    let send_task = tokio::spawn(async move {
        while let Some(item) = events.next().await {
            let event = match item {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(%user_id, skipped, "live query subscriber lagged");
                    continue;
                }
            };
            let Some(message) = live_message(&event, &user_id) else {
                continue;
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

/// Encodes `event` for `user_id`'s socket, or `None` when the socket should
/// not receive it.
fn live_message(event: &ServerEvent, user_id: &UserId) -> Option<Message> {
    if !visible_to(event, user_id) {
        return None;
    }
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text)),
        Err(error) => {
            warn!(%user_id, %error, "failed to encode live event");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
