//! HTTP and WebSocket server.
//!
//! # Endpoints
//!
//! | Method | Path | Gate | Description |
//! |--------|------|------|-------------|
//! | `GET`  | `/health` | none | Health check (returns version) |
//! | `GET`  | `/chat` | chat | WebSocket chat session |
//! | `POST` | `/upload/sentences` | admin | JSON array of documents |
//! | `POST` | `/upload/text-file` | admin | Raw text, chunked into documents |
//! | `POST` | `/upload/csv-file` | admin | Raw CSV, one document per row |
//! | `GET`  | `/job/{job_id}` | admin | Ingestion job status |
//! | `GET`  | `/source-labels` | label exposure | Stored labels visible to the caller |
//!
//! Backend choices travel in the query string as a [`PipelineDescriptor`].
//! Tokens are read from the `token` query parameter or an
//! `Authorization: Bearer` header.
//!
//! # Error Contract
//!
//! ```json
//! { "error": "PARTIAL_WRITE_ERROR", "details": "write rejected, failed documents at indices [2]: ..." }
//! ```
//!
//! The status code comes from [`RagError::status`].
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    body::Bytes,
    extract::{
        rejection::{BytesRejection, JsonRejection, PathRejection, QueryRejection, StringRejection},
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Path, Query, Request, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{bearer_token, AccessGate, ChatAdmission, SIGN_IN_MESSAGE};
use crate::config::Config;
use crate::error::{RagError, RagResult};
use crate::ingest::CsvDelimiter;
use crate::jobs::{Job, JobTracker};
use crate::models::{ApiErrorResponse, ApiInfoResponse, BotResponse, Document};
use crate::pipeline::{ChatChannel, ConversationPipeline, DataUploadPipeline, Inbound};
use crate::selector::{BackendSelector, PipelineDescriptor};
use crate::store::{StoreBackend, VectorStore};

const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    selector: Arc<BackendSelector>,
    gate: Arc<AccessGate>,
    jobs: Arc<JobTracker>,
}

impl AppState {
    /// State with the access gate described by `[auth]`.
    pub fn new(config: Config) -> RagResult<Self> {
        let gate = AccessGate::from_config(&config.auth)?;
        Ok(Self::with_gate(config, gate))
    }

    pub fn with_gate(config: Config, gate: AccessGate) -> Self {
        Self {
            selector: Arc::new(BackendSelector::new(&config)),
            config: Arc::new(config),
            gate: Arc::new(gate),
            jobs: Arc::new(JobTracker::new()),
        }
    }

    pub fn jobs(&self) -> &JobTracker {
        &self.jobs
    }
}

/// Starts the server on `[server].bind` and runs until the process ends.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let state = AppState::new(config.clone())?;
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, auth = %config.auth.provider, "assistant server listening");
    serve(listener, state).await
}

/// Serve on an already-bound listener.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let admin = Router::new()
        .route("/upload/sentences", post(handle_upload_sentences))
        .route("/upload/text-file", post(handle_upload_text_file))
        .route("/upload/csv-file", post(handle_upload_csv_file))
        .route("/job/{job_id}", get(handle_job_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_gate));

    Router::new()
        .route("/health", get(handle_health))
        .route("/chat", get(handle_chat))
        .route("/source-labels", get(handle_source_labels))
        .merge(admin)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

/// Converts a [`RagError`] into `{error, details}` with its status code.
pub struct AppError(RagError);

impl From<RagError> for AppError {
    fn from(e: RagError) -> Self {
        AppError(e)
    }
}

/// Extractor rejections (bad JSON, query, path, or body) use the same
/// `{error, details}` body as every other failure.
macro_rules! rejection_as_invalid_request {
    ($($rejection:ty),* $(,)?) => {
        $(
            impl From<$rejection> for AppError {
                fn from(rejection: $rejection) -> Self {
                    AppError(RagError::InvalidRequest(rejection.body_text()))
                }
            }
        )*
    };
}

rejection_as_invalid_request!(
    JsonRejection,
    QueryRejection,
    PathRejection,
    StringRejection,
    BytesRejection,
);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.0.status();
        if status.is_server_error() {
            tracing::warn!(code = self.0.error_code(), error = %self.0, "request failed");
        }
        let body = ApiErrorResponse {
            error: self.0.error_code().to_string(),
            details: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ============ Gates ============

/// Token from `?token=` or, failing that, the bearer header.
fn request_token(query: Option<&str>, headers: &HeaderMap) -> Option<String> {
    query
        .and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == "token")
                .map(|(_, v)| v.into_owned())
        })
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok())))
}

/// Admin-only interceptor; runs before any backend is opened.
async fn admin_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request_token(request.uri().query(), request.headers());
    if let Some(identity) = state.gate.require_admin(token.as_deref()).await? {
        tracing::debug!(user = %identity.user_id, path = %request.uri().path(), "admin request");
    }
    Ok(next.run(request).await)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Uploads ============

enum UploadInput {
    Documents(Vec<Document>),
    Text {
        file_name: String,
        text: String,
        label: String,
    },
    Csv {
        data: Bytes,
        delimiter: CsvDelimiter,
    },
}

/// Run one ingestion synchronously under a tracked job.
async fn ingest(
    state: &AppState,
    descriptor: &PipelineDescriptor,
    input: UploadInput,
) -> Result<(StatusCode, Json<ApiInfoResponse>), AppError> {
    let job_id = state.jobs.submit();
    state.jobs.start(job_id);

    let result = async {
        let pipeline = DataUploadPipeline::from_descriptor(&state.selector, descriptor).await?;
        match input {
            UploadInput::Documents(docs) => pipeline.add_documents(docs).await,
            UploadInput::Text {
                file_name,
                text,
                label,
            } => {
                pipeline
                    .add_text_file(
                        &file_name,
                        &text,
                        &label,
                        state.config.retrieval.chunk_max_chars,
                    )
                    .await
            }
            UploadInput::Csv { data, delimiter } => pipeline.add_csv_file(&data, delimiter).await,
        }
    }
    .await;

    match result {
        Ok(count) => {
            state.jobs.finish(job_id, json!({ "documents": count }));
            tracing::info!(job_id, documents = count, "ingestion finished");
            Ok((
                StatusCode::CREATED,
                Json(ApiInfoResponse {
                    message: format!("{} documents added", count),
                    job_id: Some(job_id),
                }),
            ))
        }
        Err(e) => {
            state.jobs.fail(
                job_id,
                json!({ "error": e.error_code(), "details": e.to_string() }),
            );
            tracing::warn!(job_id, code = e.error_code(), error = %e, "ingestion failed");
            Err(e.into())
        }
    }
}

#[derive(Deserialize)]
struct SentencesQuery {
    #[serde(flatten)]
    descriptor: PipelineDescriptor,
}

async fn handle_upload_sentences(
    State(state): State<AppState>,
    query: Result<Query<SentencesQuery>, QueryRejection>,
    docs: Result<Json<Vec<Document>>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiInfoResponse>), AppError> {
    let Query(query) = query?;
    let Json(docs) = docs?;
    if docs.is_empty() {
        return Err(RagError::InvalidRequest("no documents in request".into()).into());
    }
    ingest(&state, &query.descriptor, UploadInput::Documents(docs)).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextFileQuery {
    #[serde(flatten)]
    descriptor: PipelineDescriptor,
    label: Option<String>,
    file_name: Option<String>,
}

async fn handle_upload_text_file(
    State(state): State<AppState>,
    query: Result<Query<TextFileQuery>, QueryRejection>,
    text: Result<String, StringRejection>,
) -> Result<(StatusCode, Json<ApiInfoResponse>), AppError> {
    let Query(query) = query?;
    let text = text?;
    let label = query
        .label
        .filter(|l| !l.trim().is_empty())
        .ok_or_else(|| RagError::InvalidRequest("query parameter 'label' is required".into()))?;
    let input = UploadInput::Text {
        file_name: query.file_name.unwrap_or_else(|| "upload.txt".to_string()),
        text,
        label,
    };
    ingest(&state, &query.descriptor, input).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CsvFileQuery {
    #[serde(flatten)]
    descriptor: PipelineDescriptor,
    col_delimiter: Option<String>,
}

async fn handle_upload_csv_file(
    State(state): State<AppState>,
    query: Result<Query<CsvFileQuery>, QueryRejection>,
    data: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<ApiInfoResponse>), AppError> {
    let Query(query) = query?;
    let data = data?;
    let delimiter = match query.col_delimiter.as_deref() {
        Some(d) => d.parse::<CsvDelimiter>()?,
        None => CsvDelimiter::default(),
    };
    ingest(&state, &query.descriptor, UploadInput::Csv { data, delimiter }).await
}

// ============ GET /job/{job_id} ============

async fn handle_job_status(
    State(state): State<AppState>,
    job_id: Result<Path<u64>, PathRejection>,
) -> Result<Json<Job>, AppError> {
    let Path(job_id) = job_id?;
    state
        .jobs
        .get(job_id)
        .map(Json)
        .ok_or_else(|| RagError::NotFound(format!("no job with id {}", job_id)).into())
}

// ============ GET /source-labels ============

#[derive(Deserialize)]
struct LabelsQuery {
    #[serde(flatten)]
    descriptor: PipelineDescriptor,
}

async fn handle_source_labels(
    State(state): State<AppState>,
    query: Result<Query<LabelsQuery>, QueryRejection>,
    request_headers: HeaderMap,
    uri: axum::http::Uri,
) -> Result<Json<Vec<String>>, AppError> {
    let Query(query) = query?;
    let token = request_token(uri.query(), &request_headers);
    let permitted = state.gate.permitted_labels(token.as_deref()).await;
    if permitted.as_ref().is_some_and(BTreeSet::is_empty) {
        return Ok(Json(Vec::new()));
    }

    let descriptor = &query.descriptor;
    let spec = state
        .selector
        .resolve_store(descriptor.vectordb_type.as_deref(), &descriptor.store_params())?;
    let store = StoreBackend::open(&spec, None).await?;
    let stored = store.list_labels().await?;

    let visible: Vec<String> = match permitted {
        Some(permitted) => stored.intersection(&permitted).cloned().collect(),
        None => stored.into_iter().collect(),
    };
    Ok(Json(visible))
}

// ============ GET /chat (WebSocket) ============

#[derive(Deserialize)]
struct ChatQuery {
    #[serde(flatten)]
    descriptor: PipelineDescriptor,
    user: Option<String>,
    label: Option<String>,
}

async fn handle_chat(
    State(state): State<AppState>,
    query: Result<Query<ChatQuery>, QueryRejection>,
    request_headers: HeaderMap,
    uri: axum::http::Uri,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let Query(query) = query?;
    let user = query
        .user
        .clone()
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| RagError::InvalidRequest("query parameter 'user' is required".into()))?;
    let token = request_token(uri.query(), &request_headers);

    Ok(ws.on_upgrade(move |socket| chat_session(state, query, user, token, socket)))
}

/// Client-facing reply when a session's backends cannot be opened. The
/// driver detail stays in the server log.
fn session_open_error(e: &RagError) -> BotResponse {
    BotResponse::error(format!(
        "Could not start the chat session ({}). Try again later.",
        e.error_code()
    ))
}

/// Retrieval labels for a session: its own label, narrowed by permissions.
fn session_labels(label: &str, permitted: Option<BTreeSet<String>>) -> BTreeSet<String> {
    let own = BTreeSet::from([label.to_string()]);
    match permitted {
        Some(permitted) => own.intersection(&permitted).cloned().collect(),
        None => own,
    }
}

async fn chat_session(
    state: AppState,
    query: ChatQuery,
    user: String,
    token: Option<String>,
    socket: WebSocket,
) {
    let mut channel = WsChannel { socket };

    if state.gate.admit_chat(token.as_deref()).await == ChatAdmission::SignInRequired {
        let _ = channel
            .send(&BotResponse::answer(SIGN_IN_MESSAGE, Vec::new(), Vec::new()))
            .await;
        channel.close().await;
        return;
    }

    let label = query
        .label
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| state.config.server.default_label.clone());
    let labels = session_labels(&label, state.gate.permitted_labels(token.as_deref()).await);

    let session =
        ConversationPipeline::from_descriptor(&state.selector, &query.descriptor, &user, &label)
            .await;
    let mut session = match session {
        Ok(session) => session.with_label_filter(Some(labels)),
        Err(e) => {
            tracing::warn!(user = %user, code = e.error_code(), error = %e, "chat session not opened");
            let _ = channel.send(&session_open_error(&e)).await;
            channel.close().await;
            return;
        }
    };

    if let Err(e) = session.run(&mut channel).await {
        tracing::error!(user = %user, error = %e, "chat session ended with an error");
    }
}

/// [`ChatChannel`] over an axum WebSocket. Questions arrive as text frames.
struct WsChannel {
    socket: WebSocket,
}

impl WsChannel {
    async fn close(&mut self) {
        let _ = self.socket.send(Message::Close(None)).await;
    }
}

#[async_trait]
impl ChatChannel for WsChannel {
    async fn recv(&mut self) -> Inbound {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => return Inbound::Question(text.to_string()),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Binary(_))) => {
                    return Inbound::Malformed("binary frame".to_string())
                }
                Some(Ok(Message::Close(_))) | None => return Inbound::Disconnected,
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "websocket receive error");
                    return Inbound::Disconnected;
                }
            }
        }
    }

    async fn send(&mut self, message: &BotResponse) -> RagResult<()> {
        let payload = serde_json::to_string(message)
            .map_err(|e| RagError::InvalidRequest(format!("unserializable reply: {}", e)))?;
        self.socket
            .send(Message::Text(payload.into()))
            .await
            .map_err(|e| RagError::connection("chat", e))
    }
}
