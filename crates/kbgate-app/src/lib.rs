use std::{convert::Infallible, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response, Sse, sse::Event},
    routing::{get, post},
};
use futures::StreamExt;
use kbgate_contracts::{
    ChatCompletionsRequest, ChatCompletionsResponse, CompletionsRequest, CompletionsResponse,
    HistoryResponse, ModelsResponse, ResponsesRequest, ResponsesResponse,
};
use kbgate_core::{
    ApiShape, ChatEngine, CoreError, NormalizedRequest, ReplyMeta, SseFrame, prompt,
};
use kbgate_upstream::{
    ChatEndpoints, CredentialCache, CredentialStore, HttpAuthenticator, KbChatClient,
    LoginSettings,
};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Span, error, field, info, instrument, warn};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

pub mod config;

use config::{AppConfig, ConfigError};

const BEARER_SCHEME: &str = "Bearer";

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
struct ErrorResponse {
    error: String,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        get_models,
        get_history,
        post_chat_completions,
        post_responses,
        post_completions
    ),
    components(
        schemas(
            HealthResponse,
            ErrorResponse,
            ModelsResponse,
            HistoryResponse,
            ChatCompletionsRequest,
            ChatCompletionsResponse,
            ResponsesRequest,
            ResponsesResponse,
            CompletionsRequest,
            CompletionsResponse
        )
    ),
    tags(
        (name = "kbgate", description = "OpenAI-compatible knowledge-base gateway")
    )
)]
struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Upstream(#[from] CoreError),
}

#[derive(Clone)]
pub struct AppState {
    engine: Arc<ChatEngine>,
}

impl AppState {
    pub fn new(engine: Arc<ChatEngine>) -> Self {
        Self { engine }
    }

    /// Wires the credential cache and upstream client described by `config`.
    pub fn from_config(config: &AppConfig) -> Result<Self, StartupError> {
        let authenticator = Arc::new(HttpAuthenticator::new(LoginSettings {
            login_url: config.login_url.clone(),
            login_name: config.login_name.clone(),
            password: config.password.clone(),
            timeout_seconds: config.login_timeout_seconds,
        }));
        let tokens = Arc::new(CredentialCache::new(
            CredentialStore::new(PathBuf::from(&config.credential_cache_path)),
            authenticator,
            Duration::from_secs(config.token_ttl_seconds),
        ));
        let upstream = Arc::new(KbChatClient::new(ChatEndpoints {
            chat_url: config.chat_url.clone(),
            history_url: config.history_url.clone(),
            assistant_id: config.assistant_id.clone(),
            session_sign: config.session_sign.clone(),
            ask_type: config.ask_type.clone(),
            timeout_seconds: config.upstream_timeout_seconds,
        })?);
        let engine =
            ChatEngine::new(tokens, upstream, config.model_catalog()?, &config.fallback_message);
        Ok(Self::new(Arc::new(engine)))
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/v1/models", get(get_models))
        .route("/v1/chat/history", get(get_history))
        .route("/v1/chat/completions", post(post_chat_completions))
        .route("/v1/responses", post(post_responses))
        .route("/v1/completions", post(post_completions))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service health", body = HealthResponse)),
    tag = "kbgate"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy".to_string() })
}

#[utoipa::path(
    get,
    path = "/v1/models",
    responses((status = 200, description = "OpenAI-compatible model list", body = ModelsResponse)),
    tag = "kbgate"
)]
async fn get_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(state.engine.models().to_models_response())
}

#[utoipa::path(
    get,
    path = "/v1/chat/history",
    responses((status = 200, description = "Conversation history, empty when unavailable", body = HistoryResponse)),
    tag = "kbgate"
)]
#[instrument(skip_all, fields(request_id = %next_request_id()))]
async fn get_history(State(state): State<AppState>) -> Json<HistoryResponse> {
    let history = state.engine.history().await;
    info!(event = "history.served", conversations = history.data.len());
    Json(history)
}

#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    request_body = ChatCompletionsRequest,
    responses(
        (status = 200, description = "Chat completion, or an SSE chunk stream when `stream` is set", body = ChatCompletionsResponse),
        (status = 400, description = "Malformed body or no usable content", body = ErrorResponse),
        (status = 401, description = "Missing caller key", body = ErrorResponse),
        (status = 500, description = "Authentication or upstream failure", body = ErrorResponse)
    ),
    tag = "kbgate"
)]
#[instrument(skip_all, fields(request_id = %next_request_id(), model = field::Empty, stream = field::Empty))]
async fn post_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatCompletionsRequest>, JsonRejection>,
) -> Response {
    let session_key = match caller_key(&headers) {
        Ok(key) => key,
        Err(err) => return error_response(err),
    };
    let request = match parse_body(body) {
        Ok(request) => request,
        Err(err) => return error_response(err),
    };
    let wants_stream = request.stream.unwrap_or(false);
    record_request(&request.model, wants_stream);
    info!(
        event = "request.accepted",
        messages = request.messages.len(),
        user = %key_preview(&session_key)
    );

    let prompt = match prompt::compose_prompt(&prompt::chat_messages(&request.messages)) {
        Ok(prompt) => prompt,
        Err(err) => return error_response(err),
    };
    let normalized = NormalizedRequest {
        model: request.model,
        prompt,
        session_key,
        wants_stream,
    };
    dispatch(&state, normalized, ApiShape::ChatCompletions).await
}

#[utoipa::path(
    post,
    path = "/v1/responses",
    request_body = ResponsesRequest,
    responses(
        (status = 200, description = "Response object, or named SSE delta events when `stream` is set", body = ResponsesResponse),
        (status = 400, description = "Malformed body or no usable content", body = ErrorResponse),
        (status = 401, description = "Missing caller key", body = ErrorResponse),
        (status = 500, description = "Authentication or upstream failure", body = ErrorResponse)
    ),
    tag = "kbgate"
)]
#[instrument(skip_all, fields(request_id = %next_request_id(), model = field::Empty, stream = field::Empty))]
async fn post_responses(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ResponsesRequest>, JsonRejection>,
) -> Response {
    let session_key = match caller_key(&headers) {
        Ok(key) => key,
        Err(err) => return error_response(err),
    };
    let request = match parse_body(body) {
        Ok(request) => request,
        Err(err) => return error_response(err),
    };
    let wants_stream = request.stream.unwrap_or(false);
    record_request(&request.model, wants_stream);

    let prompt = match prompt::compose_prompt(&prompt::responses_messages(&request.input)) {
        Ok(prompt) => prompt,
        Err(err) => return error_response(err),
    };
    info!(
        event = "request.accepted",
        prompt_len = prompt.len(),
        user = %key_preview(&session_key)
    );
    let normalized = NormalizedRequest {
        model: request.model,
        prompt,
        session_key,
        wants_stream,
    };
    dispatch(&state, normalized, ApiShape::Responses).await
}

#[utoipa::path(
    post,
    path = "/v1/completions",
    request_body = CompletionsRequest,
    responses(
        (status = 200, description = "Text completion, or an SSE chunk stream when `stream` is set", body = CompletionsResponse),
        (status = 400, description = "Malformed body or empty prompt", body = ErrorResponse),
        (status = 401, description = "Missing caller key", body = ErrorResponse),
        (status = 500, description = "Authentication or upstream failure", body = ErrorResponse)
    ),
    tag = "kbgate"
)]
#[instrument(skip_all, fields(request_id = %next_request_id(), model = field::Empty, stream = field::Empty))]
async fn post_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CompletionsRequest>, JsonRejection>,
) -> Response {
    let session_key = match caller_key(&headers) {
        Ok(key) => key,
        Err(err) => return error_response(err),
    };
    let request = match parse_body(body) {
        Ok(request) => request,
        Err(err) => return error_response(err),
    };
    let wants_stream = request.stream.unwrap_or(false);
    record_request(&request.model, wants_stream);

    let prompt = match prompt::compose_prompt(&prompt::completion_messages(&request.prompt)) {
        Ok(prompt) => prompt,
        Err(err) => return error_response(err),
    };
    info!(
        event = "request.accepted",
        prompt_len = prompt.len(),
        user = %key_preview(&session_key)
    );
    let normalized = NormalizedRequest {
        model: request.model,
        prompt,
        session_key,
        wants_stream,
    };
    dispatch(&state, normalized, ApiShape::TextCompletions).await
}

async fn dispatch(state: &AppState, request: NormalizedRequest, shape: ApiShape) -> Response {
    let meta = ReplyMeta::new(shape, request.model.clone());
    if request.wants_stream {
        return match state.engine.execute_stream(request, meta).await {
            Ok(frames) => sse_response(frames),
            Err(err) => error_response(err),
        };
    }
    match state.engine.execute(request, meta).await {
        Ok(reply) => Json(reply).into_response(),
        Err(err) => error_response(err),
    }
}

fn sse_response(frames: ReceiverStream<SseFrame>) -> Response {
    let events = frames.map(|frame| {
        let mut event = Event::default();
        if let Some(name) = frame.event {
            event = event.event(name);
        }
        Ok::<Event, Infallible>(event.data(frame.data))
    });
    ([(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")], Sse::new(events)).into_response()
}

/// The caller's key doubles as the upstream session id. A `Bearer ` prefix
/// is optional.
fn caller_key(headers: &HeaderMap) -> Result<String, CoreError> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    let key = match raw.strip_prefix(BEARER_SCHEME) {
        Some(rest) if rest.is_empty() || rest.starts_with(' ') => rest.trim(),
        _ => raw,
    };
    if key.is_empty() {
        return Err(CoreError::Unauthorized("missing Authorization header".to_string()));
    }
    Ok(key.to_string())
}

fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, CoreError> {
    body.map(|Json(request)| request).map_err(|rejection| {
        warn!(event = "request.invalid_body", error = %rejection.body_text());
        CoreError::Validation(format!("invalid request payload: {}", rejection.body_text()))
    })
}

fn record_request(model: &str, stream: bool) {
    let span = Span::current();
    span.record("model", model);
    span.record("stream", stream);
}

fn key_preview(key: &str) -> String {
    key.chars().take(8).collect()
}

fn next_request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}

fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        CoreError::UpstreamStatus { status } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
        CoreError::Auth(_) | CoreError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: CoreError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(event = "request.failed", status = status.as_u16(), error = %err);
    } else {
        warn!(event = "request.rejected", status = status.as_u16(), error = %err);
    }
    (status, Json(ErrorResponse { error: err.to_string() })).into_response()
}
