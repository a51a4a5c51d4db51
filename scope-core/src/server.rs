//! HTTP surface: routing, handlers and error responses.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Multipart, Path, State, multipart::MultipartError},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::{Config, EnvDefaults};
use crate::error::{CoreResult, ScopeError};
use crate::model::{ChatTurnRequest, Conversation, ConversationDetail, ModelInfo, Role, StoredMessage};
use crate::models::ModelFilter;
use crate::relay::{AudioUpload, Relay, TurnConfig};
use crate::store::{ConversationStore, MemoryStore, SettingsStore};

/// Upload cap for `/api/transcribe`, matching the upstream transcription limit.
pub const TRANSCRIBE_BODY_LIMIT: usize = 25 * 1024 * 1024;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub settings: Arc<dyn SettingsStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub config: Arc<Config>,
    pub env: EnvDefaults,
    pub model_filter: Arc<ModelFilter>,
}

impl AppState {
    /// State backed by one in-memory store for both settings and conversations.
    pub fn in_memory(config: Config, env: EnvDefaults, relay: Relay) -> CoreResult<Self> {
        let store = Arc::new(MemoryStore::new());
        let model_filter = Arc::new(ModelFilter::new(&config.models)?);
        Ok(Self {
            relay,
            settings: store.clone(),
            conversations: store,
            config: Arc::new(config),
            env,
            model_filter,
        })
    }

    async fn turn_config(&self, requested_model: Option<&str>) -> CoreResult<TurnConfig> {
        TurnConfig::resolve(self.settings.as_ref(), &self.env, &self.config.upstream, requested_model).await
    }
}

impl IntoResponse for ScopeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error.kind = self.kind(), error = %self, "request failed");
        } else {
            tracing::debug!(error.kind = self.kind(), error = %self, "request rejected");
        }
        let mut resp = (status, Json(json!({ "error": self.to_string() }))).into_response();
        if let ScopeError::RateLimited { retry_after: Some(secs) } = self
            && let Ok(v) = HeaderValue::from_str(&secs.to_string())
        {
            resp.headers_mut().insert(header::RETRY_AFTER, v);
        }
        resp
    }
}

/// Create the API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/settings/{key}", get(get_setting).post(set_setting).delete(delete_setting))
        .route("/api/conversations", get(list_conversations).post(create_conversation))
        .route(
            "/api/conversations/{id}",
            get(get_conversation).patch(rename_conversation).delete(delete_conversation),
        )
        .route("/api/conversations/{id}/messages", post(add_message))
        .route("/api/models", get(list_models))
        .route(
            "/api/transcribe",
            post(transcribe).get(transcribe_get).layer(DefaultBodyLimit::max(TRANSCRIBE_BODY_LIMIT)),
        )
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server.
pub async fn run_server(state: AppState, bind: &str) -> CoreResult<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "scope listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> CoreResult<T> {
    serde_json::from_slice(body).map_err(|e| ScopeError::MalformedRequest(e.to_string()))
}

#[derive(Serialize, Deserialize)]
pub struct Success {
    pub success: bool,
}

fn success() -> Json<Success> {
    Json(Success { success: true })
}

// ---- chat ----

async fn chat(State(state): State<AppState>, body: Bytes) -> Result<Response, ScopeError> {
    let req: ChatTurnRequest = parse_body(&body)?;
    let turn = state.turn_config(req.model.as_deref()).await?;
    let upstream = state.relay.relay_chat(&turn, &req).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache, no-transform")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(upstream))
        .map_err(|e| ScopeError::Other(e.into()))
}

// ---- settings ----

#[derive(Serialize, Deserialize)]
pub struct SettingValue {
    pub value: Option<String>,
}

async fn get_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<SettingValue>, ScopeError> {
    let value = state.settings.get_setting(&key).await?;
    Ok(Json(SettingValue { value }))
}

async fn set_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<Json<Success>, ScopeError> {
    let body: Value = parse_body(&body)?;
    let Some(value) = body.get("value").and_then(Value::as_str) else {
        return Err(ScopeError::Validation("value must be a string".into()));
    };
    let value = value.trim();
    if value.is_empty() {
        state.settings.delete_setting(&key).await?;
        tracing::debug!(%key, "setting cleared");
    } else {
        state.settings.set_setting(&key, value).await?;
        tracing::debug!(%key, "setting saved");
    }
    Ok(success())
}

async fn delete_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Success>, ScopeError> {
    state.settings.delete_setting(&key).await?;
    Ok(success())
}

// ---- conversations ----

fn required_title(body: &[u8]) -> CoreResult<String> {
    let body: Value = parse_body(body)?;
    match body.get("title").and_then(Value::as_str).map(str::trim) {
        Some(t) if !t.is_empty() => Ok(t.to_string()),
        _ => Err(ScopeError::Validation("title is required".into())),
    }
}

async fn list_conversations(State(state): State<AppState>) -> Result<Json<Vec<Conversation>>, ScopeError> {
    Ok(Json(state.conversations.list_conversations().await?))
}

async fn create_conversation(State(state): State<AppState>, body: Bytes) -> Result<Json<Conversation>, ScopeError> {
    let title = required_title(&body)?;
    Ok(Json(state.conversations.create_conversation(&title).await?))
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationDetail>, ScopeError> {
    state
        .conversations
        .get_conversation(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ScopeError::NotFound(format!("conversation {id}")))
}

async fn rename_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Success>, ScopeError> {
    let title = required_title(&body)?;
    state.conversations.rename_conversation(&id, &title).await?;
    Ok(success())
}

async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Success>, ScopeError> {
    state.conversations.delete_conversation(&id).await?;
    Ok(success())
}

async fn add_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<StoredMessage>, ScopeError> {
    let body: Value = parse_body(&body)?;
    let role = match body.get("role").and_then(Value::as_str) {
        Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        _ => return Err(ScopeError::Validation("valid role and content are required".into())),
    };
    let content = match body.get("content").and_then(Value::as_str) {
        Some(c) if !c.is_empty() => c,
        _ => return Err(ScopeError::Validation("valid role and content are required".into())),
    };
    Ok(Json(state.conversations.add_message(&id, role, content).await?))
}

// ---- models ----

#[derive(Serialize, Deserialize)]
pub struct ModelList {
    pub models: Vec<ModelInfo>,
}

async fn list_models(State(state): State<AppState>) -> Result<Json<ModelList>, ScopeError> {
    let turn = state.turn_config(None).await?;
    let models = state.relay.list_models(&turn.api_key, &state.model_filter).await?;
    Ok(Json(ModelList { models }))
}

// ---- transcription ----

#[derive(Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
}

async fn transcribe(State(state): State<AppState>, mut multipart: Multipart) -> Result<Json<Transcript>, ScopeError> {
    let mut audio = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map_err(multipart_error)?;
        audio = Some(AudioUpload { file_name, content_type, bytes });
        break;
    }
    let audio = audio.ok_or_else(|| ScopeError::Validation("missing file".into()))?;
    let turn = state.turn_config(None).await?;
    let text = state
        .relay
        .transcribe(&turn.api_key, &state.config.upstream.transcription_model, audio)
        .await?;
    Ok(Json(Transcript { text }))
}

fn multipart_error(e: MultipartError) -> ScopeError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ScopeError::PayloadTooLarge(format!("audio upload exceeds {} MiB", TRANSCRIBE_BODY_LIMIT / (1024 * 1024)))
    } else {
        ScopeError::MalformedRequest(e.body_text())
    }
}

async fn transcribe_get() -> impl IntoResponse {
    (StatusCode::METHOD_NOT_ALLOWED, "use POST")
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
