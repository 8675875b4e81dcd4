use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        multipart::{Field, MultipartError, MultipartRejection},
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, Extension, Json, Multipart, Path, Query, State,
    },
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::attachment::{AttachmentRole, Upload};
use crate::chat::{ChatDetail, ChatMessage, ChatSession};
use crate::entity::Actor;
use crate::error::{ChatError, ChatResult};
use crate::http::auth::{require_actor, TokenTable};
use crate::registry::SessionRegistry;

/// `image` or `file`, with room for stray whitespace.
const MAX_KIND_BYTES: u64 = 16;

// -----------------------------------------------------------------------------
// Wire types
// -----------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub assigned_only: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateChatRequest {
    pub title: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub message: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AssignRequest {
    #[serde(default)]
    pub admin_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub updated: u64,
}

// -----------------------------------------------------------------------------
// Server State
// -----------------------------------------------------------------------------

pub struct ApiState {
    pub registry: Arc<SessionRegistry>,
}

pub struct ApiServer {
    registry: Arc<SessionRegistry>,
    tokens: TokenTable,
}

impl ApiServer {
    pub fn new(registry: Arc<SessionRegistry>, tokens: TokenTable) -> Self {
        Self { registry, tokens }
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(ApiState {
            registry: self.registry.clone(),
        });

        let api = Router::new()
            .route("/api/chats", get(list_chats).post(create_chat))
            .route("/api/chats/:id", get(get_chat).delete(delete_chat))
            .route("/api/chats/:id/messages", post(send_message))
            .route(
                "/api/chats/:id/attachments",
                // Size is enforced while streaming the multipart body instead.
                post(send_attachment).layer(DefaultBodyLimit::disable()),
            )
            .route("/api/chats/:id/assign", post(assign_chat))
            .route("/api/chats/:id/close", post(close_chat))
            .route("/api/chats/:id/read", post(mark_read))
            .route_layer(middleware::from_fn_with_state(
                self.tokens.clone(),
                require_actor,
            ))
            .with_state(state);

        Router::new()
            .route("/health", get(health))
            .merge(api)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }
}

// -----------------------------------------------------------------------------
// Handlers
// -----------------------------------------------------------------------------

async fn health() -> &'static str {
    "ok"
}

async fn list_chats(
    State(state): State<Arc<ApiState>>,
    Extension(actor): Extension<Actor>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ChatResult<Json<Vec<ChatSession>>> {
    let Query(query) = query?;
    let sessions = state
        .registry
        .list_sessions(&actor, query.assigned_only)
        .await?;
    Ok(Json(sessions))
}

async fn create_chat(
    State(state): State<Arc<ApiState>>,
    Extension(actor): Extension<Actor>,
    body: Result<Json<CreateChatRequest>, JsonRejection>,
) -> ChatResult<impl IntoResponse> {
    let Json(req) = body?;
    let detail = state
        .registry
        .create_session(&actor, &req.title, &req.message)
        .await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn get_chat(
    State(state): State<Arc<ApiState>>,
    Extension(actor): Extension<Actor>,
    Path(chat_id): Path<String>,
) -> ChatResult<Json<ChatDetail>> {
    Ok(Json(state.registry.get_detail(&actor, &chat_id).await?))
}

async fn send_message(
    State(state): State<Arc<ApiState>>,
    Extension(actor): Extension<Actor>,
    Path(chat_id): Path<String>,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> ChatResult<(StatusCode, Json<ChatMessage>)> {
    let Json(req) = body?;
    let message = state
        .registry
        .send_message(&actor, &chat_id, &req.message)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// Multipart fields: `file` (required, exactly one), `message` (caption),
/// `kind` (`image` or `file`; inferred from the part's content type if absent).
async fn send_attachment(
    State(state): State<Arc<ApiState>>,
    Extension(actor): Extension<Actor>,
    Path(chat_id): Path<String>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ChatResult<(StatusCode, Json<ChatMessage>)> {
    let mut multipart = multipart.map_err(|e| ChatError::Validation(e.body_text()))?;

    let mut caption: Option<String> = None;
    let mut role: Option<AttachmentRole> = None;
    let mut file: Option<(String, String, Vec<u8>)> = None;

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("message") => {
                let limit = state.registry.policy().max_caption_bytes;
                caption = Some(read_text_field(field, limit).await?);
            }
            Some("kind") => {
                role = Some(read_text_field(field, MAX_KIND_BYTES).await?.parse()?);
            }
            Some("file") => {
                if file.is_some() {
                    return Err(ChatError::Validation(
                        "only one file per message is accepted".into(),
                    ));
                }
                file = Some(read_file_field(&state, field).await?);
            }
            _ => {}
        }
    }

    let (file_name, mime, bytes) =
        file.ok_or_else(|| ChatError::Validation("multipart body has no 'file' part".into()))?;
    let upload = Upload {
        role: role.unwrap_or_else(|| AttachmentRole::infer(&mime)),
        file_name,
        mime,
        bytes,
    };

    let message = state
        .registry
        .send_attachment(&actor, &chat_id, caption.as_deref(), upload)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn assign_chat(
    State(state): State<Arc<ApiState>>,
    Extension(actor): Extension<Actor>,
    Path(chat_id): Path<String>,
    body: Bytes,
) -> ChatResult<Json<ChatSession>> {
    // An empty body claims for the caller; anything else must be a valid request.
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        AssignRequest::default()
    } else {
        serde_json::from_slice::<AssignRequest>(&body)
            .map_err(|e| ChatError::Validation(format!("invalid assign request: {}", e)))?
    };
    let session = state
        .registry
        .assign(&actor, &chat_id, req.admin_id.as_deref())
        .await?;
    Ok(Json(session))
}

async fn close_chat(
    State(state): State<Arc<ApiState>>,
    Extension(actor): Extension<Actor>,
    Path(chat_id): Path<String>,
) -> ChatResult<Json<ChatSession>> {
    Ok(Json(state.registry.close_session(&actor, &chat_id).await?))
}

async fn delete_chat(
    State(state): State<Arc<ApiState>>,
    Extension(actor): Extension<Actor>,
    Path(chat_id): Path<String>,
) -> ChatResult<Json<DeleteResponse>> {
    state.registry.delete_session(&actor, &chat_id).await?;
    info!(chat_id = %chat_id, "Delete confirmed");
    Ok(Json(DeleteResponse { deleted: chat_id }))
}

async fn mark_read(
    State(state): State<Arc<ApiState>>,
    Extension(actor): Extension<Actor>,
    Path(chat_id): Path<String>,
) -> ChatResult<Json<MarkReadResponse>> {
    let updated = state.registry.mark_read(&actor, &chat_id).await?;
    Ok(Json(MarkReadResponse { updated }))
}

/// Reads a text part under `limit` bytes.
async fn read_text_field(mut field: Field<'_>, limit: u64) -> ChatResult<String> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(malformed)? {
        bytes.extend_from_slice(&chunk);
        if bytes.len() as u64 > limit {
            return Err(ChatError::PayloadTooLarge {
                size: bytes.len() as u64,
                limit,
            });
        }
    }

    String::from_utf8(bytes)
        .map_err(|_| ChatError::Validation("multipart text field is not UTF-8".into()))
}

/// Reads the file part chunk by chunk, failing as soon as the size limit is crossed.
async fn read_file_field(
    state: &ApiState,
    mut field: Field<'_>,
) -> ChatResult<(String, String, Vec<u8>)> {
    let file_name = field.file_name().unwrap_or("upload").to_string();
    let mime = field
        .content_type()
        .unwrap_or("application/octet-stream")
        .to_string();

    let policy = state.registry.policy();
    let mut bytes = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(malformed)? {
        bytes.extend_from_slice(&chunk);
        policy.check_size(bytes.len() as u64)?;
    }

    Ok((file_name, mime, bytes))
}

fn malformed(err: MultipartError) -> ChatError {
    ChatError::Validation(format!("malformed multipart body: {}", err.body_text()))
}

impl From<JsonRejection> for ChatError {
    fn from(rejection: JsonRejection) -> Self {
        ChatError::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ChatError {
    fn from(rejection: QueryRejection) -> Self {
        ChatError::Validation(rejection.body_text())
    }
}
