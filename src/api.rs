//! HTTP API for the reply service

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::contact::{Contact, ContactStats, ContactUpdate};
use crate::error::{Error, ErrorKind};
use crate::message::Turn;
use crate::pipeline::{HealthReport, ReplyOrchestrator, ReplyOutcome, ReplyRequest};
use crate::storage::SqliteStorage;

const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<ReplyOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<ReplyOrchestrator>) -> Self {
        Self { orchestrator }
    }

    fn store(&self) -> &SqliteStorage {
        self.orchestrator.store()
    }
}

/// Build the router with tracing and permissive CORS
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/reply", post(reply))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/contacts", get(list_contacts))
        .route(
            "/contacts/:id",
            get(get_contact).patch(update_contact).delete(delete_contact),
        )
        .route("/contacts/:id/stats", get(contact_stats))
        .route("/contacts/:id/history", get(contact_history))
        .route("/history/:id", delete(clear_history))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

/// Error body returned for non-2xx responses
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: ErrorKind,
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::DataIntegrity(_) | Error::ForeignKeyViolation(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// === Handlers ===

async fn reply(
    State(state): State<AppState>,
    Json(req): Json<ReplyRequest>,
) -> ApiResult<Json<ReplyOutcome>> {
    Ok(Json(state.orchestrator.reply(req).await?))
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.orchestrator.health().await)
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    contacts: usize,
    exemplars: BTreeMap<String, u64>,
    total_exemplars: u64,
    rag_enabled: bool,
}

async fn stats(State(state): State<AppState>) -> ApiResult<Json<StatsResponse>> {
    let (contacts, exemplars) = state
        .store()
        .run_blocking(|store| Ok((store.list_contacts()?.len(), store.exemplar_counts()?)))
        .await?;
    Ok(Json(StatsResponse {
        contacts,
        total_exemplars: exemplars.values().sum(),
        exemplars,
        rag_enabled: state.orchestrator.rag_active(),
    }))
}

// --- Contact handlers ---

async fn list_contacts(State(state): State<AppState>) -> ApiResult<Json<Vec<Contact>>> {
    Ok(Json(
        state
            .store()
            .run_blocking(|store| store.list_contacts())
            .await?,
    ))
}

async fn get_contact(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Contact>> {
    let lookup = id.clone();
    let contact = state
        .store()
        .run_blocking(move |store| store.get_contact(&lookup))
        .await?
        .ok_or_else(|| Error::not_found(format!("contact {}", id)))?;
    Ok(Json(contact))
}

async fn update_contact(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<ContactUpdate>,
) -> ApiResult<Json<Contact>> {
    if update.is_empty() {
        return Err(Error::validation("update names no fields").into());
    }
    let contact = state
        .store()
        .run_blocking(move |store| store.update_contact(&id, &update))
        .await?;
    Ok(Json(contact))
}

async fn delete_contact(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let target = id.clone();
    let deleted = state
        .store()
        .run_blocking(move |store| store.delete_contact(&target))
        .await?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::not_found(format!("contact {}", id)).into())
    }
}

async fn contact_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ContactStats>> {
    Ok(Json(
        state
            .store()
            .run_blocking(move |store| store.stats_for(&id))
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

/// Most recent turns, newest first
async fn contact_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<Turn>>> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let turns = state
        .store()
        .run_blocking(move |store| {
            if store.get_contact(&id)?.is_none() {
                return Err(Error::not_found(format!("contact {}", id)));
            }
            store.recent_turns(&id, limit)
        })
        .await?;
    Ok(Json(turns))
}

#[derive(Debug, Serialize)]
struct ClearHistoryResponse {
    deleted: usize,
}

async fn clear_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ClearHistoryResponse>> {
    let target = id.clone();
    let deleted = state
        .store()
        .run_blocking(move |store| store.clear_history(&target))
        .await?;
    tracing::info!(contact_id = %id, deleted, "history cleared");
    Ok(Json(ClearHistoryResponse { deleted }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::Prompt;
    use crate::llm::LanguageModel;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct Canned;

    #[async_trait]
    impl LanguageModel for Canned {
        async fn complete(&self, _prompt: &Prompt) -> crate::error::Result<String> {
            Ok("sounds good".to_string())
        }
    }

    fn app() -> (Router, Arc<ReplyOrchestrator>) {
        let mut config = Config::with_data_dir("/tmp/replica-test");
        config.embedding_dimensions = 2;
        let store = Arc::new(SqliteStorage::in_memory(2).unwrap());
        let orchestrator =
            Arc::new(ReplyOrchestrator::new(config, store, None, Arc::new(Canned)).unwrap());
        (router(AppState::new(orchestrator.clone())), orchestrator)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn reply_returns_generated_text() {
        let (app, _) = app();
        let (status, body) = send(
            &app,
            "POST",
            "/reply",
            Some(json!({"contact_id": "c1", "contact_name": "Alice", "message": "dinner?"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reply"], "sounds good");
        assert_eq!(body["exemplars_used"], 0);
        assert!(body["reason"].is_null());
        assert!(body["latency_ms"].is_u64());
    }

    #[tokio::test]
    async fn empty_message_is_a_bad_request() {
        let (app, orchestrator) = app();
        let (status, body) = send(
            &app,
            "POST",
            "/reply",
            Some(json!({"contact_id": "c1", "contact_name": "Alice", "message": ""})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
        assert!(orchestrator.store().list_contacts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _) = app();
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["rag_enabled"], false);
    }

    #[tokio::test]
    async fn disabled_contact_gets_no_reply() {
        let (app, _) = app();
        let request = json!({"contact_id": "c1", "contact_name": "Alice", "message": "hi"});
        send(&app, "POST", "/reply", Some(request.clone())).await;

        let (status, body) = send(&app, "PATCH", "/contacts/c1", Some(json!({"bot_enabled": false}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["bot_enabled"], false);

        let (status, body) = send(&app, "POST", "/reply", Some(request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reply"], "");
        assert_eq!(body["reason"], "bot_disabled");

        let (_, body) = send(&app, "GET", "/contacts/c1", None).await;
        assert_eq!(body["total_messages"], 3);
    }

    #[tokio::test]
    async fn history_and_stats_reflect_replies() {
        let (app, _) = app();
        send(
            &app,
            "POST",
            "/reply",
            Some(json!({"contact_id": "c1", "contact_name": "Alice", "message": "hi"})),
        )
        .await;

        let (status, body) = send(&app, "GET", "/contacts/c1/history?limit=1", None).await;
        assert_eq!(status, StatusCode::OK);
        let turns = body.as_array().unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0]["direction"], "outbound");
        assert_eq!(turns[0]["is_synthesized"], true);

        let (_, body) = send(&app, "GET", "/contacts/c1/stats", None).await;
        assert_eq!(body["inbound_turns"], 1);
        assert_eq!(body["outbound_turns"], 1);

        let (_, body) = send(&app, "GET", "/stats", None).await;
        assert_eq!(body["contacts"], 1);
        assert_eq!(body["total_exemplars"], 0);
    }

    #[tokio::test]
    async fn clear_history_and_delete_contact() {
        let (app, _) = app();
        send(
            &app,
            "POST",
            "/reply",
            Some(json!({"contact_id": "c1", "contact_name": "Alice", "message": "hi"})),
        )
        .await;

        let (status, body) = send(&app, "DELETE", "/history/c1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], 2);

        let (status, _) = send(&app, "DELETE", "/contacts/c1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&app, "GET", "/contacts/c1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn empty_update_is_a_bad_request() {
        let (app, orchestrator) = app();
        send(
            &app,
            "POST",
            "/reply",
            Some(json!({"contact_id": "c1", "contact_name": "Alice", "message": "hi"})),
        )
        .await;

        let (status, body) = send(&app, "PATCH", "/contacts/c1", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
        assert!(orchestrator.store().get_contact("c1").unwrap().unwrap().bot_enabled);
    }

    #[tokio::test]
    async fn unknown_contact_history_is_not_found() {
        let (app, _) = app();
        let (status, _) = send(&app, "GET", "/contacts/nobody/history", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
