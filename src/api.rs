//! Surface HTTP et upgrade WebSocket
//!
//! Enveloppe de réponse uniforme `{code, message, data}` avec la table de
//! codes réservée {0, 400, 401, 404, 500}. L'identité est fournie par le
//! collaborateur d'authentification amont sous forme d'en-tête `x-user-id`
//! de confiance; son absence vaut 401. L'émission et la validation de
//! jetons restent hors de ce cœur.

use crate::dispatch::Dispatcher;
use crate::error::{ImError, Result};
use crate::models::{HistoryMsgListReq, ReportReadReq, SendMsgReq};
use crate::services::{IngestService, ReadService};
use crate::ws::{Dispatch, WsServer};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

// ═══════════════════════════════════════════════════════════════════════
// ÉTAT PARTAGÉ ET ROUTEUR
// ═══════════════════════════════════════════════════════════════════════

/// État global de l'application
#[derive(Clone)]
pub struct AppState {
    pub ws: Arc<WsServer>,
    pub dispatcher: Arc<Dispatcher>,
    pub ingest: Arc<IngestService>,
    pub read: Arc<ReadService>,
}

/// Construit le routeur complet du serveur
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_upgrade))
        .route("/v1/chat/send", post(send_message))
        .route("/v1/chat/conversation/list", get(conversation_list))
        .route("/v1/chat/msg/history/list", post(history_list))
        .route("/v1/chat/report/msg/read", post(report_read))
        .with_state(state)
}

// ═══════════════════════════════════════════════════════════════════════
// ENVELOPPE DE RÉPONSE
// ═══════════════════════════════════════════════════════════════════════

/// Réponse API standard `{code, message, data}`
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            code: 0,
            message: "ok".to_string(),
            data: Some(data),
        })
    }
}

impl IntoResponse for ImError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(ApiResponse::<serde_json::Value> {
            code: self.envelope_code(),
            message: self.public_message(),
            data: None,
        });
        (status, body).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// IDENTITÉ
// ═══════════════════════════════════════════════════════════════════════

/// Identité posée par l'étape d'authentification amont
pub struct AuthUser(pub i64);

/// Décode l'en-tête d'identité; tout écart vaut 401
fn parse_identity(header: Option<&str>) -> Result<i64> {
    header
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .filter(|&id| id > 0)
        .ok_or_else(|| ImError::unauthorized("identité absente ou invalide"))
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ImError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok());
        parse_identity(raw).map(AuthUser)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// HANDLERS
// ═══════════════════════════════════════════════════════════════════════

/// Endpoint de vérification de santé
async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HashMap<String, String>>> {
    let mut info = HashMap::new();
    info.insert("status".to_string(), "healthy".to_string());
    info.insert("service".to_string(), "im-server".to_string());
    info.insert(
        "connections".to_string(),
        state.ws.connection_count().to_string(),
    );
    ApiResponse::ok(info)
}

/// Upgrade WebSocket: la connexion est inscrite sous l'identité authentifiée
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
) -> Response {
    tracing::info!(user_id = %user_id, "🔌 Upgrade WebSocket demandé");

    ws.on_upgrade(move |socket| async move {
        let dispatch = dispatch_fn(Arc::clone(&state.dispatcher));
        state.ws.serve_connection(user_id, socket, dispatch).await;
    })
}

/// Adapte le dispatcher à la signature attendue par les pompes de lecture
fn dispatch_fn(dispatcher: Arc<Dispatcher>) -> Dispatch {
    Arc::new(move |sender, payload| {
        let dispatcher = Arc::clone(&dispatcher);
        async move { dispatcher.process(sender, payload).await }.boxed()
    })
}

/// Envoi synchrone d'un message, même schéma que la trame chat
async fn send_message(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
    Json(mut req): Json<SendMsgReq>,
) -> std::result::Result<Json<ApiResponse<crate::models::Message>>, ImError> {
    // L'identité fait foi, pas le champ du client
    req.user_id = user_id;

    let msg = state.ingest.create_msg(&req).await?;

    // La persistance a réussi: un échec de push ne la défait pas
    if let Err(e) = state
        .dispatcher
        .push_message(msg.clone(), req.target_id)
        .await
    {
        tracing::warn!(msg_id = %msg.msg_id, error = %e, "⚠️ Push différé échoué");
    }

    Ok(ApiResponse::ok(msg))
}

/// Paramètres de pagination de la liste de conversations
#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    page_num: u64,
    #[serde(default)]
    page_size: u64,
}

/// Liste de conversations de l'utilisateur authentifié
async fn conversation_list(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> std::result::Result<Json<ApiResponse<Vec<crate::models::ConversationSummary>>>, ImError> {
    let list = state
        .read
        .conversation_list(user_id, page.page_num.max(1), page.page_size)
        .await?;
    Ok(ApiResponse::ok(list))
}

/// Historique paginé, plus récent d'abord, au-delà du curseur `seq`
async fn history_list(
    AuthUser(_user_id): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<HistoryMsgListReq>,
) -> std::result::Result<Json<ApiResponse<Vec<crate::models::Message>>>, ImError> {
    if req.conversation_id <= 0 {
        return Err(ImError::missing_parameter("conversation_id"));
    }

    let msgs = state
        .read
        .history(
            req.conversation_id,
            req.seq,
            req.page_num.max(1),
            req.page_size,
        )
        .await?;
    Ok(ApiResponse::ok(msgs))
}

/// Report de lecture: avance `last_read_seq` de l'utilisateur authentifié
async fn report_read(
    AuthUser(user_id): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<ReportReadReq>,
) -> std::result::Result<Json<ApiResponse<serde_json::Value>>, ImError> {
    if req.conversation_id <= 0 {
        return Err(ImError::missing_parameter("conversation_id"));
    }
    if req.seq < 0 {
        return Err(ImError::invalid_format("seq", "doit être positif"));
    }

    state
        .read
        .report_read(user_id, req.conversation_id, req.seq)
        .await?;
    Ok(ApiResponse::ok(serde_json::Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identity_accepts_valid_header() {
        assert_eq!(parse_identity(Some("42")).unwrap(), 42);
        assert_eq!(parse_identity(Some(" 7 ")).unwrap(), 7);
    }

    #[test]
    fn test_parse_identity_rejects_garbage() {
        for raw in [None, Some(""), Some("abc"), Some("0"), Some("-3")] {
            let err = parse_identity(raw).unwrap_err();
            assert_eq!(err.http_status(), 401);
        }
    }

    #[test]
    fn test_envelope_ok_shape() {
        let Json(resp) = ApiResponse::ok(5);
        assert_eq!(resp.code, 0);
        assert_eq!(resp.message, "ok");
        assert_eq!(resp.data, Some(5));

        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["code"], 0);
        assert_eq!(json["data"], 5);
    }

    #[test]
    fn test_envelope_error_codes() {
        let err = ImError::not_found("conversation", 9);
        assert_eq!(err.envelope_code(), 404);
        let err = ImError::unauthorized("x");
        assert_eq!(err.envelope_code(), 401);
    }
}
