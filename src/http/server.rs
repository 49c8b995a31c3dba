use std::{convert::Infallible, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    bus::{Event, EventBus, SubscriptionError},
    chat::{ChatMessage, ChatSession, NewMessage, SessionSummary},
    config::Config,
    http::error::ApiError,
    interface::telegram::{render_contact_form, BotApi, DeliveryError},
    relay::Relay,
    store::Store,
    webhook::{WebhookHandler, WebhookOutcome},
};

const SECRET_TOKEN_HEADER: &str = "x-telegram-bot-api-secret-token";

// -----------------------------------------------------------------------------
// Request / response types
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub success: bool,
    pub message: ChatMessage,
    /// False when the message was stored but Telegram was not notified.
    pub notified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session: ChatSession,
    pub created: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    #[serde(default = "default_session_limit")]
    pub limit: i64,
}

fn default_session_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
pub struct OperatorReplyRequest {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ContactRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub message: String,
}

// -----------------------------------------------------------------------------
// Server State
// -----------------------------------------------------------------------------

pub struct AppState {
    pub store: Store,
    pub bus: Arc<EventBus>,
    pub relay: Relay,
    pub webhook: WebhookHandler,
    pub bot: Option<Arc<dyn BotApi>>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        store: Store,
        bus: Arc<EventBus>,
        bot: Option<Arc<dyn BotApi>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            relay: Relay::new(store.clone(), bus.clone(), bot.clone(), config.clone()),
            webhook: WebhookHandler::new(store.clone(), bus.clone(), bot.clone(), config.clone()),
            store,
            bus,
            bot,
            config,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat/messages", post(send_message))
        .route("/api/chat/sessions", get(list_sessions))
        .route("/api/chat/sessions/:id", put(create_session))
        .route("/api/chat/sessions/:id/messages", get(session_history))
        .route("/api/chat/sessions/:id/replies", post(operator_reply))
        .route("/api/chat/sessions/:id/events", get(session_events))
        .route("/api/chat/events", get(dashboard_events))
        .route("/api/contact", post(contact))
        .route("/telegram/webhook", post(telegram_webhook))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

// -----------------------------------------------------------------------------
// Handlers
// -----------------------------------------------------------------------------

async fn health() -> &'static str {
    "OK"
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let outcome = state
        .relay
        .relay(&request.session_id, &request.message)
        .await?;

    Ok(Json(SendMessageResponse {
        success: true,
        notified: outcome.notified(),
        warning: outcome.warning(),
        message: outcome.message,
    }))
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id = session_id.trim();
    if session_id.is_empty() {
        return Err(ApiError::Validation("Session id is required.".to_string()));
    }

    let (session, created) = state.store.ensure_session(session_id).await?;
    let status = if created {
        info!(session_id, "Chat session created");
        state.bus.publish(Event::SessionCreated(session.clone()));
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((status, Json(SessionResponse { session, created })))
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let limit = query.limit.clamp(1, 500);
    Ok(Json(state.store.list_sessions(limit).await?))
}

async fn session_history(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    Ok(Json(state.store.get_chat_history(&session_id).await?))
}

/// Operator answering from the web dashboard instead of Telegram.
async fn operator_reply(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<OperatorReplyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = request.content.trim();
    if content.is_empty() {
        return Err(ApiError::Validation("Reply is required.".to_string()));
    }

    if state.store.get_session(&session_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Unknown session: {session_id}")));
    }

    let reply = state
        .store
        .append_message(&NewMessage::operator(&session_id, content))
        .await?;
    state.bus.publish(Event::MessageInserted(reply.clone()));

    Ok((StatusCode::CREATED, Json(reply)))
}

async fn session_events(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    debug!(session_id = %session_id, "Session event stream opened");
    let mut subscription = state.bus.subscribe_session(session_id);

    let stream = async_stream::stream! {
        loop {
            match subscription.recv().await {
                Ok(msg) => match SseEvent::default().event("message").json_data(&msg) {
                    Ok(event) => yield Ok(event),
                    Err(e) => warn!("Failed to encode chat message event: {}", e),
                },
                Err(SubscriptionError::Lagged(skipped)) => {
                    warn!(skipped, "Session stream lagged, asking client to resync");
                    yield Ok(SseEvent::default().event("resync").data("history"));
                }
                Err(SubscriptionError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn dashboard_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    debug!("Dashboard event stream opened");
    let mut subscription = state.bus.subscribe_all();

    let stream = async_stream::stream! {
        loop {
            match subscription.recv().await {
                Ok(event) => match SseEvent::default().event("change").json_data(&event) {
                    Ok(event) => yield Ok(event),
                    Err(e) => warn!("Failed to encode dashboard event: {}", e),
                },
                Err(SubscriptionError::Lagged(skipped)) => {
                    warn!(skipped, "Dashboard stream lagged, asking client to resync");
                    yield Ok(SseEvent::default().event("resync").data("sessions"));
                }
                Err(SubscriptionError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Contact form submissions go straight to the operator chat; nothing is stored.
async fn contact(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ContactRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = request.name.trim();
    let email = request.email.trim();
    let message = request.message.trim();
    if name.is_empty() || email.is_empty() || message.is_empty() {
        return Err(ApiError::Validation(
            "Name, email, and message are required.".to_string(),
        ));
    }

    let (Some(bot), Some(chat_id)) = (state.bot.as_ref(), state.config.operator_chat_id) else {
        return Err(ApiError::Unavailable(DeliveryError::NotConfigured.to_string()));
    };

    let text = render_contact_form(name, email, message);
    let timeout = state.config.relay_timeout;
    let result = match tokio::time::timeout(timeout, bot.send_markdown(chat_id, &text, None)).await
    {
        Ok(result) => result,
        Err(_) => Err(DeliveryError::Timeout(timeout)),
    };

    match result {
        Ok(_) => Ok(Json(json!({ "success": true }))),
        Err(e) => {
            warn!("Contact form delivery failed: {}", e);
            Err(ApiError::BadGateway(
                "Failed to send message via Telegram.".to_string(),
            ))
        }
    }
}

/// Always answers 200 so Telegram never retries an update.
async fn telegram_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let secret = headers
        .get(SECRET_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());

    match state.webhook.handle(secret, &body).await {
        WebhookOutcome::Failed(reason) => warn!("Webhook update dropped: {}", reason),
        outcome => debug!(?outcome, "Webhook update handled"),
    }

    (StatusCode::OK, "OK")
}
