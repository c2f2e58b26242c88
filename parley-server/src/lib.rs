pub mod config;
pub mod connection;
pub mod correlator;
pub mod provider;
pub mod registry;

use axum::{
    extract::ws::WebSocketUpgrade,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use parley_shared::{Completion, CompletionRequest, ErrorBody, ErrorCode};
use provider::{Provider, ProviderError};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

pub fn router(provider: Arc<dyn Provider>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chat", post({
            let provider = provider.clone();
            move |req| chat(req, provider)
        }))
        .route("/ws/chat", get({
            let provider = provider.clone();
            move |ws| ws_handler(ws, provider)
        }))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "OK"
}

async fn chat(
    Json(request): Json<CompletionRequest>,
    provider: Arc<dyn Provider>,
) -> Result<Json<Completion>, (StatusCode, Json<ErrorBody>)> {
    provider
        .complete_chat(&request.model_config, request.messages)
        .await
        .map(Json)
        .map_err(|e| {
            error!("Failed to complete chat: {}", e);
            (
                status_for(&e),
                Json(ErrorBody {
                    error: e.to_string(),
                    code: e.code(),
                }),
            )
        })
}

fn status_for(error: &ProviderError) -> StatusCode {
    match error.code() {
        ErrorCode::MissingCredential => StatusCode::BAD_REQUEST,
        ErrorCode::ProviderRejected => StatusCode::BAD_GATEWAY,
        ErrorCode::NetworkOrTimeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn ws_handler(ws: WebSocketUpgrade, provider: Arc<dyn Provider>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, provider))
}
