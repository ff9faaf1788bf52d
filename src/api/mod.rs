use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

use crate::db::models::{EdgeSet, GameMomentum};
use crate::error::{EdgeError, ErrorCode};
use crate::refresh::{GameStatusView, RefreshCoordinator, Served};

#[derive(Clone)]
pub struct AppState {
    pub feed: RefreshCoordinator,
}

/// Build the Axum router for the read API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/games", get(games_handler))
        .route("/api/games/:id/momentum", get(momentum_handler))
        .route("/api/games/:id/edges", get(edges_handler))
        .route("/api/games/:id/refresh", post(refresh_handler))
        .route("/api/games/:id/stream", get(stream_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// `EdgeError` as an HTTP response: the error JSON with a matching status.
pub struct ApiError(pub EdgeError);

impl From<EdgeError> for ApiError {
    fn from(err: EdgeError) -> Self {
        ApiError(err)
    }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::EdgeNotFound => StatusCode::NOT_FOUND,
        ErrorCode::InvalidGame => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (status_for(self.0.code), Json(self.0)).into_response()
    }
}

/// GET /api/games
async fn games_handler(State(state): State<Arc<AppState>>) -> Json<Vec<GameStatusView>> {
    Json(state.feed.status())
}

/// GET /api/games/:id/momentum
async fn momentum_handler(
    State(state): State<Arc<AppState>>,
    Path(game_id): Path<String>,
) -> Result<Json<Served<Arc<GameMomentum>>>, ApiError> {
    Ok(Json(state.feed.get_momentum(&game_id)?))
}

/// GET /api/games/:id/edges
async fn edges_handler(
    State(state): State<Arc<AppState>>,
    Path(game_id): Path<String>,
) -> Result<Json<Served<Arc<EdgeSet>>>, ApiError> {
    Ok(Json(state.feed.get_edges(&game_id)?))
}

/// POST /api/games/:id/refresh: fetch now, ignoring backoff, and return
/// the resulting momentum.
async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    Path(game_id): Path<String>,
) -> Result<Json<Served<Arc<GameMomentum>>>, ApiError> {
    state.feed.refresh(&game_id).await?;
    Ok(Json(state.feed.get_momentum(&game_id)?))
}

/// GET /api/games/:id/stream (WebSocket). Holds a subscription for as long
/// as the socket stays open.
async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(game_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_game(socket, state, game_id))
}

async fn stream_game(socket: WebSocket, state: Arc<AppState>, game_id: String) {
    let mut subscription = state.feed.subscribe(&game_id);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            update = subscription.next() => {
                let Some(update) = update else {
                    break;
                };
                let text = match serde_json::to_string(&update) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("Failed to encode update for {}: {}", game_id, e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    debug!("Stream for game {} closed", subscription.game_id());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_map_to_statuses() {
        assert_eq!(status_for(ErrorCode::EdgeNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorCode::InvalidGame), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(ErrorCode::RateLimited), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_api_error_response_status() {
        let resp = ApiError(EdgeError::rate_limited("slow down")).into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let resp = ApiError(EdgeError::invalid_game("nope")).into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
