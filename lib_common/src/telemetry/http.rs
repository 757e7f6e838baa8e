//! # Query Service and Router
//!
//! Point and range queries over the store, plus the route table that ties them
//! together with the WebSocket gateway:
//!
//! | Route                      | Response                                     |
//! |----------------------------|----------------------------------------------|
//! | `GET /api/sensors/latest`  | 200 reading, or 204 when nothing is stored   |
//! | `GET /api/sensors/history` | 200 array of up to `historyLen`, oldest first |
//! | `GET /ws`                  | WebSocket subscription                       |
//! | `GET /health`              | 200 `OK`                                     |

use super::engine::AppContext;
use super::gateway::ws_handler;
use super::reading::Reading;
use super::store::{ReadingStore, StoreError};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};

/// Failure while answering a query.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            QueryError::Storage(e) => {
                log::error!("DB query error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "error_type": "StorageError",
                        "message": "Failed to read sensor data.",
                        "detail": e.to_string()
                    }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Builds the application router over `ctx`.
pub fn router<S: ReadingStore>(ctx: Arc<AppContext<S>>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/sensors/latest", get(latest_handler::<S>))
        .route("/api/sensors/history", get(history_handler::<S>))
        .route("/ws", get(ws_handler::<S>))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(ctx)
}

async fn latest_handler<S: ReadingStore>(
    State(ctx): State<Arc<AppContext<S>>>,
) -> Result<Response, QueryError> {
    Ok(match ctx.store.latest().await? {
        Some(reading) => Json(reading).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn history_handler<S: ReadingStore>(
    State(ctx): State<Arc<AppContext<S>>>,
) -> Result<Json<Vec<Reading>>, QueryError> {
    Ok(Json(ctx.store.history(ctx.config.history_len).await?))
}

async fn health_handler() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::config::EngineConfig;
    use crate::telemetry::store::tests::FailingStore;
    use crate::telemetry::store::MemoryStore;
    use axum::body::to_bytes;
    use serde_json::Value;

    async fn into_parts(result: Result<Response, QueryError>) -> (StatusCode, Vec<u8>) {
        let response = result.into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_latest_on_empty_store_is_no_content() {
        let ctx = Arc::new(AppContext::new(EngineConfig::default(), MemoryStore::new()));
        let (status, body) = into_parts(latest_handler(State(ctx)).await).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_is_json_500() {
        let ctx = Arc::new(AppContext::new(EngineConfig::default(), FailingStore::default()));

        let (status, body) = into_parts(latest_handler(State(Arc::clone(&ctx))).await).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error_type"], "StorageError");
        assert!(value["detail"].as_str().unwrap().contains("database is locked"));

        let history = history_handler(State(ctx)).await.map(IntoResponse::into_response);
        let (status, _) = into_parts(history).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
