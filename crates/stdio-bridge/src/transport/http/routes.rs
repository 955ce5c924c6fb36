//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{Method, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};

use crate::error::RelayError;
use crate::health::HealthSnapshot;
use crate::service::RelayService;

async fn health(State(service): State<Arc<RelayService>>) -> Json<HealthSnapshot> {
    Json(service.health())
}

async fn relay(State(service): State<Arc<RelayService>>, body: Bytes) -> Response {
    // Run the relay in its own task so that a client disconnect between
    // enqueue and write cannot leave a waiter for a request never sent.
    let service_bg = Arc::clone(&service);
    let task = tokio::spawn(async move { service_bg.relay(&body).await });

    match task.await {
        Ok(Ok(reply)) => (StatusCode::OK, Json(reply)).into_response(),
        Ok(Err(e)) => error_response(&e),
        Err(e) => {
            tracing::error!(error = %e, "Relay task lost");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "relay task lost" })),
            )
                .into_response()
        }
    }
}

fn status_for(err: &RelayError) -> StatusCode {
    match err {
        RelayError::MalformedPayload => StatusCode::BAD_REQUEST,
        RelayError::SubprocessUnavailable(_) | RelayError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RelayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
    }
}

fn error_response(err: &RelayError) -> Response {
    (
        status_for(err),
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

/// Bare OPTIONS gets an empty 204; everything else unrouted is 404.
async fn fallback(method: Method) -> Response {
    if method == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain")],
            "not found",
        )
            .into_response()
    }
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

pub fn routes(service: Arc<RelayService>) -> Router {
    Router::new()
        .route("/health", get(health).fallback(fallback))
        .route("/rpc", post(relay).fallback(fallback))
        .route("/mcp", post(relay).fallback(fallback))
        .fallback(fallback)
        .layer(cors())
        .with_state(service)
}
