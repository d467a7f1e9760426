use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::StatusCode,
    routing, Json, Router,
};
use poster_common::kinesis::StreamEvent;
use serde::Serialize;
use tower::limit::ConcurrencyLimitLayer;
use tracing::warn;

use crate::error::BatchError;
use crate::handler::{BatchHandler, BatchOutcome};

#[derive(Serialize)]
pub struct ErrorResponse {
    stage: &'static str,
    error: String,
}

pub fn add_routes(
    router: Router,
    handler: Arc<BatchHandler>,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    router
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index))
        .route(
            "/",
            routing::get(index).merge(
                routing::post(post_event)
                    .with_state(handler)
                    .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit))
                    .layer(DefaultBodyLimit::max(max_body_size)),
            ),
        )
}

pub async fn index() -> &'static str {
    "item poster"
}

fn status_for(error: &BatchError) -> StatusCode {
    match error {
        BatchError::Validation(_) | BatchError::Delivery(_) => StatusCode::BAD_GATEWAY,
        BatchError::Auth(_) | BatchError::SchemaLoad(_) | BatchError::Decode(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Run one stream event through the pipeline.
pub async fn post_event(
    State(handler): State<Arc<BatchHandler>>,
    payload: Result<Json<StreamEvent>, JsonRejection>,
) -> Result<Json<BatchOutcome>, (StatusCode, Json<ErrorResponse>)> {
    let Json(event) = payload.map_err(|rejection| {
        warn!(stage = "event", error = %rejection.body_text(), "rejected malformed stream event");
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                stage: "event",
                error: rejection.body_text(),
            }),
        )
    })?;

    handler
        .handle_batch(event.into_raw_records())
        .await
        .map(Json)
        .map_err(|error| {
            (
                status_for(&error),
                Json(ErrorResponse {
                    stage: error.stage(),
                    error: error.to_string(),
                }),
            )
        })
}
