use std::future::ready;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Json, Router,
};
use health::HealthRegistry;
use tower_http::trace::TraceLayer;

use crate::api::{DedupError, RecordRequest, RecordResponse};
use crate::processor::DedupProcessor;

#[derive(Clone)]
pub struct State {
    pub processor: Arc<DedupProcessor>,
}

async fn index() -> &'static str {
    "doc deduplicator"
}

async fn record(
    axum::extract::State(state): axum::extract::State<State>,
    Json(request): Json<RecordRequest>,
) -> Result<Json<RecordResponse>, DedupError> {
    let record = request.into_record()?;
    let decision = state.processor.process_record(record).await?;
    Ok(Json(RecordResponse::from_decision(&decision)))
}

pub fn router(
    processor: Arc<DedupProcessor>,
    readiness: HealthRegistry,
    metrics: bool,
) -> Router {
    let state = State { processor };

    let router = Router::new()
        .route("/", get(index))
        .route("/records", post(record))
        .route("/_readiness", get(move || ready(readiness.get_status())))
        .route("/_liveness", get(|| ready("ok")))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Don't install metrics unless asked to. Installing a global recorder
    // when the crate is used as a library (during tests etc) does not work
    // well.
    if metrics {
        let recorder_handle = crate::server::setup_metrics_recorder();

        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
