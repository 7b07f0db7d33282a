//! Prediction gateway: `/predict` and `/metrics`

use super::request::{parse_gateway, GatewayRequest};
use super::{with_tracking, ApiError, Rejection, ServiceContext};
use crate::types::{BatchPredictions, GatewayPrediction, Transaction};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::error;

/// Router of the gateway variant
pub fn router(ctx: ServiceContext) -> Router {
    let routes = Router::new()
        .route("/predict", post(predict))
        .route("/metrics", get(metrics));
    with_tracking(routes, ctx)
}

async fn predict(State(ctx): State<ServiceContext>, body: Bytes) -> Result<Response, Rejection> {
    let engine = ctx.engine()?;
    let request = parse_gateway(&body).map_err(|e| ctx.reject(e))?;

    match request {
        GatewayRequest::Single(features) => {
            let prediction = engine
                .predict(&Transaction::new(features))
                .map_err(|e| ctx.reject(ApiError::from(e)))?;
            ctx.metrics().record_prediction(prediction.eh_fraude);
            Ok(Json(GatewayPrediction::from(prediction)).into_response())
        }
        GatewayRequest::Batch(rows) => {
            let predictions = engine
                .predict_labels(&rows)
                .map_err(|e| ctx.reject(ApiError::from(e)))?;
            for &label in &predictions {
                ctx.metrics().record_prediction(label == 1);
            }
            Ok(Json(BatchPredictions { predictions }).into_response())
        }
    }
}

async fn metrics(State(ctx): State<ServiceContext>) -> Response {
    match ctx.metrics().render() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
