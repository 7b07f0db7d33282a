//! Prediction API: `/`, `/prediz` and `/info-modelo`

use super::request::parse_features;
use super::{with_tracking, Rejection, ServiceContext};
use crate::types::{FraudPrediction, ModelInfo, StatusMessage, Transaction};
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};

const SERVICE_TITLE: &str = "API de Detecção de Fraude";

/// Router of the API variant
pub fn router(ctx: ServiceContext) -> Router {
    let routes = Router::new()
        .route("/", get(status))
        .route("/prediz", post(predict))
        .route("/info-modelo", get(model_info));
    with_tracking(routes, ctx)
}

async fn status(State(ctx): State<ServiceContext>) -> Json<StatusMessage> {
    Json(StatusMessage {
        mensagem: format!("{SERVICE_TITLE} - Use POST /prediz para classificar transações"),
        modelo_carregado: ctx.is_loaded(),
    })
}

async fn predict(
    State(ctx): State<ServiceContext>,
    body: Bytes,
) -> Result<Json<FraudPrediction>, Rejection> {
    let engine = ctx.engine()?;
    let features = parse_features(&body).map_err(|e| ctx.reject(e))?;
    let prediction = engine
        .predict(&Transaction::new(features))
        .map_err(|e| ctx.reject(e.into()))?;
    ctx.metrics().record_prediction(prediction.eh_fraude);
    Ok(Json(prediction))
}

async fn model_info(State(ctx): State<ServiceContext>) -> Result<Json<ModelInfo>, Rejection> {
    Ok(Json(ctx.engine()?.model_info()))
}
