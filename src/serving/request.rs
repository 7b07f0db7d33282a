//! Request body parsing.
//!
//! Bodies are parsed from raw bytes rather than through a typed extractor so
//! an absent body, an absent field and a wrongly typed field stay distinct.

use super::error::ApiError;
use serde_json::{Map, Value};

/// What a gateway `/predict` call asks for
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayRequest {
    /// `{"features": [...]}`
    Single(Vec<f64>),
    /// `{"dataframe_split": {"data": [[...], ...]}}`
    Batch(Vec<Vec<f64>>),
}

/// Parse `{"features": [f64, ...]}`.
pub fn parse_features(body: &[u8]) -> Result<Vec<f64>, ApiError> {
    let object = parse_object(body)?;
    let features = object
        .get("features")
        .ok_or(ApiError::MissingField("features"))?;
    number_array(features, "features")
}

/// Parse a gateway body: a single feature vector or a `dataframe_split` batch.
pub fn parse_gateway(body: &[u8]) -> Result<GatewayRequest, ApiError> {
    let object = parse_object(body)?;

    if let Some(features) = object.get("features") {
        return number_array(features, "features").map(GatewayRequest::Single);
    }

    let split = object
        .get("dataframe_split")
        .ok_or(ApiError::MissingField("features"))?;
    let split = split
        .as_object()
        .ok_or_else(|| ApiError::MalformedType("'dataframe_split' must be an object".into()))?;
    let data = split
        .get("data")
        .ok_or(ApiError::MissingField("dataframe_split.data"))?;
    let rows = data
        .as_array()
        .ok_or_else(|| ApiError::MalformedType("'dataframe_split.data' must be an array".into()))?;
    if rows.is_empty() {
        return Err(ApiError::Validation("'dataframe_split.data' is empty".into()));
    }

    rows.iter()
        .map(|row| number_array(row, "dataframe_split.data[]"))
        .collect::<Result<Vec<_>, _>>()
        .map(GatewayRequest::Batch)
}

fn parse_object(body: &[u8]) -> Result<Map<String, Value>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::MissingPayload);
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ApiError::MalformedType(format!("invalid JSON: {e}")))?;
    match value {
        Value::Null => Err(ApiError::MissingPayload),
        Value::Object(object) => Ok(object),
        other => Err(ApiError::MalformedType(format!(
            "expected a JSON object, got {}",
            json_type(&other)
        ))),
    }
}

fn number_array(value: &Value, field: &str) -> Result<Vec<f64>, ApiError> {
    let items = value
        .as_array()
        .ok_or_else(|| ApiError::MalformedType(format!("'{field}' must be an array, got {}", json_type(value))))?;
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_f64().ok_or_else(|| {
                ApiError::MalformedType(format!(
                    "'{field}'[{i}] must be a number, got {}",
                    json_type(item)
                ))
            })
        })
        .collect()
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
