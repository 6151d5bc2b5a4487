use crate::engine::{EngineError, EngineHandle};
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use faceprint_core::{MatchPolicy, ProviderError};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::limit::RequestBodyLimitLayer;

/// Upload limit for image payloads: 10M.
const UPLOAD_LIMIT_BYTES: usize = 1024 * 1024 * 10;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub policy: MatchPolicy,
    pub threshold: f32,
}

/// API error wrapper mapping the engine taxonomy onto HTTP statuses.
pub enum ApiError {
    Engine(EngineError),
    BadRequest(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self::Engine(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::Engine(EngineError::NoFaceDetected) => (
                StatusCode::BAD_REQUEST,
                "No faces detected in the image".to_string(),
            ),
            ApiError::Engine(EngineError::Provider(ProviderError::ImageDecode(e))) => (
                StatusCode::BAD_REQUEST,
                format!("could not decode uploaded image: {e}"),
            ),
            ApiError::Engine(e) => {
                tracing::error!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

/// Build the HTTP router.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/register_face", post(register_face))
        .route("/recognize_face", post(recognize_face))
        .route("/status", get(status))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(UPLOAD_LIMIT_BYTES))
        .with_state(state)
}

#[derive(Deserialize)]
struct RegisterParams {
    name: String,
}

/// Register a new face: store one embedding per face detected in the
/// uploaded image, all under the given name.
async fn register_face(
    State(state): State<AppState>,
    Query(params): Query<RegisterParams>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let image = read_upload(multipart).await?;
    tracing::info!(name = %params.name, bytes = image.len(), "register requested");

    let record_ids = state.engine.register(params.name.clone(), image).await?;

    Ok(Json(json!({
        "message": format!("Successfully registered face for {}", params.name),
        "record_ids": record_ids,
    })))
}

/// Recognize faces in the uploaded image: one label (or `Unknown`) per
/// detected face.
async fn recognize_face(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let image = read_upload(multipart).await?;
    tracing::info!(bytes = image.len(), "recognize requested");

    let recognized_faces = state.engine.recognize(image).await?;

    Ok(Json(json!({ "recognized_faces": recognized_faces })))
}

/// Daemon status: version, record count, active matching configuration.
async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let status = state.engine.status().await?;
    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "records": status.records,
        "policy": state.policy.as_str(),
        "threshold": state.threshold,
    })))
}

/// Pull the `file` field out of a multipart upload.
async fn read_upload(mut multipart: Multipart) -> Result<Vec<u8>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart payload: {e}")))?
    {
        if field.name() == Some("file") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(format!("failed to read upload: {e}")))?;
            return Ok(bytes.to_vec());
        }
    }
    Err(ApiError::BadRequest(
        "missing `file` field in multipart payload".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_face_maps_to_400() {
        let response = ApiError::from(EngineError::NoFaceDetected).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_engine_failure_maps_to_500() {
        let response = ApiError::from(EngineError::ChannelClosed).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_bad_request_maps_to_400() {
        let response = ApiError::BadRequest("missing `file` field".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
