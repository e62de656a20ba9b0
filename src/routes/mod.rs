//! HTTP エンドポイント
//!
//! `POST /detect-dish` で画像を受け取り分類結果を返します。

pub mod detect;
pub mod health;

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::Notify;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::ClassifierError;
use crate::model::ServerSettings;
use crate::service::ClassifierService;

/// ハンドラ間で共有する状態
pub struct AppState {
    pub service: Arc<ClassifierService>,
    /// アップロード画像の一時保存先
    pub upload_dir: PathBuf,
    /// サーバー停止の要求
    pub shutdown: Arc<Notify>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(service: Arc<ClassifierService>, upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            service,
            upload_dir: upload_dir.into(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// モデルが使用できないことが確定したらサーバーを止める
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// エラーレスポンス `{"detail": ...}`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }
}

impl From<ClassifierError> for ApiError {
    fn from(err: ClassifierError) -> Self {
        let status = match &err {
            ClassifierError::Decode(_) => StatusCode::BAD_REQUEST,
            ClassifierError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { detail: self.detail })).into_response()
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("不正なCORSオリジンを無視します: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// ルーターを構築
pub fn router(state: SharedState, settings: &ServerSettings) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/detect-dish", post(detect::detect_dish))
        .layer(DefaultBodyLimit::max(settings.max_upload_bytes))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&settings.allowed_origins))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (ClassifierError::Decode("bad".into()), StatusCode::BAD_REQUEST),
            (ClassifierError::NotReady, StatusCode::SERVICE_UNAVAILABLE),
            (
                ClassifierError::Inference("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ClassifierError::ConfigMismatch("shape".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status, expected);
        }
    }

    #[test]
    fn test_invalid_origin_is_skipped() {
        // パニックしなければよい
        let _ = cors_layer(&["http://localhost:3000".to_string(), "bad\norigin".to_string()]);
    }
}
