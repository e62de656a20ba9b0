//! 料理画像の分類エンドポイント

use std::path::{Path, PathBuf};

use axum::{
    extract::{Multipart, State},
    Json,
};
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use super::{ApiError, SharedState};

const INVALID_FORMAT: &str = "Invalid image format. Use JPEG or PNG.";

#[derive(Debug, Serialize)]
pub struct DetectDishResponse {
    pub dish: String,
    pub confidence: f64,
}

/// 受け付ける Content-Type と保存時の拡張子
fn extension_for(content_type: &str) -> Option<&'static str> {
    match content_type {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        _ => None,
    }
}

/// 一時保存したアップロード画像（drop 時に削除）
struct TempUpload {
    path: PathBuf,
}

impl TempUpload {
    async fn write(dir: &Path, request_id: Uuid, extension: &str, bytes: &[u8]) -> Result<Self, ApiError> {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            tracing::error!("アップロード先を作成できません {}: {}", dir.display(), e);
            ApiError::internal("Failed to store upload")
        })?;

        let path = dir.join(format!("{}.{}", request_id, extension));
        // 書き込み途中で失敗しても削除されるよう先にガードを作る
        let upload = Self { path };
        tokio::fs::write(&upload.path, bytes).await.map_err(|e| {
            tracing::error!("アップロードを保存できません {}: {}", upload.path.display(), e);
            ApiError::internal("Failed to store upload")
        })?;
        Ok(upload)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("一時ファイルを削除できません {}: {}", self.path.display(), e);
            }
        }
    }
}

/// POST /detect-dish - 画像を分類して料理名を返す
pub async fn detect_dish(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Json<DetectDishResponse>, ApiError> {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("detect_dish", %request_id);

    async move {
        let (extension, bytes) = read_image_field(&mut multipart).await?;
        let upload = TempUpload::write(&state.upload_dir, request_id, extension, &bytes).await?;
        drop(bytes);

        let service = state.service.clone();
        let path = upload.path().to_path_buf();
        let blocking_span = tracing::Span::current();
        let result =
            tokio::task::spawn_blocking(move || blocking_span.in_scope(|| service.predict(&path)))
                .await
                .map_err(|e| {
                    tracing::error!("分類タスクが異常終了しました: {}", e);
                    ApiError::internal("Classification task failed")
                })?;

        match result {
            Ok(result) => {
                tracing::info!("{} ({:.2}%)", result.label, result.confidence);
                Ok(Json(DetectDishResponse {
                    confidence: result.rounded_confidence(),
                    dish: result.label,
                }))
            }
            Err(e) => {
                if e.is_client_error() {
                    tracing::warn!("画像を分類できません: {}", e);
                } else if e.is_fatal() {
                    tracing::error!("モデルを使用できないためサーバーを停止します: {}", e);
                    state.request_shutdown();
                } else {
                    tracing::error!("分類に失敗しました: {}", e);
                }
                Err(ApiError::from(e))
            }
        }
    }
    .instrument(span)
    .await
}

/// `file` フィールドを探して Content-Type を検証する
async fn read_image_field(multipart: &mut Multipart) -> Result<(&'static str, Vec<u8>), ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let content_type = field.content_type().unwrap_or_default().to_ascii_lowercase();
        let extension = extension_for(&content_type).ok_or_else(|| ApiError::bad_request(INVALID_FORMAT))?;

        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read upload: {}", e)))?;
        return Ok((extension, bytes.to_vec()));
    }

    Err(ApiError::bad_request("Missing file field"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServerSettings;
    use crate::routes::test_support::{json_body, multipart_request};
    use crate::routes::{router, AppState};
    use crate::service::testing::{catalog, png_bytes, FixedProbabilities};
    use crate::model::{DeviceType, InitMode, ModelSettings};
    use crate::service::ClassifierService;
    use crate::error::ClassifierError;
    use axum::http::StatusCode;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(service: ClassifierService, upload_dir: &Path) -> axum::Router {
        let state = Arc::new(AppState::new(Arc::new(service), upload_dir));
        router(state, &ServerSettings::default())
    }

    fn pizza_service() -> ClassifierService {
        ClassifierService::ready(
            Box::new(FixedProbabilities(vec![0.7, 0.2, 0.1])),
            catalog(&["pizza", "sushi", "taco"]),
        )
    }

    fn is_empty_dir(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[test]
    fn test_extension_for() {
        assert_eq!(extension_for("image/jpeg"), Some("jpg"));
        assert_eq!(extension_for("image/jpg"), Some("jpg"));
        assert_eq!(extension_for("image/png"), Some("png"));
        assert_eq!(extension_for("image/gif"), None);
    }

    #[tokio::test]
    async fn test_detect_dish_success_removes_upload() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(pizza_service(), dir.path())
            .oneshot(multipart_request("image/png", "dish.png", &png_bytes()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["dish"], "pizza");
        assert_eq!(body["confidence"], 70.0);
        assert!(is_empty_dir(dir.path()));
    }

    #[tokio::test]
    async fn test_unsupported_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(pizza_service(), dir.path())
            .oneshot(multipart_request("image/gif", "dish.gif", b"GIF89a"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["detail"], INVALID_FORMAT);
        assert!(is_empty_dir(dir.path()));
    }

    #[tokio::test]
    async fn test_undecodable_image_is_client_error() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(pizza_service(), dir.path())
            .oneshot(multipart_request("image/jpeg", "dish.jpg", b"not really a jpeg"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(is_empty_dir(dir.path()));
    }

    #[tokio::test]
    async fn test_not_ready_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let service = ClassifierService::new(
            ModelSettings::default(),
            DeviceType::Cpu,
            InitMode::Eager,
        );
        let response = app(service, dir.path())
            .oneshot(multipart_request("image/png", "dish.png", &png_bytes()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert!(body["detail"].is_string());
        assert!(is_empty_dir(dir.path()));
    }

    #[tokio::test]
    async fn test_config_mismatch_requests_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let service = ClassifierService::with_loader(InitMode::Lazy, || {
            Err(ClassifierError::ConfigMismatch("stale class count".to_string()))
        });
        let state = Arc::new(AppState::new(Arc::new(service), dir.path()));
        let shutdown = state.shutdown.clone();

        let response = router(state, &ServerSettings::default())
            .oneshot(multipart_request("image/png", "dish.png", &png_bytes()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        // 通知は保存されているので待機はすぐに終わる
        tokio::time::timeout(Duration::from_secs(1), shutdown.notified())
            .await
            .unwrap();
        assert!(is_empty_dir(dir.path()));
    }
}
