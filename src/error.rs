//! 分類パイプラインのエラー定義
//!
//! 起動時の致命的エラーとリクエスト単位のエラーを区別できるようにします。

use std::path::PathBuf;

use thiserror::Error;

/// 欠損したリソースの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Labels,
    Weights,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Labels => write!(f, "labels"),
            ResourceKind::Weights => write!(f, "weights"),
        }
    }
}

/// 分類器のエラー
#[derive(Error, Debug)]
pub enum ClassifierError {
    /// ラベルまたは重みファイルが存在しない（致命的ではない）
    #[error("{kind} resource not found: {}", path.display())]
    ResourceMissing { kind: ResourceKind, path: PathBuf },

    /// 重みとアーキテクチャの不整合（起動時に致命的）
    #[error("model configuration mismatch: {0}")]
    ConfigMismatch(String),

    /// 画像のデコード失敗（クライアント入力エラー）
    #[error("failed to decode image: {0}")]
    Decode(String),

    /// 初期化前に推論が要求された
    #[error("classifier is not initialized yet")]
    NotReady,

    /// 順伝播中の想定外の失敗
    #[error("inference failed: {0}")]
    Inference(String),

    /// 入力ファイルの読み込み失敗
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ClassifierError {
    /// クライアント起因のエラーかどうか
    pub fn is_client_error(&self) -> bool {
        matches!(self, ClassifierError::Decode(_))
    }

    /// 起動を中断すべきエラーかどうか
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClassifierError::ConfigMismatch(_))
    }
}

impl From<image::ImageError> for ClassifierError {
    fn from(e: image::ImageError) -> Self {
        ClassifierError::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClassifierError>;
