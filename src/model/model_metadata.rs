//! モデルメタデータの定義
//!
//! 重みアーカイブ（tar.gz）内の `metadata.json` に保存され、
//! 読み込み時にアーキテクチャとの整合性チェックに使われます。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// 重みアーカイブのメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetadata {
    /// アーキテクチャ名（例: "efficientnet_b0"）
    pub architecture: String,

    /// 分類ヘッドの出力クラス数
    pub num_classes: usize,

    /// モデル入力サイズ（正方形）
    pub input_size: usize,

    /// 学習時のクラスラベル（任意。空なら記録なし）
    #[serde(default)]
    pub class_labels: Vec<String>,

    /// エクスポート時刻（ISO8601形式）
    pub exported_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        architecture: impl Into<String>,
        num_classes: usize,
        input_size: usize,
        class_labels: Vec<String>,
    ) -> Self {
        Self {
            architecture: architecture.into(),
            num_classes,
            input_size,
            class_labels,
            exported_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_default_to_empty() {
        let json = r#"{
            "architecture": "efficientnet_b0",
            "num_classes": 101,
            "input_size": 224,
            "exported_at": "2024-01-01T00:00:00+00:00"
        }"#;
        let metadata = ModelMetadata::from_json_string(json).unwrap();
        assert_eq!(metadata.num_classes, 101);
        assert!(metadata.class_labels.is_empty());
    }

    #[test]
    fn test_invalid_json_is_error() {
        assert!(ModelMetadata::from_json_string("{\"architecture\": 3}").is_err());
    }
}
