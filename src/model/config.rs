//! アプリケーション設定管理モジュール
//!
//! 計算デバイスやモデル・ラベルのパス、サーバー設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Food-101のクラス数（ラベルファイルが無い場合のフォールバック）
pub const DEFAULT_NUM_CLASSES: usize = 101;

/// 計算デバイスの指定
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// GPUが使えればWGPU、使えなければCPU
    #[default]
    Auto,
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Auto => write!(f, "Auto"),
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(DeviceType::Auto),
            "wgpu" | "gpu" => Ok(DeviceType::Wgpu),
            "cpu" | "ndarray" => Ok(DeviceType::Cpu),
            other => Err(format!("unknown device type: {}", other)),
        }
    }
}

/// モデル初期化のタイミング
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InitMode {
    /// 起動時に初期化する。初期化前の推論はNotReady
    #[default]
    Eager,
    /// 最初の推論時に初期化する
    Lazy,
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// 重みアーカイブ（tar.gz）のパス
    pub weights_path: String,
    /// クラス名ファイル（1行1ラベル）のパス
    pub labels_path: String,
    /// ラベルファイルが無い場合のクラス数
    #[serde(default = "default_num_classes")]
    pub fallback_num_classes: usize,
}

fn default_num_classes() -> usize {
    DEFAULT_NUM_CLASSES
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            weights_path: "models/food101_efficientnet.tar.gz".to_string(),
            labels_path: "food-101/meta/classes.txt".to_string(),
            fallback_num_classes: DEFAULT_NUM_CLASSES,
        }
    }
}

/// アップロード受付サーバーの設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// アップロード画像の一時保存先
    pub upload_dir: String,
    /// リクエストボディの上限（バイト）
    pub max_upload_bytes: usize,
    /// CORSで許可するオリジン
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            upload_dir: "uploads".to_string(),
            max_upload_bytes: 10 * 1024 * 1024,
            allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// 初期化タイミング
    #[serde(default)]
    pub init_mode: InitMode,
    /// モデル設定
    pub model: ModelSettings,
    /// サーバー設定
    #[serde(default)]
    pub server: ServerSettings,
    /// ログレベル
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceType::default(),
            init_mode: InitMode::default(),
            model: ModelSettings::default(),
            server: ServerSettings::default(),
            log_level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しないか壊れている場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    tracing::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報をログに出力
    pub fn log_summary(&self) {
        tracing::info!("計算デバイス: {}", self.device_type);
        tracing::info!("初期化モード: {:?}", self.init_mode);
        tracing::info!("重みファイル: {}", self.model.weights_path);
        tracing::info!("ラベルファイル: {}", self.model.labels_path);
        tracing::info!("待ち受け: {}:{}", self.server.host, self.server.port);
        tracing::info!("アップロード先: {}", self.server.upload_dir);
    }
}
