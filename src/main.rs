//! Dish Detector サーバー
//!
//! 料理画像を受け取り、料理名と確信度を返すHTTPサーバーです。

use std::path::PathBuf;

use clap::Parser;
use dish_detector_lib::logging::init_logging;
use dish_detector_lib::model::{AppConfig, DeviceType, InitMode};

/// 料理画像分類サーバー
#[derive(Parser, Debug)]
#[command(name = "dish_detector")]
#[command(version)]
#[command(about = "HTTP server that detects the dish in a food photo")]
struct Cli {
    /// 設定ファイル (JSON)
    #[arg(short, long, env = "DISH_DETECTOR_CONFIG")]
    config: Option<PathBuf>,

    /// 待ち受けホスト
    #[arg(long, env = "DISH_DETECTOR_HOST")]
    host: Option<String>,

    /// 待ち受けポート
    #[arg(short, long, env = "DISH_DETECTOR_PORT")]
    port: Option<u16>,

    /// 重みアーカイブ (.tar.gz)
    #[arg(long, env = "DISH_DETECTOR_WEIGHTS")]
    weights: Option<String>,

    /// クラス名ファイル (1行1クラス)
    #[arg(long, env = "DISH_DETECTOR_LABELS")]
    labels: Option<String>,

    /// 計算デバイス (auto / wgpu / cpu)
    #[arg(long, env = "DISH_DETECTOR_DEVICE")]
    device: Option<DeviceType>,

    /// 最初のリクエストまでモデルの読み込みを遅らせる
    #[arg(long)]
    lazy: bool,

    /// ログレベル (trace / debug / info / warn / error)
    #[arg(long, env = "DISH_DETECTOR_LOG")]
    log_level: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut AppConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(weights) = self.weights {
            config.model.weights_path = weights;
        }
        if let Some(labels) = self.labels {
            config.model.labels_path = labels;
        }
        if let Some(device) = self.device {
            config.device_type = device;
        }
        if self.lazy {
            config.init_mode = InitMode::Lazy;
        }
        if let Some(log_level) = self.log_level {
            config.log_level = log_level;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);

    // ログレベルは設定ファイルにもあるため、先に読んでおく
    let log_level = cli
        .log_level
        .clone()
        .or_else(|| AppConfig::load(&config_path).ok().map(|c| c.log_level))
        .unwrap_or_else(|| "info".to_string());
    init_logging(&log_level)?;

    let mut config = AppConfig::load_or_default(&config_path);
    cli.apply(&mut config);

    if let Err(e) = dish_detector_lib::run(config).await {
        tracing::error!("サーバーを停止します: {:#}", e);
        return Err(e);
    }

    Ok(())
}
