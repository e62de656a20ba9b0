//! 画像ファイルを分類するコマンドラインツール

use std::path::PathBuf;

use clap::Parser;
use dish_detector_lib::logging::init_logging;
use dish_detector_lib::model::{AppConfig, DeviceType};
use dish_detector_lib::ClassifierService;

#[derive(Parser, Debug)]
#[command(name = "classify_image")]
#[command(about = "Classify food photos with the dish detector model")]
struct Cli {
    /// 分類する画像
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// 設定ファイル (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 計算デバイス (auto / wgpu / cpu)
    #[arg(long)]
    device: Option<DeviceType>,

    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let mut config = AppConfig::load_or_default(cli.config.unwrap_or_else(AppConfig::default_path));
    if let Some(device) = cli.device {
        config.device_type = device;
    }

    let service = ClassifierService::from_config(&config);
    service.initialize()?;

    let mut failures = 0;
    for path in &cli.images {
        match service.predict(path) {
            Ok(result) => {
                println!("{}\t{}\t{:.2}", path.display(), result.label, result.rounded_confidence());
            }
            Err(e) => {
                eprintln!("{}\t✗ {}", path.display(), e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} 件の画像を分類できませんでした", failures);
    }
    Ok(())
}
