//! 分類モデルを重みアーカイブとして書き出すツール
//!
//! ラベルファイルのクラス数に合わせたネットワークを構築し、
//! `metadata.json` と `model.bin` を含む tar.gz を作成します。
//! `--from` を指定すると timm で学習した重み (.pt / .pth / .safetensors) を取り込みます。

use std::path::PathBuf;

use burn::module::Module;
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::Parser;
use dish_detector_lib::logging::init_logging;
use dish_detector_lib::ml::{build_model, import_timm_weights, save_weights};
use dish_detector_lib::model::{load_metadata, LabelCatalog, DEFAULT_NUM_CLASSES};

#[derive(Parser, Debug)]
#[command(name = "export_weights")]
#[command(about = "Write a dish detector weights archive")]
struct Cli {
    /// クラス名ファイル (1行1クラス)
    #[arg(long)]
    labels: PathBuf,

    /// 出力先 (.tar.gz)
    #[arg(short, long)]
    output: PathBuf,

    /// ラベルが無い場合のクラス数
    #[arg(long, default_value_t = DEFAULT_NUM_CLASSES)]
    num_classes: usize,

    /// 取り込む timm の重み (.pt / .pth / .safetensors)
    #[arg(long)]
    from: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging("info")?;

    let catalog = LabelCatalog::load_or_empty(&cli.labels)?;
    let num_classes = catalog.model_width(cli.num_classes);

    let device = NdArrayDevice::Cpu;
    let mut model = build_model::<NdArray>(num_classes, &device)?;
    if let Some(source) = &cli.from {
        model = import_timm_weights(model, source)?;
    }
    save_weights(&model, catalog.labels().to_vec(), &cli.output)?;

    // 書き出したアーカイブを読み直して確認
    let metadata = load_metadata(&cli.output)?;
    tracing::info!(
        "重みアーカイブを書き出しました: {} ({} / {} クラス / {} パラメータ / {})",
        cli.output.display(),
        metadata.architecture,
        metadata.num_classes,
        model.num_params(),
        metadata.exported_at
    );
    Ok(())
}
