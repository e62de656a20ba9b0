//! PyTorch (timm) で学習した重みの取り込み
//!
//! timm の `efficientnet_b0` の state dict (.pt / .pth) または safetensors を
//! テンソル名を対応付けながら `FoodClassifier` に読み込みます。
//! Linear の転置と BatchNorm のパラメータ名 (weight/bias -> gamma/beta) は
//! `PyTorchToBurnAdapter` が変換します。

use std::path::Path;

use burn::tensor::backend::Backend;
use burn_store::{
    ApplyResult, KeyRemapper, ModuleSnapshot, PyTorchToBurnAdapter, PytorchStore,
    SafetensorsStore,
};

use crate::error::{ClassifierError, ResourceKind, Result};
use crate::ml::ml_model::{block_layout, FoodClassifier};

/// timm のテンソル名 -> `FoodClassifier` のパラメータパス
///
/// パターンは上から順に適用されます。
pub fn timm_key_patterns() -> Vec<(String, String)> {
    // DataParallel で保存された state dict
    let mut patterns = vec![(r"^module\.".to_string(), String::new())];

    // blocks.<stage>.<index> -> blocks.<通し番号>
    for (flat, (stage, index)) in block_layout().into_iter().enumerate() {
        patterns.push((
            format!(r"^blocks\.{}\.{}\.", stage, index),
            format!("blocks.{}.", flat),
        ));
    }

    let renames = [
        // 先頭ブロックは拡張層なし (conv_dw -> bn1 -> se -> conv_pw -> bn2)
        (r"^blocks\.0\.conv_dw\.", "blocks.0.depthwise.conv."),
        (r"^blocks\.0\.bn1\.", "blocks.0.depthwise.bn."),
        (r"^blocks\.0\.conv_pw\.", "blocks.0.project.conv."),
        (r"^blocks\.0\.bn2\.", "blocks.0.project.bn."),
        (r"^(blocks\.\d+)\.conv_pw\.", "${1}.expand.conv."),
        (r"^(blocks\.\d+)\.bn1\.", "${1}.expand.bn."),
        (r"^(blocks\.\d+)\.conv_dw\.", "${1}.depthwise.conv."),
        (r"^(blocks\.\d+)\.bn2\.", "${1}.depthwise.bn."),
        (r"^(blocks\.\d+)\.conv_pwl\.", "${1}.project.conv."),
        (r"^(blocks\.\d+)\.bn3\.", "${1}.project.bn."),
        (r"\.se\.conv_reduce\.", ".se.reduce."),
        (r"\.se\.conv_expand\.", ".se.expand."),
        (r"^conv_stem\.", "stem.conv."),
        (r"^bn1\.", "stem.bn."),
        (r"^conv_head\.", "head.conv."),
        (r"^bn2\.", "head.bn."),
    ];
    patterns.extend(
        renames
            .iter()
            .map(|(from, to)| (from.to_string(), to.to_string())),
    );

    patterns
}

fn timm_key_remapper() -> Result<KeyRemapper> {
    KeyRemapper::from_pattern_iter(timm_key_patterns())
        .map_err(|e| ClassifierError::Inference(format!("テンソル名の対応表が不正です: {}", e)))
}

fn is_safetensors(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("safetensors"))
        .unwrap_or(false)
}

/// timm 形式の重みファイルをモデルに読み込む
///
/// 分類ヘッドの幅やテンソル形状が合わない場合、欠けているテンソルがある場合は
/// `ConfigMismatch` です。
pub fn import_timm_weights<B: Backend>(
    mut model: FoodClassifier<B>,
    path: &Path,
) -> Result<FoodClassifier<B>> {
    if !path.exists() {
        return Err(ClassifierError::ResourceMissing {
            kind: ResourceKind::Weights,
            path: path.to_path_buf(),
        });
    }

    tracing::info!("timm 形式の重みを読み込みます: {}", path.display());
    let remapper = timm_key_remapper()?;
    let mismatch = |e: String| {
        ClassifierError::ConfigMismatch(format!(
            "重みを取り込めません ({}): {}",
            path.display(),
            e
        ))
    };

    let result: ApplyResult = if is_safetensors(path) {
        let mut store = SafetensorsStore::from_file(path)
            .with_from_adapter(PyTorchToBurnAdapter)
            .remap(remapper)
            .validate(true)
            .allow_partial(false);
        model
            .load_from(&mut store)
            .map_err(|e| mismatch(e.to_string()))?
    } else {
        let mut store = PytorchStore::from_file(path)
            .remap(remapper)
            .validate(true)
            .allow_partial(false);
        model
            .load_from(&mut store)
            .map_err(|e| mismatch(e.to_string()))?
    };

    if !result.unused.is_empty() {
        // num_batches_tracked など推論に使わないテンソル
        tracing::debug!("未使用のテンソル: {:?}", result.unused);
    }
    tracing::info!("{} 個のテンソルを読み込みました", result.applied.len());

    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ml_model::ModelConfig;
    use burn::module::Module;
    use burn::tensor::{Distribution, Tensor};
    use burn_ndarray::{NdArray, NdArrayDevice};
    use burn_store::BurnToPyTorchAdapter;

    type TestBackend = NdArray;

    fn remap(name: &str) -> String {
        let remapper = timm_key_remapper().unwrap();
        let mut name = name.to_string();
        for (pattern, replacement) in &remapper.patterns {
            name = pattern.replace_all(&name, replacement.as_str()).to_string();
        }
        name
    }

    /// `FoodClassifier` のパス -> timm のテンソル名（テスト用の重みファイル作成用）
    fn to_timm_patterns() -> Vec<(String, String)> {
        let mut patterns: Vec<(String, String)> = [
            (r"^blocks\.0\.depthwise\.conv\.", "blocks.0.conv_dw."),
            (r"^blocks\.0\.depthwise\.bn\.", "blocks.0.bn1."),
            (r"^blocks\.0\.project\.conv\.", "blocks.0.conv_pw."),
            (r"^blocks\.0\.project\.bn\.", "blocks.0.bn2."),
            (r"\.se\.reduce\.", ".se.conv_reduce."),
            (r"\.se\.expand\.", ".se.conv_expand."),
            (r"\.expand\.conv\.", ".conv_pw."),
            (r"\.expand\.bn\.", ".bn1."),
            (r"\.depthwise\.conv\.", ".conv_dw."),
            (r"\.depthwise\.bn\.", ".bn2."),
            (r"\.project\.conv\.", ".conv_pwl."),
            (r"\.project\.bn\.", ".bn3."),
            (r"^stem\.conv\.", "conv_stem."),
            (r"^stem\.bn\.", "bn1."),
            (r"^head\.conv\.", "conv_head."),
            (r"^head\.bn\.", "bn2."),
        ]
        .iter()
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .collect();

        for (flat, (stage, index)) in block_layout().into_iter().enumerate() {
            patterns.push((
                format!(r"^blocks\.{}\.", flat),
                format!("blocks.{}.{}.", stage, index),
            ));
        }
        patterns
    }

    fn write_timm_safetensors(model: &FoodClassifier<TestBackend>, path: &Path) {
        let mut store = SafetensorsStore::from_file(path)
            .with_to_adapter(BurnToPyTorchAdapter)
            .remap(KeyRemapper::from_pattern_iter(to_timm_patterns()).unwrap());
        model.save_into(&mut store).unwrap();
    }

    #[test]
    fn test_timm_key_mapping() {
        let cases = [
            ("conv_stem.weight", "stem.conv.weight"),
            ("bn1.running_var", "stem.bn.running_var"),
            ("blocks.0.0.conv_dw.weight", "blocks.0.depthwise.conv.weight"),
            ("blocks.0.0.bn1.weight", "blocks.0.depthwise.bn.weight"),
            ("blocks.0.0.se.conv_reduce.bias", "blocks.0.se.reduce.bias"),
            ("blocks.0.0.conv_pw.weight", "blocks.0.project.conv.weight"),
            ("blocks.0.0.bn2.bias", "blocks.0.project.bn.bias"),
            ("blocks.1.0.conv_pw.weight", "blocks.1.expand.conv.weight"),
            ("blocks.1.0.bn2.running_mean", "blocks.1.depthwise.bn.running_mean"),
            ("blocks.1.1.bn3.bias", "blocks.2.project.bn.bias"),
            ("blocks.5.3.se.conv_expand.bias", "blocks.14.se.expand.bias"),
            ("blocks.6.0.conv_pwl.weight", "blocks.15.project.conv.weight"),
            ("conv_head.weight", "head.conv.weight"),
            ("bn2.weight", "head.bn.weight"),
            ("classifier.weight", "classifier.weight"),
            ("module.conv_stem.weight", "stem.conv.weight"),
        ];

        for (timm, expected) in cases {
            assert_eq!(remap(timm), expected, "{}", timm);
        }
    }

    #[test]
    fn test_import_safetensors_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("food101_efficientnet.safetensors");
        let device = NdArrayDevice::Cpu;

        let trained = ModelConfig::new(3).init::<TestBackend>(&device);
        write_timm_safetensors(&trained, &path);

        let fresh = ModelConfig::new(3).init::<TestBackend>(&device);
        let imported = import_timm_weights(fresh, &path).unwrap();
        assert_eq!(imported.num_params(), trained.num_params());

        let images = Tensor::<TestBackend, 4>::random([1, 3, 64, 64], Distribution::Default, &device);
        let expected = trained
            .forward_probabilities(images.clone())
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        let actual = imported
            .forward_probabilities(images)
            .into_data()
            .to_vec::<f32>()
            .unwrap();

        for (a, e) in actual.iter().zip(&expected) {
            assert!((a - e).abs() < 1e-5, "{} != {}", a, e);
        }
    }

    #[test]
    fn test_import_head_width_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let device = NdArrayDevice::Cpu;

        write_timm_safetensors(&ModelConfig::new(5).init::<TestBackend>(&device), &path);

        let err = import_timm_weights(ModelConfig::new(3).init::<TestBackend>(&device), &path)
            .err()
            .unwrap();
        assert!(matches!(err, ClassifierError::ConfigMismatch(_)));
    }

    #[test]
    fn test_import_missing_file() {
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new(3).init::<TestBackend>(&device);

        let err = import_timm_weights(model, Path::new("/nonexistent/food101_efficientnet.pt"))
            .err()
            .unwrap();
        assert!(matches!(err, ClassifierError::ResourceMissing { .. }));
    }

    #[test]
    fn test_import_corrupt_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("food101_efficientnet.pt");
        std::fs::write(&path, b"not a torch checkpoint").unwrap();

        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new(3).init::<TestBackend>(&device);
        let err = import_timm_weights(model, &path).err().unwrap();
        assert!(matches!(err, ClassifierError::ConfigMismatch(_)));
    }
}
