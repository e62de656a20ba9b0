//! モデルの構築と重みの読み込み
//!
//! ラベル読み込み -> アーキテクチャ構築 -> 重み読み込み -> デバイス配置を
//! プロセスごとに一度だけ実行するための関数群です。

use std::panic::AssertUnwindSafe;
use std::path::Path;

#[cfg(feature = "wgpu")]
use burn::backend::Wgpu;
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use burn_ndarray::NdArray;

use crate::error::{ClassifierError, Result};
use crate::ml::device::{select_device, ComputeDevice};
use crate::ml::inference::InferenceEngine;
use crate::ml::ml_model::{FoodClassifier, ModelConfig, ARCHITECTURE, IMAGE_SIZE};
use crate::model::{
    load_model_with_metadata, save_model_with_metadata, DeviceType, LabelCatalog, ModelMetadata,
    ModelSettings,
};

type WeightsRecorder = BinBytesRecorder<FullPrecisionSettings>;

/// 重みの読み込み結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightsStatus {
    /// 学習済みの重みを読み込んだ
    Loaded,
    /// 重みファイルが無く、ランダム初期化のまま
    RandomInit,
}

/// 初期化済みのモデル一式
pub struct LoadedModel {
    pub engine: InferenceEngine,
    pub catalog: LabelCatalog,
    pub weights: WeightsStatus,
}

/// アーキテクチャを構築し、分類ヘッドを `num_classes` に合わせる
pub fn build_model<B: Backend>(num_classes: usize, device: &B::Device) -> Result<FoodClassifier<B>> {
    if num_classes == 0 {
        return Err(ClassifierError::ConfigMismatch(
            "クラス数が0です".to_string(),
        ));
    }

    tracing::info!("{} を {} クラスで初期化します", ARCHITECTURE, num_classes);
    Ok(ModelConfig::new(num_classes).init::<B>(device))
}

/// 重みアーカイブを読み込んでモデルに反映する
///
/// ファイルが無い場合は警告のみでランダム初期化のモデルを返します。
/// ファイルがあってもアーキテクチャと整合しない場合は `ConfigMismatch` です。
/// `labels` はラベルファイルのクラス名で、アーカイブに記録されたものと比較します。
pub fn load_weights<B: Backend>(
    model: FoodClassifier<B>,
    weights_path: &Path,
    labels: &[String],
    device: &B::Device,
) -> Result<(FoodClassifier<B>, WeightsStatus)> {
    if !weights_path.exists() {
        tracing::warn!(
            "重みファイルが見つかりません: {}。ランダム初期化のまま使用します",
            weights_path.display()
        );
        return Ok((model, WeightsStatus::RandomInit));
    }

    tracing::info!("重みを読み込みます: {}", weights_path.display());

    let (metadata, model_binary) = load_model_with_metadata(weights_path).map_err(|e| {
        ClassifierError::ConfigMismatch(format!(
            "重みアーカイブを読み込めません ({}): {:#}",
            weights_path.display(),
            e
        ))
    })?;

    let expected_classes = model.num_classes();
    check_metadata(&metadata, expected_classes)?;
    labels_match(&metadata.class_labels, labels);

    let expected_params = model.num_params();
    let recorder = WeightsRecorder::default();
    let record = <WeightsRecorder as Recorder<B>>::load(&recorder, model_binary, device)
        .map_err(|e| ClassifierError::ConfigMismatch(format!("モデル重みの読み込みエラー: {:?}", e)))?;

    let model = std::panic::catch_unwind(AssertUnwindSafe(|| model.load_record(record)))
        .map_err(|_| {
            ClassifierError::ConfigMismatch("重みをモデルに反映できませんでした".to_string())
        })?;

    if model.num_classes() != expected_classes || model.num_params() != expected_params {
        return Err(ClassifierError::ConfigMismatch(format!(
            "重みの形状がアーキテクチャと一致しません: {} クラス / {} パラメータ (期待: {} クラス / {} パラメータ)",
            model.num_classes(),
            model.num_params(),
            expected_classes,
            expected_params
        )));
    }

    Ok((model, WeightsStatus::Loaded))
}

fn check_metadata(metadata: &ModelMetadata, expected_classes: usize) -> Result<()> {
    if metadata.architecture != ARCHITECTURE {
        return Err(ClassifierError::ConfigMismatch(format!(
            "アーキテクチャが一致しません: {} (期待: {})",
            metadata.architecture, ARCHITECTURE
        )));
    }
    if metadata.num_classes != expected_classes {
        return Err(ClassifierError::ConfigMismatch(format!(
            "クラス数が一致しません: 重み {} / ラベル {}",
            metadata.num_classes, expected_classes
        )));
    }
    if metadata.input_size != IMAGE_SIZE {
        return Err(ClassifierError::ConfigMismatch(format!(
            "入力サイズが一致しません: {} (期待: {})",
            metadata.input_size, IMAGE_SIZE
        )));
    }
    Ok(())
}

/// アーカイブのクラス名とラベルファイルを比較する
///
/// 数が同じでも順序や名前が異なると誤った料理名を返すため警告します。
/// どちらかが空の場合は比較しません。
fn labels_match(archived: &[String], catalog: &[String]) -> bool {
    if archived.is_empty() || catalog.is_empty() || archived == catalog {
        return true;
    }

    match archived.iter().zip(catalog).position(|(a, c)| a != c) {
        Some(index) => tracing::warn!(
            "重みのクラス名がラベルファイルと異なります: {} 番目 {:?} (ラベル: {:?})",
            index,
            archived[index],
            catalog[index]
        ),
        None => tracing::warn!(
            "重みのクラス名がラベルファイルと異なります: {} 件 (ラベル: {} 件)",
            archived.len(),
            catalog.len()
        ),
    }
    false
}

fn prepare_model<B: Backend>(
    num_classes: usize,
    weights_path: &Path,
    labels: &[String],
    device: &B::Device,
) -> Result<(FoodClassifier<B>, WeightsStatus)> {
    let model = build_model::<B>(num_classes, device)?;
    load_weights(model, weights_path, labels, device)
}

/// ラベル・モデル・デバイスを初期化する
pub fn initialize_model(settings: &ModelSettings, device_type: DeviceType) -> Result<LoadedModel> {
    let catalog = LabelCatalog::load_or_empty(Path::new(&settings.labels_path))?;
    let num_classes = catalog.model_width(settings.fallback_num_classes);
    let weights_path = Path::new(&settings.weights_path);

    let (engine, weights) = match select_device(device_type) {
        #[cfg(feature = "wgpu")]
        ComputeDevice::Wgpu(device) => {
            let (model, status) = prepare_model::<Wgpu>(num_classes, weights_path, catalog.labels(), &device)?;
            (InferenceEngine::wgpu(model, device), status)
        }
        ComputeDevice::Cpu(device) => {
            let (model, status) = prepare_model::<NdArray>(num_classes, weights_path, catalog.labels(), &device)?;
            (InferenceEngine::cpu(model, device), status)
        }
    };

    tracing::info!("料理分類モデルを読み込みました ({} クラス)", num_classes);

    Ok(LoadedModel {
        engine,
        catalog,
        weights,
    })
}

/// モデルを重みアーカイブとして保存する
pub fn save_weights<B: Backend>(
    model: &FoodClassifier<B>,
    class_labels: Vec<String>,
    output_path: &Path,
) -> Result<()> {
    let recorder = WeightsRecorder::default();
    let model_binary =
        <WeightsRecorder as Recorder<B>>::record(&recorder, model.clone().into_record(), ())
            .map_err(|e| ClassifierError::Inference(format!("モデル重みの書き出しエラー: {:?}", e)))?;

    let metadata = ModelMetadata::new(ARCHITECTURE, model.num_classes(), IMAGE_SIZE, class_labels);
    save_model_with_metadata(output_path, &metadata, &model_binary).map_err(|e| {
        ClassifierError::Io {
            path: output_path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, format!("{:#}", e)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::inference::Inference;
    use burn_ndarray::NdArrayDevice;

    fn settings(dir: &Path) -> ModelSettings {
        ModelSettings {
            weights_path: dir.join("weights.tar.gz").to_string_lossy().to_string(),
            labels_path: dir.join("classes.txt").to_string_lossy().to_string(),
            fallback_num_classes: 101,
        }
    }

    #[test]
    fn test_zero_classes_rejected() {
        let result = build_model::<NdArray>(0, &NdArrayDevice::Cpu);
        assert!(matches!(result, Err(ClassifierError::ConfigMismatch(_))));
    }

    #[test]
    fn test_missing_resources_degrade() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = initialize_model(&settings(dir.path()), DeviceType::Cpu).unwrap();

        assert!(loaded.catalog.is_empty());
        assert_eq!(loaded.weights, WeightsStatus::RandomInit);
        assert_eq!(loaded.engine.num_classes(), 101);
    }

    #[test]
    fn test_class_count_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        std::fs::write(&settings.labels_path, "pizza\nsushi\ntaco\n").unwrap();

        // 5クラス用のメタデータ（重み本体は検査前に弾かれる）
        let metadata = ModelMetadata::new(ARCHITECTURE, 5, IMAGE_SIZE, vec![]);
        save_model_with_metadata(Path::new(&settings.weights_path), &metadata, &[0u8; 16]).unwrap();

        let err = initialize_model(&settings, DeviceType::Cpu).err().unwrap();
        assert!(matches!(err, ClassifierError::ConfigMismatch(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_corrupt_weights_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        std::fs::write(&settings.labels_path, "pizza\nsushi\ntaco\n").unwrap();

        let metadata = ModelMetadata::new(ARCHITECTURE, 3, IMAGE_SIZE, vec![]);
        save_model_with_metadata(Path::new(&settings.weights_path), &metadata, b"garbage").unwrap();

        let err = initialize_model(&settings, DeviceType::Cpu).err().unwrap();
        assert!(matches!(err, ClassifierError::ConfigMismatch(_)));
    }

    #[test]
    fn test_not_an_archive_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        std::fs::write(&settings.weights_path, b"not a tarball").unwrap();

        let err = initialize_model(&settings, DeviceType::Cpu).err().unwrap();
        assert!(matches!(err, ClassifierError::ConfigMismatch(_)));
    }

    #[test]
    fn test_wrong_architecture_is_fatal() {
        let metadata = ModelMetadata::new("resnet50", 3, IMAGE_SIZE, vec![]);
        assert!(matches!(
            check_metadata(&metadata, 3),
            Err(ClassifierError::ConfigMismatch(_))
        ));
    }

    #[test]
    fn test_saved_weights_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.tar.gz");
        let device = NdArrayDevice::Cpu;

        let model = build_model::<NdArray>(3, &device).unwrap();
        save_weights(&model, vec!["pizza".into(), "sushi".into(), "taco".into()], &path).unwrap();

        let fresh = build_model::<NdArray>(3, &device).unwrap();
        let (loaded, status) = load_weights(fresh, &path, &[], &device).unwrap();
        assert_eq!(status, WeightsStatus::Loaded);
        assert_eq!(loaded.num_classes(), 3);

        let original = model.num_params();
        assert_eq!(loaded.num_params(), original);
    }

    #[test]
    fn test_labels_match() {
        fn labels(names: &[&str]) -> Vec<String> {
            names.iter().map(|s| s.to_string()).collect()
        }
        let catalog = labels(&["pizza", "sushi", "taco"]);

        assert!(labels_match(&catalog, &catalog));
        assert!(labels_match(&[], &catalog));
        assert!(labels_match(&catalog, &[]));
        assert!(!labels_match(&labels(&["sushi", "pizza", "taco"]), &catalog));
        assert!(!labels_match(&labels(&["pizza", "sushi"]), &catalog));
    }

    #[test]
    fn test_reordered_labels_still_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.tar.gz");
        let device = NdArrayDevice::Cpu;

        let model = build_model::<NdArray>(3, &device).unwrap();
        save_weights(&model, vec!["taco".into(), "sushi".into(), "pizza".into()], &path).unwrap();

        // 警告のみで読み込みは続行する
        let catalog = vec!["pizza".to_string(), "sushi".to_string(), "taco".to_string()];
        let fresh = build_model::<NdArray>(3, &device).unwrap();
        let (_, status) = load_weights(fresh, &path, &catalog, &device).unwrap();
        assert_eq!(status, WeightsStatus::Loaded);
    }
}
