//! 料理分類サービス
//!
//! 前処理 -> 推論 -> ラベル解決をまとめ、モデルの一度きりの初期化を管理します。
//! リクエストハンドラには `Arc<ClassifierService>` として渡します。

use std::path::Path;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use crate::error::{ClassifierError, Result};
use crate::ml::{initialize_model, preprocess_bytes, Inference, PreprocessedImage};
use crate::model::{AppConfig, DeviceType, InitMode, LabelCatalog, ModelSettings};
use crate::types::ClassificationResult;

/// 初期化済みのモデルとラベル
pub struct ModelState {
    engine: Box<dyn Inference>,
    catalog: LabelCatalog,
}

impl ModelState {
    pub fn new(engine: Box<dyn Inference>, catalog: LabelCatalog) -> Self {
        Self { engine, catalog }
    }
}

type Loader = Box<dyn Fn() -> Result<ModelState> + Send + Sync>;

/// 料理分類サービス
pub struct ClassifierService {
    init_mode: InitMode,
    loader: Loader,
    init_lock: Mutex<()>,
    state: OnceLock<ModelState>,
    /// 構成不一致で初期化に失敗した理由（以降は再読み込みしない）
    fatal: OnceLock<String>,
}

impl ClassifierService {
    /// 未初期化のサービスを作成（モデルは `initialize` で読み込む）
    pub fn new(settings: ModelSettings, device_type: DeviceType, init_mode: InitMode) -> Self {
        Self::with_loader(init_mode, move || {
            let loaded = initialize_model(&settings, device_type)?;
            Ok(ModelState::new(Box::new(loaded.engine), loaded.catalog))
        })
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.model.clone(), config.device_type, config.init_mode)
    }

    /// 任意の読み込み処理を使うサービスを作成
    pub fn with_loader<F>(init_mode: InitMode, loader: F) -> Self
    where
        F: Fn() -> Result<ModelState> + Send + Sync + 'static,
    {
        Self {
            init_mode,
            loader: Box::new(loader),
            init_lock: Mutex::new(()),
            state: OnceLock::new(),
            fatal: OnceLock::new(),
        }
    }

    /// 初期化済みのサービスを作成
    pub fn ready(engine: Box<dyn Inference>, catalog: LabelCatalog) -> Self {
        let service = Self::with_loader(InitMode::Eager, || {
            Err(ClassifierError::Inference("loader is not available".to_string()))
        });
        let _ = service.state.set(ModelState::new(engine, catalog));
        service
    }

    /// モデルを初期化する（2回目以降は何もしない）
    ///
    /// 同時に呼ばれても読み込みは一度だけ実行され、
    /// 他の呼び出し元は完了まで待機します。
    /// `ConfigMismatch` で失敗した場合はその結果を保持し、以降は読み込みを再試行しません。
    pub fn initialize(&self) -> Result<()> {
        if let Some(result) = self.settled() {
            return result;
        }

        let _guard = self
            .init_lock
            .lock()
            .map_err(|_| ClassifierError::Inference("initialization lock poisoned".to_string()))?;

        if let Some(result) = self.settled() {
            return result;
        }

        let started = Instant::now();
        let state = match (self.loader)() {
            Ok(state) => state,
            Err(ClassifierError::ConfigMismatch(reason)) => {
                tracing::error!("モデル構成が一致しないため分類器を使用できません: {}", reason);
                let _ = self.fatal.set(reason.clone());
                return Err(ClassifierError::ConfigMismatch(reason));
            }
            Err(e) => return Err(e),
        };
        tracing::info!(
            "分類器の初期化が完了しました ({} クラス, {}, {:.1} ms)",
            state.engine.num_classes(),
            state.engine.device_name(),
            started.elapsed().as_secs_f64() * 1000.0
        );
        let _ = self.state.set(state);
        Ok(())
    }

    /// 初期化済み、または致命的な失敗が確定していればその結果
    fn settled(&self) -> Option<Result<()>> {
        if self.state.get().is_some() {
            return Some(Ok(()));
        }
        self.fatal
            .get()
            .map(|reason| Err(ClassifierError::ConfigMismatch(reason.clone())))
    }

    /// 初期化が構成不一致で失敗していればその理由
    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal.get().map(String::as_str)
    }

    pub fn is_ready(&self) -> bool {
        self.state.get().is_some()
    }

    pub fn num_classes(&self) -> Option<usize> {
        self.state.get().map(|state| state.engine.num_classes())
    }

    pub fn device_name(&self) -> Option<String> {
        self.state.get().map(|state| state.engine.device_name())
    }

    fn state(&self) -> Result<&ModelState> {
        if let Some(state) = self.state.get() {
            return Ok(state);
        }
        if self.init_mode == InitMode::Lazy || self.fatal.get().is_some() {
            self.initialize()?;
        }
        self.state.get().ok_or(ClassifierError::NotReady)
    }

    /// 前処理済み画像のクラス確率
    pub fn classify(&self, image: &PreprocessedImage) -> Result<Vec<f32>> {
        self.state()?.engine.classify(image)
    }

    /// 画像ファイルを分類
    pub fn predict(&self, image_path: &Path) -> Result<ClassificationResult> {
        let state = self.state()?;
        let bytes = std::fs::read(image_path).map_err(|source| ClassifierError::Io {
            path: image_path.to_path_buf(),
            source,
        })?;
        Self::run(state, &bytes)
    }

    /// メモリ上の画像を分類
    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<ClassificationResult> {
        Self::run(self.state()?, bytes)
    }

    fn run(state: &ModelState, bytes: &[u8]) -> Result<ClassificationResult> {
        let started = Instant::now();
        let image = preprocess_bytes(bytes)?;
        let probabilities = state.engine.classify(&image)?;
        let result = top1(&probabilities, &state.catalog)?;

        tracing::debug!(
            "分類結果: {} ({:.2}%) {:.1} ms",
            result.label,
            result.confidence,
            started.elapsed().as_secs_f64() * 1000.0
        );
        Ok(result)
    }
}

/// 最大確率のクラスを選ぶ（同値の場合は小さいインデックスを優先）
pub fn top1(probabilities: &[f32], catalog: &LabelCatalog) -> Result<ClassificationResult> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &probability) in probabilities.iter().enumerate() {
        match best {
            Some((_, best_probability)) if probability <= best_probability => {}
            _ if probability.is_nan() => {}
            _ => best = Some((index, probability)),
        }
    }

    let (index, probability) = best.ok_or_else(|| {
        ClassifierError::Inference("確率ベクトルが空または不正です".to_string())
    })?;

    Ok(ClassificationResult::new(
        catalog.lookup(index),
        probability as f64 * 100.0,
    ))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    /// 固定の確率を返す推論
    pub struct FixedProbabilities(pub Vec<f32>);

    impl Inference for FixedProbabilities {
        fn classify(&self, image: &PreprocessedImage) -> Result<Vec<f32>> {
            assert_eq!(image.shape(), PreprocessedImage::SHAPE);
            Ok(self.0.clone())
        }

        fn num_classes(&self) -> usize {
            self.0.len()
        }

        fn device_name(&self) -> String {
            "fixed".to_string()
        }
    }

    pub fn catalog(labels: &[&str]) -> LabelCatalog {
        LabelCatalog::new(labels.iter().map(|s| s.to_string()).collect())
    }

    pub fn png_bytes() -> Vec<u8> {
        let image = RgbImage::from_pixel(320, 240, Rgb([200, 120, 40]));
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }
}
