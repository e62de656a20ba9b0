//! モデル推論機能

use std::panic::AssertUnwindSafe;
use std::sync::Mutex;

#[cfg(feature = "wgpu")]
use burn::backend::Wgpu;
use burn::tensor::{backend::Backend, Tensor, TensorData};
use burn_ndarray::{NdArray, NdArrayDevice};
#[cfg(feature = "wgpu")]
use burn_wgpu::WgpuDevice;

use crate::error::{ClassifierError, Result};
use crate::ml::device::ComputeDevice;
use crate::ml::ml_model::FoodClassifier;
use crate::ml::preprocess::PreprocessedImage;

/// 前処理済み画像からクラス確率を求める
pub trait Inference: Send + Sync {
    /// クラスごとの確率（合計1.0、長さ = `num_classes()`）
    fn classify(&self, image: &PreprocessedImage) -> Result<Vec<f32>>;

    /// 分類ヘッドの出力幅
    fn num_classes(&self) -> usize;

    /// 推論デバイス名
    fn device_name(&self) -> String;
}

enum BackendModel {
    #[cfg(feature = "wgpu")]
    Wgpu {
        model: FoodClassifier<Wgpu>,
        device: WgpuDevice,
    },
    Cpu {
        model: FoodClassifier<NdArray>,
        device: NdArrayDevice,
    },
}

/// 推論エンジン
///
/// 読み込み済みのモデルを保持し、順伝播は1つずつ直列に実行します。
pub struct InferenceEngine {
    model: Mutex<BackendModel>,
    num_classes: usize,
    device: ComputeDevice,
}

impl InferenceEngine {
    /// CPU (NdArray) 上のモデルから作成
    pub fn cpu(model: FoodClassifier<NdArray>, device: NdArrayDevice) -> Self {
        let num_classes = model.num_classes();
        Self {
            model: Mutex::new(BackendModel::Cpu {
                model,
                device: device.clone(),
            }),
            num_classes,
            device: ComputeDevice::Cpu(device),
        }
    }

    /// WGPU上のモデルから作成
    #[cfg(feature = "wgpu")]
    pub fn wgpu(model: FoodClassifier<Wgpu>, device: WgpuDevice) -> Self {
        let num_classes = model.num_classes();
        Self {
            model: Mutex::new(BackendModel::Wgpu {
                model,
                device: device.clone(),
            }),
            num_classes,
            device: ComputeDevice::Wgpu(device),
        }
    }

    pub fn device(&self) -> &ComputeDevice {
        &self.device
    }
}

impl Inference for InferenceEngine {
    fn classify(&self, image: &PreprocessedImage) -> Result<Vec<f32>> {
        let guard = self
            .model
            .lock()
            .map_err(|_| ClassifierError::Inference("model lock poisoned".to_string()))?;

        let probabilities = match &*guard {
            #[cfg(feature = "wgpu")]
            BackendModel::Wgpu { model, device } => run_forward(model, device, image)?,
            BackendModel::Cpu { model, device } => run_forward(model, device, image)?,
        };
        drop(guard);

        if probabilities.len() != self.num_classes {
            return Err(ClassifierError::Inference(format!(
                "出力幅が不正です: {} (期待: {})",
                probabilities.len(),
                self.num_classes
            )));
        }

        Ok(probabilities)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn device_name(&self) -> String {
        self.device.to_string()
    }
}

/// 1枚の画像をバッチ化して順伝播し、softmax確率を返す
///
/// 推論用バックエンドはautodiffを持たないため、勾配は追跡されず
/// Dropoutは無効、BatchNormは移動統計を使用します。
fn run_forward<B: Backend>(
    model: &FoodClassifier<B>,
    device: &B::Device,
    image: &PreprocessedImage,
) -> Result<Vec<f32>> {
    let [channels, height, width] = image.shape();

    // バックエンド内部の失敗はpanicとして現れるため、ここでエラーに変換する
    let output = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let data = TensorData::new(image.as_slice().to_vec(), [1, channels, height, width]);
        let input = Tensor::<B, 4>::from_data(data, device);
        model.forward_probabilities(input).into_data()
    }))
    .map_err(|panic| ClassifierError::Inference(panic_message(panic.as_ref())))?;

    output
        .to_vec::<f32>()
        .map_err(|e| ClassifierError::Inference(format!("推論結果の取得エラー: {:?}", e)))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "forward pass panicked".to_string()
    }
}
