//! 計算デバイスの選択
//!
//! プロセス起動時に一度だけ決定し、以降は切り替えません。

use burn_ndarray::NdArrayDevice;
#[cfg(feature = "wgpu")]
use burn_wgpu::WgpuDevice;

use crate::model::DeviceType;

/// 推論に使用するデバイス
#[derive(Debug, Clone)]
pub enum ComputeDevice {
    #[cfg(feature = "wgpu")]
    Wgpu(WgpuDevice),
    Cpu(NdArrayDevice),
}

impl ComputeDevice {
    pub fn is_accelerated(&self) -> bool {
        !matches!(self, ComputeDevice::Cpu(_))
    }
}

impl std::fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "wgpu")]
            ComputeDevice::Wgpu(device) => write!(f, "WGPU ({:?})", device),
            ComputeDevice::Cpu(_) => write!(f, "CPU (NdArray)"),
        }
    }
}

/// 設定に従ってデバイスを選択
///
/// GPUが要求されても初期化できない場合はCPUにフォールバックします。
pub fn select_device(preference: DeviceType) -> ComputeDevice {
    let device = match preference {
        DeviceType::Cpu => ComputeDevice::Cpu(NdArrayDevice::Cpu),
        DeviceType::Auto | DeviceType::Wgpu => match try_accelerator() {
            Some(device) => device,
            None => {
                if preference == DeviceType::Wgpu {
                    tracing::warn!("GPUを初期化できませんでした。CPUで推論します");
                } else {
                    tracing::info!("GPUが見つかりません。CPUで推論します");
                }
                ComputeDevice::Cpu(NdArrayDevice::Cpu)
            }
        },
    };

    tracing::info!("使用デバイス: {}", device);
    device
}

#[cfg(feature = "wgpu")]
fn try_accelerator() -> Option<ComputeDevice> {
    use burn::backend::Wgpu;
    use burn::tensor::Tensor;

    let device = WgpuDevice::default();
    let check_device = device.clone();

    // アダプタが無い環境ではwgpuの初期化がpanicする
    let check = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
        let tensor = Tensor::<Wgpu, 1>::from_floats([1.0, 2.0, 3.0], &check_device);
        tensor.sum().into_scalar()
    }));

    match check {
        Ok(_) => Some(ComputeDevice::Wgpu(device)),
        Err(_) => None,
    }
}

#[cfg(not(feature = "wgpu"))]
fn try_accelerator() -> Option<ComputeDevice> {
    None
}
