//! 画像前処理
//!
//! 画像バイト列 -> RGBデコード -> 短辺256へリサイズ -> 中央224x224切り出し
//! -> [0, 1] スケーリング -> ImageNet統計で正規化。
//! 隠れた状態を持たない純粋関数で、同じ入力からは常に同じテンソルが得られます。

use image::{imageops, imageops::FilterType, RgbImage};

use crate::error::{ClassifierError, Result};
use crate::ml::ml_model::IMAGE_SIZE;

/// リサイズ後の短辺の長さ
pub const RESIZE_SHORTER_EDGE: u32 = 256;

/// 受け付ける長辺/短辺の比の上限
///
/// 短辺256へのリサイズ後の長辺は最大 256 * 32 = 8192 ピクセル。
pub const MAX_ASPECT_RATIO: u32 = 32;

/// ImageNetの平均（RGB）
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNetの標準偏差（RGB）
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 前処理済みの画像テンソル（バッチ次元なし、CHW順に平坦化）
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessedImage {
    data: Vec<f32>,
}

impl PreprocessedImage {
    /// テンソル形状 [C, H, W]
    pub const SHAPE: [usize; 3] = [3, IMAGE_SIZE, IMAGE_SIZE];

    /// CHW順の値から作成（要素数が形状と一致しない場合はNone）
    pub fn from_chw(data: Vec<f32>) -> Option<Self> {
        if data.len() == Self::num_elements() {
            Some(Self { data })
        } else {
            None
        }
    }

    pub fn num_elements() -> usize {
        Self::SHAPE.iter().product()
    }

    pub fn shape(&self) -> [usize; 3] {
        Self::SHAPE
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

/// 画像バイト列を前処理
pub fn preprocess_bytes(bytes: &[u8]) -> Result<PreprocessedImage> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| ClassifierError::Decode(e.to_string()))?;
    preprocess_rgb(&image.to_rgb8())
}

/// RGB画像を前処理
pub fn preprocess_rgb(image: &RgbImage) -> Result<PreprocessedImage> {
    let resized = resize_shorter_edge(image, RESIZE_SHORTER_EDGE)?;
    let cropped = center_crop(&resized, IMAGE_SIZE as u32);
    Ok(PreprocessedImage {
        data: normalize(&cropped),
    })
}

/// アスペクト比を保ったまま短辺を `target` にリサイズ
fn resize_shorter_edge(image: &RgbImage, target: u32) -> Result<RgbImage> {
    let (width, height) = image.dimensions();
    let (new_width, new_height) = scaled_dimensions(width, height, target).ok_or_else(|| {
        ClassifierError::Decode(format!(
            "unsupported image dimensions {}x{} (aspect ratio above {}:1)",
            width, height, MAX_ASPECT_RATIO
        ))
    })?;
    if (new_width, new_height) == (width, height) {
        return Ok(image.clone());
    }
    Ok(imageops::resize(image, new_width, new_height, FilterType::Triangle))
}

/// 短辺を `target` にしたときの寸法（長辺は切り捨て）
///
/// 空の画像や比が `MAX_ASPECT_RATIO` を超える画像はNone。
fn scaled_dimensions(width: u32, height: u32, target: u32) -> Option<(u32, u32)> {
    let (short, long) = (width.min(height) as u64, width.max(height) as u64);
    if short == 0 || long > short * MAX_ASPECT_RATIO as u64 {
        return None;
    }

    let scaled = u32::try_from(target as u64 * long / short).ok()?;
    if width <= height {
        Some((target, scaled))
    } else {
        Some((scaled, target))
    }
}

/// 中央から `size` x `size` を切り出す
fn center_crop(image: &RgbImage, size: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let left = crop_offset(width, size);
    let top = crop_offset(height, size);
    imageops::crop_imm(image, left, top, size, size).to_image()
}

/// `(dim - size) / 2` を偶数丸め（x.5 は偶数側）した切り出し位置
fn crop_offset(dim: u32, size: u32) -> u32 {
    let diff = dim.saturating_sub(size);
    let half = diff / 2;
    if diff % 2 == 1 && half % 2 == 1 {
        half + 1
    } else {
        half
    }
}

/// [0, 1] にスケーリングしてチャネルごとに正規化（CHW順）
fn normalize(image: &RgbImage) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let num_pixels = (width * height) as usize;
    let mut data = vec![0.0f32; 3 * num_pixels];

    for (i, pixel) in image.pixels().enumerate() {
        for channel in 0..3 {
            let value = pixel[channel] as f32 / 255.0;
            data[channel * num_pixels + i] = (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel];
        }
    }

    data
}
