//! 料理分類モデルの定義
//!
//! EfficientNet-B0 をベースに、分類ヘッドをクラス数に合わせて差し替えたCNNです。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
    },
    tensor::{
        activation::{sigmoid, silu, softmax},
        backend::Backend,
        Tensor,
    },
};

/// アーキテクチャ名（重みアーカイブのメタデータと照合する）
pub const ARCHITECTURE: &str = "efficientnet_b0";

/// モデル入力サイズ
pub const IMAGE_SIZE: usize = 224;

/// ベースアーキテクチャ本来の出力幅（ImageNet）
pub const BASE_NUM_CLASSES: usize = 1000;

/// 分類ヘッド直前の特徴次元
pub const NUM_FEATURES: usize = 1280;

const STEM_CHANNELS: usize = 32;

/// ステージ定義: (拡張率, カーネル, ストライド, 出力チャネル, 繰り返し数)
const STAGES: [(usize, usize, usize, usize, usize); 7] = [
    (1, 3, 1, 16, 1),
    (6, 3, 2, 24, 2),
    (6, 5, 2, 40, 2),
    (6, 3, 2, 80, 3),
    (6, 5, 1, 112, 3),
    (6, 5, 2, 192, 4),
    (6, 3, 1, 320, 1),
];

/// 各ブロックの (ステージ番号, ステージ内の番号)。`blocks` の並び順と一致する
pub fn block_layout() -> Vec<(usize, usize)> {
    STAGES
        .iter()
        .enumerate()
        .flat_map(|(stage, &(_, _, _, _, repeats))| (0..repeats).map(move |index| (stage, index)))
        .collect()
}

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 分類ヘッド前のドロップアウト率（推論時は無効）
    #[config(default = 0.2)]
    pub dropout: f64,
}

impl ModelConfig {
    /// ベースアーキテクチャ（1000クラスのヘッド付き）を初期化
    pub fn init_base<B: Backend>(&self, device: &B::Device) -> FoodClassifier<B> {
        let stem = ConvBn::new(3, STEM_CHANNELS, 3, 2, 1, device);

        let mut blocks = Vec::new();
        let mut in_channels = STEM_CHANNELS;
        for (expand_ratio, kernel, stride, out_channels, repeats) in STAGES {
            for i in 0..repeats {
                // ストライドは各ステージ先頭のブロックのみ
                let stride = if i == 0 { stride } else { 1 };
                blocks.push(MbConvBlock::new(
                    in_channels,
                    out_channels,
                    expand_ratio,
                    kernel,
                    stride,
                    device,
                ));
                in_channels = out_channels;
            }
        }

        let head = ConvBn::new(in_channels, NUM_FEATURES, 1, 1, 1, device);

        tracing::debug!(
            "[Model] {}: ブロック数 {}, 特徴次元 {}",
            ARCHITECTURE,
            blocks.len(),
            NUM_FEATURES
        );

        FoodClassifier {
            stem,
            blocks,
            head,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(self.dropout).init(),
            classifier: LinearConfig::new(NUM_FEATURES, BASE_NUM_CLASSES).init(device),
        }
    }

    /// ベースアーキテクチャを初期化し、分類ヘッドを `num_classes` に差し替える
    pub fn init<B: Backend>(&self, device: &B::Device) -> FoodClassifier<B> {
        assert!(self.num_classes > 0, "クラス数は1以上である必要があります");
        self.init_base(device).with_classifier(self.num_classes, device)
    }
}

/// 畳み込み + BatchNorm（バイアスなし）
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
}

impl<B: Backend> ConvBn<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        let padding = kernel / 2;
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(groups)
            .with_bias(false)
            .init(device);

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

/// Squeeze-and-Excitation
#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    pool: AdaptiveAvgPool2d,
    reduce: Conv2d<B>,
    expand: Conv2d<B>,
}

impl<B: Backend> SqueezeExcite<B> {
    fn new(channels: usize, squeeze_channels: usize, device: &B::Device) -> Self {
        Self {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            reduce: Conv2dConfig::new([channels, squeeze_channels], [1, 1]).init(device),
            expand: Conv2dConfig::new([squeeze_channels, channels], [1, 1]).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let scale = self.pool.forward(x.clone());
        let scale = silu(self.reduce.forward(scale));
        let scale = sigmoid(self.expand.forward(scale));
        // [B, C, 1, 1] を空間方向にブロードキャスト
        x * scale
    }
}

/// MBConv（逆残差ブロック）
#[derive(Module, Debug)]
pub struct MbConvBlock<B: Backend> {
    expand: Option<ConvBn<B>>,
    depthwise: ConvBn<B>,
    se: SqueezeExcite<B>,
    project: ConvBn<B>,
}

impl<B: Backend> MbConvBlock<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        expand_ratio: usize,
        kernel: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expand_ratio;
        let expand = if expand_ratio != 1 {
            Some(ConvBn::new(in_channels, hidden, 1, 1, 1, device))
        } else {
            None
        };
        let squeeze_channels = (in_channels / 4).max(1);

        Self {
            expand,
            depthwise: ConvBn::new(hidden, hidden, kernel, stride, hidden, device),
            se: SqueezeExcite::new(hidden, squeeze_channels, device),
            project: ConvBn::new(hidden, out_channels, 1, 1, 1, device),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => silu(expand.forward(input.clone())),
            None => input.clone(),
        };
        let x = silu(self.depthwise.forward(x));
        let x = self.se.forward(x);
        let x = self.project.forward(x);

        // ストライド1かつチャネル数が同じ場合のみ残差接続
        if x.dims() == input.dims() {
            x + input
        } else {
            x
        }
    }
}

/// 料理分類用CNNモデル
///
/// # アーキテクチャ
/// - Stem: Conv 3x3 stride 2 (3 -> 32) + BN + SiLU
/// - MBConv x 16（7ステージ、SE付き）
/// - Head: Conv 1x1 (320 -> 1280) + BN + SiLU
/// - Global Average Pooling -> Dropout -> FC (1280 -> num_classes)
#[derive(Module, Debug)]
pub struct FoodClassifier<B: Backend> {
    stem: ConvBn<B>,
    blocks: Vec<MbConvBlock<B>>,
    head: ConvBn<B>,
    pool: AdaptiveAvgPool2d,
    dropout: Dropout,
    classifier: Linear<B>,
}

impl<B: Backend> FoodClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, H, W]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = silu(self.stem.forward(images));
        for block in &self.blocks {
            x = block.forward(x);
        }

        let x = silu(self.head.forward(x));
        let x = self.pool.forward(x);

        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        let x = self.dropout.forward(x);
        self.classifier.forward(x)
    }

    /// クラスごとの確率 [batch_size, num_classes]
    pub fn forward_probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 分類ヘッドを新しい出力幅の線形層に差し替える
    pub fn with_classifier(mut self, num_classes: usize, device: &B::Device) -> Self {
        self.classifier = LinearConfig::new(self.num_features(), num_classes).init(device);
        self
    }

    /// 分類ヘッドの入力次元
    pub fn num_features(&self) -> usize {
        self.classifier.weight.val().dims()[0]
    }

    /// 分類ヘッドの出力幅
    pub fn num_classes(&self) -> usize {
        self.classifier.weight.val().dims()[1]
    }
}
