//! ジェスチャー分類モデルの共通定義
//!
//! EfficientNet (B0 / B2) のバックボーンと分類ヘッド、および入力画像の前処理を提供します。

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
    },
    tensor::{
        activation::{sigmoid, silu},
        backend::Backend,
        Int, Tensor,
    },
    train::ClassificationOutput,
};
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

/// デフォルトの入力画像サイズ（学習・推論共通）
pub const DEFAULT_IMAGE_SIZE: usize = 224;

/// ImageNetの平均
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNetの標準偏差
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// B0の基本ステージ構成: (expand_ratio, kernel, stride, in, out, repeats)
const BASE_STAGES: [(usize, usize, usize, usize, usize, usize); 7] = [
    (1, 3, 1, 32, 16, 1),
    (6, 3, 2, 16, 24, 2),
    (6, 5, 2, 24, 40, 2),
    (6, 3, 2, 40, 80, 3),
    (6, 5, 1, 80, 112, 3),
    (6, 5, 2, 112, 192, 4),
    (6, 3, 1, 192, 320, 1),
];

const STEM_CHANNELS: usize = 32;
const HEAD_CHANNELS: usize = 1280;
const SE_RATIO: f64 = 0.25;

/// EfficientNetのバリアント
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EfficientNetVariant {
    B0,
    B2,
}

impl Default for EfficientNetVariant {
    fn default() -> Self {
        EfficientNetVariant::B2
    }
}

impl EfficientNetVariant {
    /// 幅方向の係数
    pub fn width_multiplier(&self) -> f64 {
        match self {
            EfficientNetVariant::B0 => 1.0,
            EfficientNetVariant::B2 => 1.1,
        }
    }

    /// 深さ方向の係数
    pub fn depth_multiplier(&self) -> f64 {
        match self {
            EfficientNetVariant::B0 => 1.0,
            EfficientNetVariant::B2 => 1.2,
        }
    }

    /// 分類ヘッド直前のドロップアウト率
    pub fn dropout(&self) -> f64 {
        match self {
            EfficientNetVariant::B0 => 0.2,
            EfficientNetVariant::B2 => 0.3,
        }
    }

    /// チェックポイントファイル名（拡張子なし）
    pub fn file_stem(&self) -> &'static str {
        match self {
            EfficientNetVariant::B0 => "efficient_b0",
            EfficientNetVariant::B2 => "efficient_b2",
        }
    }
}

impl fmt::Display for EfficientNetVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EfficientNetVariant::B0 => write!(f, "efficientnet_b0"),
            EfficientNetVariant::B2 => write!(f, "efficientnet_b2"),
        }
    }
}

impl FromStr for EfficientNetVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        let suffix = normalized
            .strip_prefix("efficientnet_")
            .or_else(|| normalized.strip_prefix("efficient_"))
            .unwrap_or(&normalized);
        match suffix {
            "b0" => Ok(EfficientNetVariant::B0),
            "b2" => Ok(EfficientNetVariant::B2),
            _ => anyhow::bail!("未対応のEfficientNetバリアントです: {}", s),
        }
    }
}

/// チャネル数を幅係数に合わせて8の倍数へ丸める
pub fn round_filters(channels: usize, width: f64) -> usize {
    let divisor = 8usize;
    let scaled = channels as f64 * width;
    let mut rounded = ((scaled + divisor as f64 / 2.0) as usize / divisor) * divisor;
    rounded = rounded.max(divisor);
    if (rounded as f64) < 0.9 * scaled {
        rounded += divisor;
    }
    rounded
}

/// 繰り返し数を深さ係数に合わせて切り上げる
pub fn round_repeats(repeats: usize, depth: f64) -> usize {
    (repeats as f64 * depth).ceil() as usize
}

/// モデル設定
#[derive(Config, Debug)]
pub struct EfficientNetConfig {
    /// バリアント
    pub variant: EfficientNetVariant,
    /// 分類クラス数
    pub num_classes: usize,
}

impl EfficientNetConfig {
    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> EfficientNet<B> {
        let backbone = init_backbone(self.variant, device);
        self.init_with_backbone(backbone, device)
    }

    /// 既存のバックボーンに新しい分類ヘッドを付けて初期化
    ///
    /// ヘッドは常に `num_classes` に合わせて作り直す。
    pub fn init_with_backbone<B: Backend>(
        &self,
        backbone: EfficientNetBackbone<B>,
        device: &B::Device,
    ) -> EfficientNet<B> {
        let features = round_filters(HEAD_CHANNELS, self.variant.width_multiplier());
        EfficientNet {
            backbone,
            dropout: DropoutConfig::new(self.variant.dropout()).init(),
            classifier: LinearConfig::new(features, self.num_classes).init(device),
        }
    }
}

/// バックボーンのみを初期化（事前学習済み重みの読み込み先）
pub fn init_backbone<B: Backend>(
    variant: EfficientNetVariant,
    device: &B::Device,
) -> EfficientNetBackbone<B> {
    let width = variant.width_multiplier();
    let depth = variant.depth_multiplier();

    let stem_channels = round_filters(STEM_CHANNELS, width);
    let stem = ConvBn::new(3, stem_channels, 3, 2, 1, device);

    let mut blocks = Vec::new();
    for (expand_ratio, kernel, stride, in_ch, out_ch, repeats) in BASE_STAGES {
        let in_ch = round_filters(in_ch, width);
        let out_ch = round_filters(out_ch, width);
        for i in 0..round_repeats(repeats, depth) {
            // ステージ先頭のブロックのみストライドとチャネル変更を持つ
            let (block_in, block_stride) = if i == 0 { (in_ch, stride) } else { (out_ch, 1) };
            blocks.push(MBConvBlock::new(
                block_in,
                out_ch,
                expand_ratio,
                kernel,
                block_stride,
                device,
            ));
        }
    }

    let last_channels = round_filters(BASE_STAGES[BASE_STAGES.len() - 1].4, width);
    let head_channels = round_filters(HEAD_CHANNELS, width);

    EfficientNetBackbone {
        stem,
        blocks,
        head: ConvBn::new(last_channels, head_channels, 1, 1, 1, device),
        pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
    }
}

/// Conv + BatchNorm（活性化は呼び出し側）
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B>,
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
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_groups(groups)
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(out_channels).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.norm.forward(self.conv.forward(x))
    }
}

/// Squeeze-and-Excitation
#[derive(Module, Debug)]
pub struct SqueezeExcitation<B: Backend> {
    pool: AdaptiveAvgPool2d,
    reduce: Conv2d<B>,
    expand: Conv2d<B>,
}

impl<B: Backend> SqueezeExcitation<B> {
    fn new(channels: usize, squeezed: usize, device: &B::Device) -> Self {
        Self {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            reduce: Conv2dConfig::new([channels, squeezed], [1, 1]).init(device),
            expand: Conv2dConfig::new([squeezed, channels], [1, 1]).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let scale = self.pool.forward(x.clone());
        let scale = silu(self.reduce.forward(scale));
        let scale = sigmoid(self.expand.forward(scale));
        x * scale
    }
}

/// MBConvブロック（inverted residual + SE）
#[derive(Module, Debug)]
pub struct MBConvBlock<B: Backend> {
    expand: Option<ConvBn<B>>,
    depthwise: ConvBn<B>,
    se: SqueezeExcitation<B>,
    project: ConvBn<B>,
}

impl<B: Backend> MBConvBlock<B> {
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
        let squeezed = ((in_channels as f64 * SE_RATIO) as usize).max(1);

        Self {
            expand,
            depthwise: ConvBn::new(hidden, hidden, kernel, stride, hidden, device),
            se: SqueezeExcitation::new(hidden, squeezed, device),
            project: ConvBn::new(hidden, out_channels, 1, 1, 1, device),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input.clone();
        if let Some(expand) = &self.expand {
            x = silu(expand.forward(x));
        }
        x = silu(self.depthwise.forward(x));
        x = self.se.forward(x);
        x = self.project.forward(x);

        // stride 1 かつ入出力チャネルが同じ場合のみ形状が一致する
        if x.dims() == input.dims() {
            x + input
        } else {
            x
        }
    }
}

/// EfficientNetの特徴抽出部
#[derive(Module, Debug)]
pub struct EfficientNetBackbone<B: Backend> {
    stem: ConvBn<B>,
    blocks: Vec<MBConvBlock<B>>,
    head: ConvBn<B>,
    pool: AdaptiveAvgPool2d,
}

impl<B: Backend> EfficientNetBackbone<B> {
    /// 特徴ベクトルを計算
    ///
    /// - `images`: [batch_size, 3, size, size]
    /// - 戻り値: [batch_size, features]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = silu(self.stem.forward(images));
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = silu(self.head.forward(x));
        let x = self.pool.forward(x);
        x.flatten::<2>(1, 3)
    }
}

/// ジェスチャー分類用EfficientNet
///
/// # アーキテクチャ
/// - Stem: Conv 3x3 stride 2 + BN + SiLU
/// - MBConv x 7ステージ（SE付き）
/// - Head: Conv 1x1 + BN + SiLU + Global Average Pooling
/// - Dropout + FC: features -> num_classes
#[derive(Module, Debug)]
pub struct EfficientNet<B: Backend> {
    backbone: EfficientNetBackbone<B>,
    dropout: Dropout,
    classifier: Linear<B>,
}

impl<B: Backend> EfficientNet<B> {
    /// 順伝播
    ///
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    /// - 戻り値: クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        let features = self.dropout.forward(features);
        self.classifier.forward(features)
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }

    /// 分類ヘッドの出力次元（読み込んだ重みの実際の形状）
    pub fn num_classes(&self) -> usize {
        self.classifier.weight.dims()[1]
    }

    /// バックボーンへの参照
    pub fn backbone(&self) -> &EfficientNetBackbone<B> {
        &self.backbone
    }
}

/// 画像を正規化（サイズが異なる場合はリサイズ）
///
/// ImageNetの平均と標準偏差で正規化し、(C, H, W) の順で平坦化して返します。
pub fn normalize_image(img: &image::RgbImage, size: usize) -> Vec<f32> {
    let size_u32 = size as u32;
    let resized;
    let img = if img.dimensions() != (size_u32, size_u32) {
        resized = image::imageops::resize(img, size_u32, size_u32, FilterType::Triangle);
        &resized
    } else {
        img
    };

    let mut data = Vec::with_capacity(3 * size * size);
    for channel in 0..3 {
        for y in 0..size_u32 {
            for x in 0..size_u32 {
                let pixel = img.get_pixel(x, y);
                let value = pixel[channel] as f32 / 255.0;
                data.push((value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel]);
            }
        }
    }

    data
}

/// 画像ファイルを読み込んで正規化
pub fn load_and_normalize_image(path: &Path, size: usize) -> anyhow::Result<Vec<f32>> {
    let img = image::open(path)?.to_rgb8();
    Ok(normalize_image(&img, size))
}
