//! モデル推論機能

use anyhow::Result;
use std::path::Path;

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder},
    tensor::{activation::softmax, backend::Backend, Tensor},
};
use image::DynamicImage;
use tracing::{debug, info, warn};

use crate::ml::{normalize_image, EfficientNet, EfficientNetConfig, EfficientNetVariant};
use crate::model::{load_checkpoint, ClassMap};
use crate::types::Prediction;

/// 推論エンジン
///
/// 非autodiffバックエンドで動かすため、ドロップアウトは無効、BatchNormは保存済みの統計量を使う。
/// 同じ画像には常に同じ結果を返す。
pub struct InferenceEngine<B: Backend> {
    model: EfficientNet<B>,
    class_map: ClassMap,
    variant: EfficientNetVariant,
    image_size: usize,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// チェックポイント（ディレクトリ / .mpk / バンドル）を読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(
        checkpoint_path: P,
        variant: EfficientNetVariant,
        image_size: usize,
        device: B::Device,
    ) -> Result<Self> {
        let checkpoint = load_checkpoint(checkpoint_path.as_ref(), variant)?;

        let image_size = match &checkpoint.metadata {
            Some(metadata) if metadata.image_size as usize != image_size => {
                warn!(
                    "バンドルの入力サイズ ({}) を使用します (指定: {})",
                    metadata.image_size, image_size
                );
                metadata.image_size as usize
            }
            _ => image_size,
        };

        // モデル初期化（クラス数はクラスマップから）
        let model = EfficientNetConfig::new(checkpoint.variant, checkpoint.class_map.len())
            .init::<B>(&device);

        // モデルの重みを復元
        let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::default();
        let record = recorder
            .load(checkpoint.weights, &device)
            .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
        let model = model.load_record(record);

        info!(
            "推論エンジンを初期化しました: {}, {} クラス ({})",
            checkpoint.variant,
            checkpoint.class_map.len(),
            checkpoint.class_map.labels().join(", ")
        );

        Self::from_model(model, checkpoint.class_map, checkpoint.variant, image_size, device)
    }

    /// 構築済みモデルから推論エンジンを作成
    ///
    /// クラスマップの件数が分類ヘッドの出力次元と一致しない場合はエラー。
    pub fn from_model(
        model: EfficientNet<B>,
        class_map: ClassMap,
        variant: EfficientNetVariant,
        image_size: usize,
        device: B::Device,
    ) -> Result<Self> {
        class_map.ensure_output_dim(model.num_classes())?;
        Ok(Self {
            model,
            class_map,
            variant,
            image_size,
            device,
        })
    }

    /// 単一画像を分類
    pub fn predict(&self, image: &DynamicImage) -> Result<Prediction> {
        let rgb = image.to_rgb8();
        let image_data = normalize_image(&rgb, self.image_size);

        // Tensorに変換 [1, 3, S, S]
        let size = self.image_size;
        let tensor = Tensor::<B, 1>::from_floats(image_data.as_slice(), &self.device)
            .reshape([1, 3, size, size]);

        let probs = softmax(self.model.forward(tensor), 1);
        let probs = probs
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))?;

        // 同値の場合は小さいインデックスを採用
        let (index, confidence) = probs
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (i, p)| match best {
                Some((_, bp)) if bp >= p => best,
                _ => Some((i, p)),
            })
            .ok_or_else(|| anyhow::anyhow!("モデル出力が空です"))?;

        let label = self
            .class_map
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("クラスインデックス {} は範囲外です", index))?
            .to_string();

        debug!("推論結果: {} ({:.3})", label, confidence);
        Ok(Prediction {
            label,
            index,
            confidence,
        })
    }

    /// 画像ファイルを分類
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let image = image::open(image_path.as_ref())?;
        self.predict(&image)
    }

    pub fn class_map(&self) -> &ClassMap {
        &self.class_map
    }

    pub fn variant(&self) -> EfficientNetVariant {
        self.variant
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::training::save_checkpoint;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    const SIZE: usize = 32;

    fn labels() -> ClassMap {
        ClassMap::from_labels(vec!["fist".into(), "palm".into(), "peace".into()])
    }

    fn engine() -> InferenceEngine<TestBackend> {
        let device = NdArrayDevice::Cpu;
        let model = EfficientNetConfig::new(EfficientNetVariant::B0, 3).init::<TestBackend>(&device);
        InferenceEngine::from_model(model, labels(), EfficientNetVariant::B0, SIZE, device).unwrap()
    }

    fn gradient_image() -> DynamicImage {
        DynamicImage::ImageRgb8(image::RgbImage::from_fn(40, 30, |x, y| {
            image::Rgb([(x * 6) as u8, (y * 8) as u8, 128])
        }))
    }

    #[test]
    fn test_predict_is_deterministic() {
        let engine = engine();
        let image = gradient_image();

        let first = engine.predict(&image).unwrap();
        let second = engine.predict(&image).unwrap();

        assert_eq!(first.label, second.label);
        assert_eq!(first.index, second.index);
        assert_eq!(first.confidence, second.confidence);
    }

    #[test]
    fn test_black_image_yields_known_label() {
        let engine = engine();
        let black = DynamicImage::ImageRgb8(image::RgbImage::new(64, 64));

        let prediction = engine.predict(&black).unwrap();

        assert!(!prediction.label.is_empty());
        assert!(prediction.index < 3);
        assert!(engine.class_map().contains_label(&prediction.label));
        assert!(prediction.confidence > 0.0 && prediction.confidence <= 1.0);
    }

    #[test]
    fn test_classify_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        gradient_image().save(&path).unwrap();
        let engine = engine();

        let from_file = engine.classify_image(&path).unwrap();
        let in_memory = engine.predict(&gradient_image()).unwrap();

        assert_eq!(from_file.index, in_memory.index);
        assert!(engine.classify_image(dir.path().join("missing.png")).is_err());
    }

    #[test]
    fn test_class_map_mismatch_fails_fast() {
        let device = NdArrayDevice::Cpu;
        let model = EfficientNetConfig::new(EfficientNetVariant::B0, 2).init::<TestBackend>(&device);

        let result = InferenceEngine::from_model(model, labels(), EfficientNetVariant::B0, SIZE, device);

        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_checkpoint_directory() {
        let dir = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::Cpu;
        let model = EfficientNetConfig::new(EfficientNetVariant::B0, 3).init::<TestBackend>(&device);
        save_checkpoint(&model, EfficientNetVariant::B0, &labels(), dir.path()).unwrap();
        let original =
            InferenceEngine::from_model(model, labels(), EfficientNetVariant::B0, SIZE, device)
                .unwrap();

        let loaded =
            InferenceEngine::<TestBackend>::load(dir.path(), EfficientNetVariant::B0, SIZE, device)
                .unwrap();

        let image = gradient_image();
        let expected = original.predict(&image).unwrap();
        let actual = loaded.predict(&image).unwrap();
        assert_eq!(loaded.class_map(), &labels());
        assert_eq!(actual.label, expected.label);
        assert!((actual.confidence - expected.confidence).abs() < 1e-4);
    }
}
