//! モデル学習

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use burn::{
    data::dataloader::batcher::Batcher,
    data::dataset::Dataset,
    module::Module,
    record::{DefaultFileRecorder, FullPrecisionSettings},
    tensor::{
        backend::{AutodiffBackend, Backend},
        Int, Tensor,
    },
};
use tracing::{info, warn};

use crate::dataset::{list_class_dirs, list_images};
use crate::ml::{init_backbone, EfficientNet, EfficientNetConfig, EfficientNetVariant};
use crate::model::{save_bundle, ClassMap, ModelMetadata, CLASS_MAP_FILE};

/// 学習データセット（パスのリストのみ保持）
#[derive(Debug, Clone)]
pub struct GestureDataset {
    samples: Vec<(PathBuf, usize)>, // (画像パス, クラスID)
    class_names: Vec<String>,
    // データセット分割用のインデックス範囲
    start_idx: usize,
    end_idx: usize,
}

impl GestureDataset {
    /// ディレクトリから学習データを読み込む
    ///
    /// サブフォルダ名をソートした順にクラスIDを割り当てる。
    /// 読み込めない画像はスキップし、使える画像が1枚もないクラスはエラーにする。
    pub fn from_directory(data_dir: &Path) -> Result<Self> {
        let class_names = list_class_dirs(data_dir)?;
        if class_names.is_empty() {
            anyhow::bail!("クラスディレクトリが見つかりません: {}", data_dir.display());
        }

        let mut samples = Vec::new();
        let mut empty_classes = Vec::new();

        for (class_id, class_name) in class_names.iter().enumerate() {
            let mut count = 0usize;
            for path in list_images(&data_dir.join(class_name))? {
                // ヘッダーだけでなく本体まで復号できたものだけ採用する
                match image::open(&path) {
                    Ok(_) => {
                        samples.push((path, class_id));
                        count += 1;
                    }
                    Err(e) => {
                        warn!("画像を読み込めないためスキップします {}: {}", path.display(), e);
                    }
                }
            }
            info!("  クラス {}: {} ({} 枚)", class_id, class_name, count);
            if count == 0 {
                empty_classes.push(class_name.clone());
            }
        }

        if !empty_classes.is_empty() {
            anyhow::bail!(
                "以下のクラスディレクトリに画像が1枚もありません: {}",
                empty_classes.join(", ")
            );
        }

        let len = samples.len();
        Ok(Self {
            samples,
            class_names,
            start_idx: 0,
            end_idx: len,
        })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// データセットを学習用と検証用に分割（インデックス範囲のみ）
    pub fn split(self, train_ratio: f32, seed: u64) -> (Self, Self) {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let mut samples = self.samples;
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        samples.shuffle(&mut rng);

        let total_len = samples.len();
        let train_len = ((total_len as f32 * train_ratio) as usize).min(total_len);

        let train_dataset = Self {
            samples: samples.clone(),
            class_names: self.class_names.clone(),
            start_idx: 0,
            end_idx: train_len,
        };

        let val_dataset = Self {
            samples,
            class_names: self.class_names,
            start_idx: train_len,
            end_idx: total_len,
        };

        (train_dataset, val_dataset)
    }
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct GestureItem {
    pub path: PathBuf,
    pub label: usize,
}

impl Dataset<GestureItem> for GestureDataset {
    fn get(&self, index: usize) -> Option<GestureItem> {
        let actual_index = self.start_idx + index;
        if actual_index >= self.end_idx {
            return None;
        }

        let (path, label) = self.samples.get(actual_index)?;
        Some(GestureItem {
            path: path.clone(),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.end_idx - self.start_idx
    }
}

/// バッチャー
#[derive(Clone)]
pub struct GestureBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

impl<B: Backend> GestureBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct GestureBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, GestureItem, GestureBatch<B>> for GestureBatcher<B> {
    fn batch(&self, items: Vec<GestureItem>, _device: &B::Device) -> GestureBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut targets_vec = Vec::with_capacity(batch_size);

        for item in items {
            match crate::ml::load_and_normalize_image(&item.path, size) {
                Ok(image_data) => all_pixels.extend_from_slice(&image_data),
                Err(e) => {
                    // スキャン後に壊れたファイルはゼロ画像で埋める
                    warn!("画像読み込み失敗 {}: {}", item.path.display(), e);
                    all_pixels.extend(std::iter::repeat(0.0f32).take(3 * size * size));
                }
            }
            targets_vec.push(item.label as i64);
        }

        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        GestureBatch { images, targets }
    }
}

/// TrainStep実装 (学習時の順伝播 + 逆伝播)
impl<B: AutodiffBackend>
    burn::train::TrainStep<GestureBatch<B>, burn::train::ClassificationOutput<B>>
    for EfficientNet<B>
{
    fn step(
        &self,
        batch: GestureBatch<B>,
    ) -> burn::train::TrainOutput<burn::train::ClassificationOutput<B>> {
        let item = self.forward_classification(batch.images, batch.targets);
        let grads = item.loss.backward();
        burn::train::TrainOutput::new(self, grads, item)
    }
}

/// ValidStep実装 (検証時の順伝播のみ)
impl<B: Backend> burn::train::ValidStep<GestureBatch<B>, burn::train::ClassificationOutput<B>>
    for EfficientNet<B>
{
    fn step(&self, batch: GestureBatch<B>) -> burn::train::ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}

/// 学習オプション
#[derive(Debug, Clone)]
pub struct TrainOptions {
    /// 最終データセット（クラスごとのサブフォルダ）
    pub data_dir: PathBuf,
    /// チェックポイント出力ディレクトリ
    pub checkpoint_dir: PathBuf,
    /// 追加で書き出すバンドル（tar.gz）
    pub bundle_path: Option<PathBuf>,
    /// 事前学習済みバックボーンの重み
    pub pretrained_backbone: Option<PathBuf>,
    pub variant: EfficientNetVariant,
    pub image_size: usize,
    pub num_epochs: usize,
    pub batch_size: usize,
    pub num_workers: usize,
    pub learning_rate: f64,
    pub train_ratio: f32,
    pub seed: u64,
    /// Learnerのアーティファクト出力先
    pub artifact_dir: PathBuf,
}

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub checkpoint_path: PathBuf,
    pub class_map_path: PathBuf,
    pub bundle_path: Option<PathBuf>,
    pub class_names: Vec<String>,
    pub train_samples: usize,
    pub valid_samples: usize,
}

/// チェックポイント（重み + クラスマップ）をディレクトリへ保存
///
/// 重みは `<dir>/<variant>.mpk` に書き出され、そのパスを返す。
pub fn save_checkpoint<B: Backend>(
    model: &EfficientNet<B>,
    variant: EfficientNetVariant,
    class_map: &ClassMap,
    checkpoint_dir: &Path,
) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(checkpoint_dir).with_context(|| {
        format!("チェックポイントディレクトリを作成できません: {}", checkpoint_dir.display())
    })?;

    let stem = checkpoint_dir.join(variant.file_stem());
    // DefaultFileRecorderはf32精度で保存し、拡張子 .mpk を付加する
    model
        .clone()
        .save_file(&stem, &DefaultFileRecorder::<FullPrecisionSettings>::new())
        .map_err(|e| anyhow::anyhow!("モデル重みの保存に失敗しました: {:?}", e))?;

    let class_map_path = checkpoint_dir.join(CLASS_MAP_FILE);
    class_map.save(&class_map_path)?;

    Ok((stem.with_extension("mpk"), class_map_path))
}

/// モデル学習を実行
///
/// 事前学習済みバックボーンがあれば読み込み、分類ヘッドを検出したクラス数で作り直してから
/// 固定エポック数だけ学習する。早期終了は行わない。
pub fn train_model<B: AutodiffBackend>(
    options: &TrainOptions,
    device: B::Device,
) -> Result<TrainingReport> {
    use burn::{
        data::dataloader::DataLoaderBuilder,
        optim::AdamConfig,
        record::BinFileRecorder,
        train::{
            metric::{AccuracyMetric, LossMetric},
            LearnerBuilder, LearningStrategy,
        },
    };

    info!("学習データの読み込み: {}", options.data_dir.display());
    let dataset = GestureDataset::from_directory(&options.data_dir)?;
    let class_map = ClassMap::from_labels(dataset.class_names().to_vec());
    let num_classes = dataset.num_classes();

    let (dataset_train, dataset_val) = dataset.split(options.train_ratio, options.seed);
    let train_samples = dataset_train.len();
    let valid_samples = dataset_val.len();
    if train_samples == 0 {
        anyhow::bail!("学習データが見つかりません");
    }
    info!("学習データ: {} 枚 / 検証データ: {} 枚", train_samples, valid_samples);

    let model_config = EfficientNetConfig::new(options.variant, num_classes);
    info!(
        "モデル設定: {}, {} クラス, 入力サイズ: {}x{}",
        options.variant, num_classes, options.image_size, options.image_size
    );

    let model: EfficientNet<B> = match &options.pretrained_backbone {
        Some(path) => {
            info!("事前学習済みバックボーンを読み込みます: {}", path.display());
            let backbone = init_backbone::<B>(options.variant, &device)
                .load_file(
                    path,
                    &DefaultFileRecorder::<FullPrecisionSettings>::new(),
                    &device,
                )
                .or_else(|_| {
                    init_backbone::<B>(options.variant, &device).load_file(
                        path,
                        &BinFileRecorder::<FullPrecisionSettings>::new(),
                        &device,
                    )
                })
                .map_err(|e| {
                    anyhow::anyhow!(
                        "バックボーン重みの読み込みに失敗しました {}: {:?}",
                        path.display(),
                        e
                    )
                })?;
            model_config.init_with_backbone(backbone, &device)
        }
        None => {
            warn!("事前学習済みバックボーンが指定されていません。ランダム初期化から学習します");
            model_config.init::<B>(&device)
        }
    };

    let batcher_train = GestureBatcher::<B>::new(device.clone(), options.image_size);
    let batcher_val = GestureBatcher::<B::InnerBackend>::new(device.clone(), options.image_size);

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(options.batch_size)
        .shuffle(options.seed)
        .num_workers(options.num_workers)
        .build(dataset_train);

    let dataloader_val = DataLoaderBuilder::new(batcher_val)
        .batch_size(options.batch_size)
        .num_workers(options.num_workers)
        .build(dataset_val);

    std::fs::create_dir_all(&options.artifact_dir)?;
    let artifact_dir_str = options.artifact_dir.to_string_lossy().to_string();

    info!(
        "学習を開始します (エポック数: {}, バッチサイズ: {}, 学習率: {})",
        options.num_epochs, options.batch_size, options.learning_rate
    );

    let learner = LearnerBuilder::new(&artifact_dir_str)
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .learning_strategy(LearningStrategy::SingleDevice(device.clone()))
        .num_epochs(options.num_epochs)
        .summary()
        .build(model, AdamConfig::new().init(), options.learning_rate);

    let model_trained = learner.fit(dataloader_train, dataloader_val);
    info!("学習が完了しました");

    let trained_model = model_trained.model;
    let (checkpoint_path, class_map_path) = save_checkpoint(
        &trained_model,
        options.variant,
        &class_map,
        &options.checkpoint_dir,
    )?;
    info!("チェックポイントを保存しました: {}", checkpoint_path.display());

    let bundle_path = match &options.bundle_path {
        Some(path) => {
            let weights = std::fs::read(&checkpoint_path)?;
            let metadata = ModelMetadata::new(
                options.variant,
                num_classes,
                options.image_size as u32,
                options.num_epochs as u32,
            );
            let written = save_bundle(path, &metadata, &class_map, &weights)?;
            info!("バンドルを保存しました: {}", written.display());
            Some(written)
        }
        None => None,
    };

    Ok(TrainingReport {
        checkpoint_path,
        class_map_path,
        bundle_path,
        class_names: class_map.labels().to_vec(),
        train_samples,
        valid_samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn write_image(path: &Path, value: u8) {
        let img = image::RgbImage::from_pixel(12, 12, image::Rgb([value, value, value]));
        img.save(path).unwrap();
    }

    fn sample_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (class, value) in [("palm", 200u8), ("fist", 20u8)] {
            let class_dir = dir.path().join(class);
            std::fs::create_dir_all(&class_dir).unwrap();
            for i in 0..3 {
                write_image(&class_dir.join(format!("{}_{}.png", class, i)), value);
            }
        }
        dir
    }

    #[test]
    fn test_dataset_sorted_classes_and_skips_unreadable() {
        let dir = sample_tree();
        std::fs::write(dir.path().join("fist").join("broken.jpg"), b"not an image").unwrap();

        // ヘッダーは正しいが本体が途中で切れたPNG
        let noisy = image::RgbImage::from_fn(32, 32, |x, y| {
            image::Rgb([(x * 7 + y * 13) as u8, (x * y) as u8, (x ^ y) as u8 * 8])
        });
        let mut png = std::io::Cursor::new(Vec::new());
        noisy.write_to(&mut png, image::ImageFormat::Png).unwrap();
        let png = png.into_inner();
        let truncated = dir.path().join("palm").join("truncated.png");
        std::fs::write(&truncated, &png[..png.len() / 2]).unwrap();
        assert!(image::image_dimensions(&truncated).is_ok());

        let dataset = GestureDataset::from_directory(dir.path()).unwrap();

        assert_eq!(dataset.class_names(), &["fist".to_string(), "palm".to_string()]);
        assert_eq!(dataset.len(), 6);
        assert!((0..dataset.len())
            .filter_map(|i| dataset.get(i))
            .all(|item| item.path != truncated));
        let item = dataset.get(0).unwrap();
        assert_eq!(item.label, 0);
        assert!(dataset.get(6).is_none());
    }

    #[test]
    fn test_dataset_rejects_empty_class() {
        let dir = sample_tree();
        std::fs::create_dir_all(dir.path().join("thumbs_up")).unwrap();

        let err = GestureDataset::from_directory(dir.path()).unwrap_err();
        assert!(err.to_string().contains("thumbs_up"));
    }

    #[test]
    fn test_split_sizes() {
        let dir = sample_tree();
        let dataset = GestureDataset::from_directory(dir.path()).unwrap();

        let (train, valid) = dataset.split(0.5, 7);

        assert_eq!(train.len(), 3);
        assert_eq!(valid.len(), 3);
        assert!(valid.get(2).is_some());
        assert!(valid.get(3).is_none());
    }

    #[test]
    fn test_batcher_shapes() {
        let dir = sample_tree();
        let dataset = GestureDataset::from_directory(dir.path()).unwrap();
        let device = NdArrayDevice::Cpu;
        let batcher = GestureBatcher::<TestBackend>::new(device, 16);

        let items = (0..4).filter_map(|i| dataset.get(i)).collect::<Vec<_>>();
        let batch = batcher.batch(items, &device);

        assert_eq!(batch.images.dims(), [4, 3, 16, 16]);
        assert_eq!(batch.targets.dims(), [4]);
    }

    #[test]
    fn test_train_step_produces_finite_loss() {
        use burn::train::TrainStep;

        let dir = sample_tree();
        let dataset = GestureDataset::from_directory(dir.path()).unwrap();
        let device = NdArrayDevice::Cpu;
        let batcher = GestureBatcher::<TestAutodiffBackend>::new(device, 32);
        let items = (0..2).filter_map(|i| dataset.get(i)).collect::<Vec<_>>();
        let batch = batcher.batch(items, &device);

        let model = EfficientNetConfig::new(EfficientNetVariant::B0, dataset.num_classes())
            .init::<TestAutodiffBackend>(&device);
        let output = TrainStep::step(&model, batch);

        let loss = output
            .item
            .loss
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap()[0];
        assert!(loss.is_finite());
    }

    #[test]
    fn test_save_checkpoint_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::Cpu;
        let model = EfficientNetConfig::new(EfficientNetVariant::B0, 2).init::<TestBackend>(&device);
        let class_map = ClassMap::from_labels(vec!["fist".into(), "palm".into()]);

        let (weights, map_path) =
            save_checkpoint(&model, EfficientNetVariant::B0, &class_map, dir.path()).unwrap();

        assert_eq!(weights, dir.path().join("efficient_b0.mpk"));
        assert!(weights.exists());
        assert_eq!(ClassMap::load(&map_path).unwrap(), class_map);
    }

    fn tiny_options(root: &Path, data_dir: &Path) -> TrainOptions {
        TrainOptions {
            data_dir: data_dir.to_path_buf(),
            checkpoint_dir: root.join("model"),
            bundle_path: None,
            pretrained_backbone: None,
            variant: EfficientNetVariant::B0,
            image_size: 16,
            num_epochs: 1,
            batch_size: 2,
            num_workers: 1,
            learning_rate: 1e-3,
            train_ratio: 0.5,
            seed: 42,
            artifact_dir: root.join("artifacts"),
        }
    }

    #[test]
    fn test_train_model_writes_checkpoint_and_bundle() {
        use crate::ml::InferenceEngine;
        use crate::model::load_bundle;

        let data = sample_tree();
        let out = tempfile::tempdir().unwrap();
        let mut options = tiny_options(out.path(), data.path());
        options.bundle_path = Some(out.path().join("gesture.tar.gz"));

        let report =
            train_model::<TestAutodiffBackend>(&options, NdArrayDevice::Cpu).unwrap();

        assert_eq!(report.checkpoint_path, options.checkpoint_dir.join("efficient_b0.mpk"));
        assert!(report.checkpoint_path.exists());
        assert!(report.class_map_path.exists());
        assert_eq!(report.class_names, vec!["fist".to_string(), "palm".to_string()]);
        assert_eq!(report.train_samples + report.valid_samples, 6);

        let engine = InferenceEngine::<TestBackend>::load(
            &options.checkpoint_dir,
            EfficientNetVariant::B0,
            16,
            NdArrayDevice::Cpu,
        )
        .unwrap();
        assert_eq!(engine.class_map().labels(), report.class_names.as_slice());

        let bundle = report.bundle_path.unwrap();
        assert!(bundle.exists());
        let (metadata, class_map, weights) = load_bundle(&bundle).unwrap();
        assert_eq!(metadata.variant, EfficientNetVariant::B0);
        assert_eq!(metadata.num_classes, 2);
        assert_eq!(metadata.image_size, 16);
        assert_eq!(class_map.labels(), report.class_names.as_slice());
        assert_eq!(weights, std::fs::read(&report.checkpoint_path).unwrap());
    }

    #[test]
    fn test_train_model_from_pretrained_backbone() {
        use burn::record::BinFileRecorder;

        let data = sample_tree();
        let out = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::Cpu;

        // mpk形式とbin形式のどちらのバックボーンも読み込める
        let mpk_stem = out.path().join("backbone_mpk");
        init_backbone::<TestBackend>(EfficientNetVariant::B0, &device)
            .save_file(&mpk_stem, &DefaultFileRecorder::<FullPrecisionSettings>::new())
            .unwrap();
        let bin_stem = out.path().join("backbone_bin");
        init_backbone::<TestBackend>(EfficientNetVariant::B0, &device)
            .save_file(&bin_stem, &BinFileRecorder::<FullPrecisionSettings>::new())
            .unwrap();

        for backbone in [mpk_stem.with_extension("mpk"), bin_stem.with_extension("bin")] {
            let mut options = tiny_options(out.path(), data.path());
            options.pretrained_backbone = Some(backbone);

            let report = train_model::<TestAutodiffBackend>(&options, device).unwrap();
            assert!(report.checkpoint_path.exists());
            assert!(report.bundle_path.is_none());
        }

        let mut options = tiny_options(out.path(), data.path());
        options.pretrained_backbone = Some(out.path().join("missing.mpk"));
        assert!(train_model::<TestAutodiffBackend>(&options, device).is_err());
    }
}
