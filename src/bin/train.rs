//! 最終データセットで EfficientNet を学習し、チェックポイントを保存する

use anyhow::Result;
use burn::backend::{Autodiff, Wgpu};
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::WgpuDevice;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use hand_gesture_lib::ml::{train_model, EfficientNetVariant, TrainOptions};
use hand_gesture_lib::model::{AppConfig, DeviceType};

#[derive(Parser, Debug)]
#[command(author, version, about = "Fine-tune an EfficientNet gesture classifier")]
struct TrainArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// 学習データ（クラスごとのサブフォルダ）
    #[arg(long)]
    data: Option<PathBuf>,
    /// チェックポイント出力ディレクトリ
    #[arg(long)]
    out: Option<PathBuf>,
    /// b0 / b2
    #[arg(long)]
    variant: Option<EfficientNetVariant>,
    /// wgpu / cpu
    #[arg(long)]
    device: Option<DeviceType>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long)]
    image_size: Option<usize>,
    /// 事前学習済みバックボーンの重み
    #[arg(long)]
    pretrained: Option<PathBuf>,
    /// 追加で書き出すバンドル（tar.gz）
    #[arg(long)]
    bundle: Option<PathBuf>,
}

fn main() -> Result<()> {
    hand_gesture_lib::init_tracing();
    let args = TrainArgs::parse();
    let config = AppConfig::load_or_default(&args.config);
    config.display();

    let training = &config.training;
    let options = TrainOptions {
        data_dir: args.data.unwrap_or_else(|| config.dataset.final_dir.clone()),
        checkpoint_dir: args.out.unwrap_or_else(|| config.model.checkpoint_dir.clone()),
        bundle_path: args.bundle.or_else(|| training.bundle_path.clone()),
        pretrained_backbone: args
            .pretrained
            .or_else(|| config.model.pretrained_backbone.clone()),
        variant: args.variant.unwrap_or(config.model.variant),
        image_size: args.image_size.unwrap_or(config.model.image_size),
        num_epochs: args.epochs.unwrap_or(training.num_epochs),
        batch_size: args.batch_size.unwrap_or(training.batch_size),
        num_workers: training.num_workers,
        learning_rate: args.learning_rate.unwrap_or(training.learning_rate),
        train_ratio: training.train_ratio,
        seed: training.seed,
        artifact_dir: training.artifact_dir.clone(),
    };

    let device_type = args.device.unwrap_or(config.device_type);
    info!("計算デバイス: {}", device_type);

    let report = match device_type {
        DeviceType::Wgpu => {
            train_model::<Autodiff<Wgpu>>(&options, WgpuDevice::default())?
        }
        DeviceType::Cpu => {
            train_model::<Autodiff<NdArray<f32>>>(&options, NdArrayDevice::Cpu)?
        }
    };

    println!("weights:   {}", report.checkpoint_path.display());
    println!("class map: {}", report.class_map_path.display());
    if let Some(bundle) = &report.bundle_path {
        println!("bundle:    {}", bundle.display());
    }
    println!(
        "classes:   {} ({} train / {} valid images)",
        report.class_names.join(", "),
        report.train_samples,
        report.valid_samples
    );
    Ok(())
}
