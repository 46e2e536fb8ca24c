//! 推論HTTPサーバー
//!
//! 起動時にチェックポイントとクラスマップを1度だけ読み込む。読み込みに失敗した場合は起動しない。

use anyhow::Result;
use burn::backend::Wgpu;
use burn::tensor::backend::Backend;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::WgpuDevice;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use hand_gesture_lib::ml::{EfficientNetVariant, InferenceEngine};
use hand_gesture_lib::model::{AppConfig, DeviceType};
use hand_gesture_lib::server::{serve, AppState};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the gesture classifier over HTTP")]
struct ServeArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// チェックポイント（ディレクトリ / .mpk / バンドル）
    #[arg(long, env = "GESTURE_CHECKPOINT")]
    checkpoint: Option<PathBuf>,
    /// 待ち受けアドレス（host:port）
    #[arg(long, env = "GESTURE_BIND")]
    bind: Option<String>,
    #[arg(long)]
    variant: Option<EfficientNetVariant>,
    #[arg(long)]
    device: Option<DeviceType>,
    #[arg(long)]
    image_size: Option<usize>,
}

async fn run<B: Backend>(
    config: &AppConfig,
    args: &ServeArgs,
    device: B::Device,
) -> Result<()> {
    let checkpoint = args
        .checkpoint
        .clone()
        .unwrap_or_else(|| config.checkpoint_path().to_path_buf());
    let variant = args.variant.unwrap_or(config.model.variant);
    let image_size = args.image_size.unwrap_or(config.model.image_size);

    info!("チェックポイントを読み込みます: {}", checkpoint.display());
    let engine = InferenceEngine::<B>::load(&checkpoint, variant, image_size, device)?;

    let bind = args
        .bind
        .clone()
        .unwrap_or_else(|| config.server.bind_address());
    serve(&bind, AppState::new(engine), config.server.max_upload_bytes).await
}

#[tokio::main]
async fn main() -> Result<()> {
    hand_gesture_lib::init_tracing();
    let args = ServeArgs::parse();
    let config = AppConfig::load_or_default(&args.config);

    let device_type = args.device.unwrap_or(config.device_type);
    info!("計算デバイス: {}", device_type);

    match device_type {
        DeviceType::Wgpu => run::<Wgpu>(&config, &args, WgpuDevice::default()).await,
        DeviceType::Cpu => run::<NdArray<f32>>(&config, &args, NdArrayDevice::Cpu).await,
    }
}
