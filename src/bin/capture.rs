//! カメラからジェスチャー画像を撮影し、クラスごとのフォルダへ保存する

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use hand_gesture_lib::capture::CaptureSession;
use hand_gesture_lib::model::AppConfig;
use hand_gesture_lib::video::{CameraCapture, CameraConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Capture labeled hand-gesture images from a camera")]
struct CaptureArgs {
    /// 設定ファイル
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// v4l2 デバイス（例: /dev/video0）。未指定なら autovideosrc
    #[arg(long)]
    device: Option<String>,
    /// 保存先（raw データセット）
    #[arg(long)]
    out: Option<PathBuf>,
    /// 撮影するラベル（カンマ区切り）
    #[arg(long, value_delimiter = ',')]
    labels: Vec<String>,
    /// 保存形式（png / jpg）
    #[arg(long)]
    format: Option<String>,
}

fn main() -> Result<()> {
    hand_gesture_lib::init_tracing();
    let args = CaptureArgs::parse();
    let config = AppConfig::load_or_default(&args.config);

    let mut settings = config.capture.clone();
    if args.device.is_some() {
        settings.device = args.device;
    }
    if !args.labels.is_empty() {
        settings.labels = args.labels;
    }
    if let Some(format) = args.format {
        settings.image_format = format;
    }
    let raw_dir = args.out.unwrap_or(config.dataset.raw_dir);

    let session = CaptureSession::new(&raw_dir, settings.labels.clone(), &settings.image_format)?;
    let mut camera = CameraCapture::open(&CameraConfig::from(&settings))?;

    let stdin = std::io::stdin();
    session.run(&mut camera, stdin.lock(), std::io::stdout())?;
    Ok(())
}
