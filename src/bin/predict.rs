//! 推論クライアント
//!
//! `--image` で画像ファイルを送信する。指定がなければカメラのフレームを送信する。
//! カメラが使えない場合は状態を表示し、ファイル送信を案内する。

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use hand_gesture_lib::client::{acquire_frame, CameraStatus, PredictClient};
use hand_gesture_lib::model::AppConfig;
use hand_gesture_lib::video::{CameraCapture, CameraConfig, FrameSource};

#[derive(Parser, Debug)]
#[command(author, version, about = "Send a camera frame or image file to the predict endpoint")]
struct PredictArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// 推論エンドポイント
    #[arg(long, env = "GESTURE_PREDICT_ENDPOINT")]
    endpoint: Option<String>,
    /// 送信する画像ファイル
    #[arg(long)]
    image: Option<PathBuf>,
    /// カメラデバイス
    #[arg(long)]
    device: Option<String>,
    /// カメラから送信するフレーム数
    #[arg(long, default_value_t = 1)]
    frames: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    hand_gesture_lib::init_tracing();
    let args = PredictArgs::parse();
    let config = AppConfig::load_or_default(&args.config);

    let endpoint = args.endpoint.unwrap_or(config.client.endpoint.clone());
    let client = PredictClient::new(&endpoint, Duration::from_secs(config.client.timeout_secs))?;

    if let Some(image) = &args.image {
        let response = client.predict_file(image).await?;
        println!("{} ({:.3})", response.prediction, response.confidence);
        return Ok(());
    }

    let mut camera_config = CameraConfig::from(&config.capture);
    if args.device.is_some() {
        camera_config.device = args.device;
    }

    let mut camera = match CameraCapture::open(&camera_config) {
        Ok(camera) => camera,
        Err(e) => {
            println!("{}", CameraStatus::Unavailable(format!("{:#}", e)));
            anyhow::bail!("カメラが使えません。--image で画像ファイルを指定してください");
        }
    };

    // 各フレームは独立して処理し、失敗したフレームは飛ばす
    for _ in 0..args.frames.max(1) {
        match acquire_frame(Some(&mut camera as &mut dyn FrameSource)) {
            CameraStatus::Ready(frame) => match client.predict_image(&frame).await {
                Ok(response) => println!("{} ({:.3})", response.prediction, response.confidence),
                Err(e) => warn!("推論に失敗しました: {:#}", e),
            },
            status => println!("{}", status),
        }
    }
    Ok(())
}
