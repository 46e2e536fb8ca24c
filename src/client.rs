//! 推論エンドポイントのクライアント
//!
//! カメラのフレームまたは画像ファイルを `POST /predict/` に送信してラベルを受け取ります。
//! カメラが使えない場合も、ファイルのアップロード経路はそのまま使えます。

use anyhow::{Context, Result};
use image::RgbImage;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::server::handlers::FILE_FIELD;
use crate::types::{ErrorResponse, PredictResponse};
use crate::video::FrameSource;

const JPEG_QUALITY: u8 = 90;

pub struct PredictClient {
    http: reqwest::Client,
    endpoint: url::Url,
}

impl PredictClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = url::Url::parse(endpoint)
            .with_context(|| format!("エンドポイントURLが不正です: {}", endpoint))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            anyhow::bail!("http / https 以外のエンドポイントには対応していません: {}", endpoint);
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("HTTPクライアントの作成に失敗しました")?;
        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &url::Url {
        &self.endpoint
    }

    /// 画像バイト列をアップロードして推論結果を受け取る
    pub async fn predict_bytes(&self, bytes: Vec<u8>, file_name: &str) -> Result<PredictResponse> {
        let mime = mime_for(file_name);
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime)?;
        let form = reqwest::multipart::Form::new().part(FILE_FIELD, part);

        debug!("POST {} ({})", self.endpoint, file_name);
        let response = self
            .http
            .post(self.endpoint.clone())
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("推論サーバーに接続できません: {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let detail = match response.json::<ErrorResponse>().await {
                Ok(body) => body.detail,
                Err(_) => status
                    .canonical_reason()
                    .unwrap_or("unknown error")
                    .to_string(),
            };
            anyhow::bail!("推論サーバーがエラーを返しました ({}): {}", status, detail);
        }

        response
            .json::<PredictResponse>()
            .await
            .context("推論結果の解析に失敗しました")
    }

    pub async fn predict_file(&self, path: &Path) -> Result<PredictResponse> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("画像ファイルを読み込めません: {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload.bin".to_string());
        self.predict_bytes(bytes, &file_name).await
    }

    /// RGB画像をJPEGに変換して送信
    pub async fn predict_image(&self, img: &RgbImage) -> Result<PredictResponse> {
        self.predict_bytes(encode_jpeg(img)?, "frame.jpg").await
    }
}

fn mime_for(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}

pub fn encode_jpeg(img: &RgbImage) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    img.write_with_encoder(encoder)
        .context("JPEGエンコードに失敗しました")?;
    Ok(out)
}

/// カメラの状態
#[derive(Debug)]
pub enum CameraStatus {
    Ready(RgbImage),
    Unavailable(String),
}

impl fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraStatus::Ready(img) => write!(f, "camera ready ({}x{})", img.width(), img.height()),
            CameraStatus::Unavailable(reason) => write!(f, "camera not available: {}", reason),
        }
    }
}

/// フレームを1枚取得する。失敗しても致命的にはせず、状態として返す
pub fn acquire_frame(source: Option<&mut dyn FrameSource>) -> CameraStatus {
    match source {
        None => CameraStatus::Unavailable("no camera configured".to_string()),
        Some(source) => match source.grab_frame() {
            Ok(frame) => CameraStatus::Ready(frame),
            Err(e) => {
                warn!("{} からフレームを取得できません: {:#}", source.describe(), e);
                CameraStatus::Unavailable(format!("{:#}", e))
            }
        },
    }
}
