use anyhow::{Context, Result};
use gstreamer::prelude::*;
use gstreamer::{self as gst, ElementFactory};
use gstreamer_app::AppSink;
use image::RgbImage;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::model::CaptureSettings;

// 行ごとの stride を持つ RGB プレーンから連続したバイト列を作成して返す。
// 不足している行はゼロ埋めする。
fn plane_to_contiguous_rgb(width: usize, height: usize, stride: usize, src: &[u8]) -> Vec<u8> {
    let row_bytes = width * 3;
    if stride == row_bytes && src.len() >= row_bytes * height {
        return src[..row_bytes * height].to_vec();
    }

    let mut out = Vec::with_capacity(row_bytes * height);
    for row in 0..height {
        let start = row * stride;
        let end = start + row_bytes;
        if end <= src.len() {
            out.extend_from_slice(&src[start..end]);
        } else if start < src.len() {
            out.extend_from_slice(&src[start..]);
            out.extend(std::iter::repeat(0).take(end - src.len()));
        } else {
            out.extend(std::iter::repeat(0).take(row_bytes));
        }
    }
    out
}

fn sample_to_image(sample: &gst::Sample) -> Result<RgbImage> {
    let buffer = sample.buffer().context("バッファの取得に失敗しました")?;
    let caps = sample.caps().context("capsの取得に失敗しました")?;
    let video_info =
        gstreamer_video::VideoInfo::from_caps(caps).context("VideoInfoの作成に失敗しました")?;
    let map = buffer
        .map_readable()
        .map_err(|_| anyhow::anyhow!("バッファのマップに失敗しました"))?;

    let width = video_info.width();
    let height = video_info.height();
    let stride = video_info
        .stride()
        .first()
        .copied()
        .filter(|s| *s > 0)
        .map(|s| s as usize)
        .unwrap_or(width as usize * 3);

    let contiguous = plane_to_contiguous_rgb(width as usize, height as usize, stride, map.as_slice());
    RgbImage::from_raw(width, height, contiguous).context("RgbImageの作成に失敗しました")
}

/// フレームの供給元
///
/// カメラがない環境でも呼び出し側が縮退動作できるよう、取得失敗はエラーとして返す。
pub trait FrameSource {
    fn grab_frame(&mut self) -> Result<RgbImage>;

    fn describe(&self) -> String {
        "frame source".to_string()
    }
}

/// カメラ設定
#[derive(Debug, Clone)]
pub struct CameraConfig {
    /// v4l2デバイスパス（None なら autovideosrc）
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    /// 1フレーム取得の待ち時間
    pub frame_timeout: Duration,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: None,
            width: 640,
            height: 480,
            frame_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&CaptureSettings> for CameraConfig {
    fn from(settings: &CaptureSettings) -> Self {
        Self {
            device: settings.device.clone(),
            width: settings.width,
            height: settings.height,
            ..Self::default()
        }
    }
}

impl CameraConfig {
    /// パイプラインの説明文字列（gst-launch 形式）
    pub fn pipeline_description(&self) -> String {
        let source = match &self.device {
            Some(device) => format!("v4l2src device={}", device),
            None => "autovideosrc".to_string(),
        };
        format!(
            "{} ! videoconvert ! videoscale ! video/x-raw,format=RGB,width={},height={} ! appsink",
            source, self.width, self.height
        )
    }
}

/// GStreamer によるカメラ入力
///
/// appsink は最新の1フレームのみ保持する。破棄時にパイプラインを停止する。
pub struct CameraCapture {
    pipeline: gst::Pipeline,
    appsink: AppSink,
    config: CameraConfig,
}

impl CameraCapture {
    pub fn open(config: &CameraConfig) -> Result<Self> {
        gst::init().context("GStreamerの初期化に失敗しました")?;

        let pipeline = gst::Pipeline::default();

        let source = match &config.device {
            Some(device) => ElementFactory::make("v4l2src")
                .name("source")
                .property("device", device.as_str())
                .build()
                .context("v4l2srcの作成に失敗しました")?,
            None => ElementFactory::make("autovideosrc")
                .name("source")
                .build()
                .context("autovideosrcの作成に失敗しました")?,
        };

        let videoconvert = ElementFactory::make("videoconvert")
            .name("converter")
            .build()
            .context("videoconvertの作成に失敗しました")?;

        let videoscale = ElementFactory::make("videoscale")
            .name("scaler")
            .build()
            .context("videoscaleの作成に失敗しました")?;

        let appsink = AppSink::builder()
            .name("sink")
            .caps(
                &gst::Caps::builder("video/x-raw")
                    .field("format", "RGB")
                    .field("width", config.width as i32)
                    .field("height", config.height as i32)
                    .build(),
            )
            .build();
        appsink.set_property("sync", false);
        appsink.set_property("max-buffers", 1u32);
        appsink.set_property("drop", true);

        pipeline
            .add_many([&source, &videoconvert, &videoscale, appsink.upcast_ref()])
            .context("エレメントの追加に失敗しました")?;
        source
            .link(&videoconvert)
            .context("sourceとconverterのリンクに失敗しました")?;
        videoconvert
            .link(&videoscale)
            .context("converterとscalerのリンクに失敗しました")?;
        videoscale
            .link(&appsink)
            .context("scalerとsinkのリンクに失敗しました")?;

        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            pipeline.set_state(gst::State::Null).ok();
            anyhow::bail!("カメラを開始できません ({}): {}", config.pipeline_description(), e);
        }

        // デバイスが存在しない場合はここで失敗する
        let (state_result, _, _) = pipeline.state(gst::ClockTime::from_seconds(5));
        if let Err(e) = state_result {
            pipeline.set_state(gst::State::Null).ok();
            anyhow::bail!("カメラを開始できません ({}): {}", config.pipeline_description(), e);
        }

        info!("カメラを開きました: {}", config.pipeline_description());
        Ok(Self {
            pipeline,
            appsink,
            config: config.clone(),
        })
    }

    /// 最新フレームを1枚取得
    pub fn grab_frame(&mut self) -> Result<RgbImage> {
        let bus = self.pipeline.bus().context("パイプラインにバスがありません")?;
        let deadline = Instant::now() + self.config.frame_timeout;

        loop {
            while let Some(msg) = bus.pop() {
                use gst::MessageView;
                match msg.view() {
                    MessageView::Eos(..) => anyhow::bail!("カメラストリームが終了しました"),
                    MessageView::Error(err) => anyhow::bail!(
                        "カメラエラー: {} (デバッグ情報: {:?})",
                        err.error(),
                        err.debug()
                    ),
                    _ => {}
                }
            }

            if let Some(sample) = self
                .appsink
                .try_pull_sample(gst::ClockTime::from_mseconds(100))
            {
                let img = sample_to_image(&sample)?;
                debug!("フレーム取得: {}x{}", img.width(), img.height());
                return Ok(img);
            }

            if Instant::now() >= deadline {
                anyhow::bail!("フレーム取得がタイムアウトしました");
            }
        }
    }
}

impl FrameSource for CameraCapture {
    fn grab_frame(&mut self) -> Result<RgbImage> {
        CameraCapture::grab_frame(self)
    }

    fn describe(&self) -> String {
        self.config.pipeline_description()
    }
}

impl Drop for CameraCapture {
    fn drop(&mut self) {
        self.pipeline.set_state(gst::State::Null).ok();
        debug!("カメラパイプラインを停止しました");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_when_stride_matches() {
        let src: Vec<u8> = (0..12).collect();
        assert_eq!(plane_to_contiguous_rgb(2, 2, 6, &src), src);
    }

    #[test]
    fn test_padded_stride_is_removed() {
        // 幅1ピクセル（3バイト）に対し stride 4
        let src = vec![1, 2, 3, 0, 4, 5, 6, 0];
        assert_eq!(plane_to_contiguous_rgb(1, 2, 4, &src), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_short_buffer_is_zero_filled() {
        let src = vec![1, 2, 3, 0, 4];
        assert_eq!(
            plane_to_contiguous_rgb(1, 3, 4, &src),
            vec![1, 2, 3, 4, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_pipeline_description() {
        let config = CameraConfig {
            device: Some("/dev/video2".to_string()),
            width: 320,
            height: 240,
            ..CameraConfig::default()
        };
        assert_eq!(
            config.pipeline_description(),
            "v4l2src device=/dev/video2 ! videoconvert ! videoscale ! video/x-raw,format=RGB,width=320,height=240 ! appsink"
        );
        assert!(CameraConfig::default()
            .pipeline_description()
            .starts_with("autovideosrc !"));
    }
}
