//! 推論HTTPサーバー
//!
//! - `GET /`          ヘルスチェック
//! - `POST /predict/` multipart の `file` フィールドで画像を受け取り、分類結果を返す

pub mod error;
pub mod handlers;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use burn::tensor::backend::Backend;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::ml::InferenceEngine;

pub use error::PredictError;

/// 起動時に1度だけ読み込んだ推論エンジンを共有する
pub struct AppState<B: Backend> {
    pub engine: Arc<Mutex<InferenceEngine<B>>>,
}

impl<B: Backend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<B: Backend> AppState<B> {
    pub fn new(engine: InferenceEngine<B>) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
        }
    }
}

pub fn router<B: Backend>(state: AppState<B>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/predict/", post(handlers::predict::<B>))
        .route("/predict", post(handlers::predict::<B>))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 受付済みのリスナーでサーバーを動かし、`shutdown` が完了したら停止する
pub async fn serve_on<B, F>(
    listener: TcpListener,
    state: AppState<B>,
    max_upload_bytes: usize,
    shutdown: F,
) -> Result<()>
where
    B: Backend,
    F: Future<Output = ()> + Send + 'static,
{
    info!("listening on {}", listener.local_addr()?);
    let app = router(state, max_upload_bytes);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("サーバーの実行に失敗しました")?;
    Ok(())
}

/// アドレスにバインドしてサーバーを起動し、Ctrl-C で停止する
pub async fn serve<B: Backend>(
    bind_address: &str,
    state: AppState<B>,
    max_upload_bytes: usize,
) -> Result<()> {
    let listener = TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("アドレスにバインドできません: {}", bind_address))?;

    serve_on(listener, state, max_upload_bytes, shutdown_signal()).await?;
    info!("サーバーを停止しました。推論エンジンを解放します");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("停止シグナルを受信しました"),
        Err(e) => error!("シグナルの待ち受けに失敗しました: {}", e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ml::{EfficientNetConfig, EfficientNetVariant};
    use crate::model::ClassMap;
    use crate::types::{ErrorResponse, HealthResponse, PredictResponse};
    use axum::{
        body::Body,
        http::{header, Method, Request, StatusCode},
    };
    use burn_ndarray::{NdArray, NdArrayDevice};
    use http_body_util::BodyExt; // for `collect`
    use tower::ServiceExt; // for `oneshot`

    pub(crate) type TestBackend = NdArray<f32>;

    const BOUNDARY: &str = "gesture-test-boundary";

    pub(crate) fn test_state() -> AppState<TestBackend> {
        let device = NdArrayDevice::Cpu;
        let model = EfficientNetConfig::new(EfficientNetVariant::B0, 3).init::<TestBackend>(&device);
        let labels = ClassMap::from_labels(vec!["fist".into(), "palm".into(), "peace".into()]);
        let engine =
            InferenceEngine::from_model(model, labels, EfficientNetVariant::B0, 32, device).unwrap();
        AppState::new(engine)
    }

    pub(crate) fn png_bytes(img: &image::RgbImage) -> Vec<u8> {
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn multipart_body(field: &str, contents: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"frame.png\"\r\n",
                field
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
        body.extend_from_slice(contents);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    async fn post_predict(field: &str, contents: &[u8]) -> (StatusCode, Vec<u8>) {
        post_predict_with_limit(field, contents, 1024 * 1024).await
    }

    async fn post_predict_with_limit(
        field: &str,
        contents: &[u8],
        max_upload_bytes: usize,
    ) -> (StatusCode, Vec<u8>) {
        let app = router(test_state(), max_upload_bytes);
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/predict/")
                    .header(
                        header::CONTENT_TYPE,
                        format!("multipart/form-data; boundary={}", BOUNDARY),
                    )
                    .body(Body::from(multipart_body(field, contents)))
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn index() {
        let app = router(test_state(), 1024);

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "backend running");
    }

    #[tokio::test]
    async fn predict_black_image() {
        let png = png_bytes(&image::RgbImage::new(48, 48));

        let (status, body) = post_predict("file", &png).await;

        assert_eq!(status, StatusCode::OK);
        let response: PredictResponse = serde_json::from_slice(&body).unwrap();
        assert!(["fist", "palm", "peace"].contains(&response.prediction.as_str()));
        assert!(response.confidence > 0.0 && response.confidence <= 1.0);
    }

    #[tokio::test]
    async fn predict_empty_file() {
        let (status, body) = post_predict("file", b"").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.detail, "Empty file");
    }

    #[tokio::test]
    async fn predict_not_an_image() {
        let (status, body) = post_predict("file", b"definitely not a png").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(error.detail.starts_with("Could not decode image"));
    }

    #[tokio::test]
    async fn predict_missing_file_field() {
        let png = png_bytes(&image::RgbImage::new(8, 8));

        let (status, _) = post_predict("upload", &png).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn predict_oversized_upload() {
        let (status, body) = post_predict_with_limit("file", &[7u8; 8 * 1024], 1024).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(error.detail.starts_with("Invalid multipart body"));
    }
}
