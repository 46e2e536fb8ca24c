use axum::{
    extract::{Multipart, State},
    Json,
};
use burn::tensor::backend::Backend;
use tracing::{debug, error};

use super::error::PredictError;
use super::AppState;
use crate::types::{HealthResponse, PredictResponse, Prediction};

/// アップロードのフォームフィールド名
pub const FILE_FIELD: &str = "file";

pub async fn index() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "backend running".to_string(),
    })
}

pub async fn predict<B: Backend>(
    State(state): State<AppState<B>>,
    mut multipart: Multipart,
) -> Result<Json<PredictResponse>, PredictError> {
    let mut contents = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(FILE_FIELD) {
            debug!(file_name = ?field.file_name(), "received upload");
            contents = Some(field.bytes().await?);
            break;
        }
    }

    let contents = contents.ok_or(PredictError::MissingFile)?;
    if contents.is_empty() {
        return Err(PredictError::EmptyFile);
    }

    // 復号と推論はブロッキング処理のため専用スレッドで実行（推論は同時に1件のみ）
    let engine = state.engine.clone();
    let prediction = tokio::task::spawn_blocking(move || -> Result<Prediction, PredictError> {
        let image = image::load_from_memory(&contents)
            .map_err(|e| PredictError::Decode(e.to_string()))?;
        let engine = engine
            .lock()
            .map_err(|_| PredictError::Internal("inference engine lock poisoned".to_string()))?;
        engine.predict(&image).map_err(|e| {
            error!("推論に失敗しました: {:#}", e);
            PredictError::Inference(format!("{:#}", e))
        })
    })
    .await
    .map_err(|e| PredictError::Internal(e.to_string()))??;

    debug!(
        label = %prediction.label,
        confidence = prediction.confidence,
        "prediction"
    );
    Ok(Json(prediction.into()))
}
