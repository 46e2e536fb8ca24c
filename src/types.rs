use serde::{Deserialize, Serialize};

/// 推論結果
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    /// クラスマップ上のインデックス
    pub index: usize,
    /// softmax確率（argmaxクラス）
    pub confidence: f32,
}

// POST /predict/ のレスポンス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    pub prediction: String,
    pub confidence: f32,
}

impl From<Prediction> for PredictResponse {
    fn from(p: Prediction) -> Self {
        Self {
            prediction: p.label,
            confidence: p.confidence,
        }
    }
}

// GET / のレスポンス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

// エラー時のレスポンス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}
