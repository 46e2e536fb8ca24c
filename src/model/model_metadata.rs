//! モデルメタデータの定義
//!
//! バンドル（tar.gz）内の metadata.json として保存されます。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ml::EfficientNetVariant;

/// モデルメタデータ
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetadata {
    /// EfficientNetのバリアント
    pub variant: EfficientNetVariant,

    /// 分類クラス数（class_map.json のエントリ数と一致）
    pub num_classes: usize,

    /// モデル入力サイズ（正方形、ピクセル）
    pub image_size: u32,

    /// 学習エポック数
    pub num_epochs: u32,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        variant: EfficientNetVariant,
        num_classes: usize,
        image_size: u32,
        num_epochs: u32,
    ) -> Self {
        Self {
            variant,
            num_classes,
            image_size,
            num_epochs,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
