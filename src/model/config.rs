//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、データセットの配置、学習・推論サーバーの設定などをJSON形式で保存・読み込みします。
//! すべてのセクションは省略可能で、欠けた項目はデフォルト値で補われます。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::ml::{EfficientNetVariant, DEFAULT_IMAGE_SIZE};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "wgpu" | "gpu" => Ok(DeviceType::Wgpu),
            "cpu" | "ndarray" => Ok(DeviceType::Cpu),
            _ => anyhow::bail!("未対応のデバイス種別です: {}", s),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// EfficientNetのバリアント
    pub variant: EfficientNetVariant,
    /// チェックポイントディレクトリ（重み + class_map.json）
    pub checkpoint_dir: PathBuf,
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// 事前学習済みバックボーンの重み
    pub pretrained_backbone: Option<PathBuf>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            variant: EfficientNetVariant::default(),
            checkpoint_dir: PathBuf::from("model"),
            image_size: DEFAULT_IMAGE_SIZE,
            pretrained_backbone: None,
        }
    }
}

/// データセットの配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSettings {
    /// 撮影した生画像
    pub raw_dir: PathBuf,
    /// 拡張画像
    pub augmented_dir: PathBuf,
    /// 学習に使う統合データセット
    pub final_dir: PathBuf,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from("dataset/raw"),
            augmented_dir: PathBuf::from("dataset/augmented"),
            final_dir: PathBuf::from("dataset/final"),
        }
    }
}

/// データ拡張設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentSettings {
    /// 出力画像サイズ（正方形）
    pub output_size: u32,
    /// 1枚の元画像から生成する枚数
    pub variants_per_image: usize,
    /// 回転角の最大値（度）
    pub max_rotation_deg: f32,
    /// 各変換を適用する確率
    pub rotation_prob: f32,
    pub noise_prob: f32,
    pub zoom_prob: f32,
    pub brightness_prob: f32,
    /// ノイズの最大振幅（0-1スケール）
    pub noise_strength: f32,
    /// ズーム倍率の範囲
    pub zoom_min: f32,
    pub zoom_max: f32,
    /// 明るさ係数の範囲
    pub brightness_min: f32,
    pub brightness_max: f32,
    /// 乱数シード（未指定なら毎回異なる）
    pub seed: Option<u64>,
}

impl Default for AugmentSettings {
    fn default() -> Self {
        Self {
            output_size: DEFAULT_IMAGE_SIZE as u32,
            variants_per_image: 5,
            max_rotation_deg: 20.0,
            rotation_prob: 0.5,
            noise_prob: 0.3,
            zoom_prob: 0.5,
            brightness_prob: 0.5,
            noise_strength: 0.06,
            zoom_min: 1.0,
            zoom_max: 1.25,
            brightness_min: 0.7,
            brightness_max: 1.3,
            seed: None,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// ワーカー数
    pub num_workers: usize,
    /// 学習率
    pub learning_rate: f64,
    /// データ分割用シード
    pub seed: u64,
    /// トレーニングデータの割合
    pub train_ratio: f32,
    /// Learnerのアーティファクト出力先
    pub artifact_dir: PathBuf,
    /// 学習後に書き出すバンドル（tar.gz）
    pub bundle_path: Option<PathBuf>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            batch_size: 16,
            num_workers: 1,
            learning_rate: 1e-3,
            seed: 42,
            train_ratio: 0.8,
            artifact_dir: PathBuf::from("artifacts"),
            bundle_path: None,
        }
    }
}

/// カメラ撮影設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// v4l2デバイスパス（未指定なら autovideosrc）
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    /// 保存形式の拡張子（png / jpg）
    pub image_format: String,
    /// 撮影するジェスチャーラベル
    pub labels: Vec<String>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            device: None,
            width: 640,
            height: 480,
            image_format: "jpg".to_string(),
            labels: ["fist", "palm", "peace", "thumbs_up", "ok"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// 推論サーバー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// アップロードの最大サイズ（バイト）
    pub max_upload_bytes: usize,
    /// model.checkpoint_dir より優先されるチェックポイント（ディレクトリ / .mpk / バンドル）
    pub checkpoint: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            max_upload_bytes: 10 * 1024 * 1024,
            checkpoint: None,
        }
    }
}

impl ServerSettings {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 推論クライアント設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// 推論エンドポイントのURL
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8000/predict/".to_string(),
            timeout_secs: 30,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// モデル設定
    pub model: ModelSettings,
    /// データセットの配置
    pub dataset: DatasetSettings,
    /// データ拡張設定
    pub augment: AugmentSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// カメラ撮影設定
    pub capture: CaptureSettings,
    /// 推論サーバー設定
    pub server: ServerSettings,
    /// 推論クライアント設定
    pub client: ClientSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 推論サーバーが読み込むチェックポイントのパス
    pub fn checkpoint_path(&self) -> &Path {
        self.server
            .checkpoint
            .as_deref()
            .unwrap_or(&self.model.checkpoint_dir)
    }

    /// 設定情報をログに出力
    pub fn display(&self) {
        info!("=== アプリケーション設定 ===");
        info!("計算デバイス: {}", self.device_type);
        info!(
            "モデル: {} ({}x{}), チェックポイント: {}",
            self.model.variant,
            self.model.image_size,
            self.model.image_size,
            self.model.checkpoint_dir.display()
        );
        info!(
            "データセット: raw={}, augmented={}, final={}",
            self.dataset.raw_dir.display(),
            self.dataset.augmented_dir.display(),
            self.dataset.final_dir.display()
        );
        info!(
            "トレーニング: エポック数 {}, バッチサイズ {}, 学習率 {}",
            self.training.num_epochs, self.training.batch_size, self.training.learning_rate
        );
        info!("サーバー: {}", self.server.bind_address());
        info!("推論エンドポイント: {}", self.client.endpoint);
    }
}
