//! ハンドジェスチャー認識
//!
//! カメラ撮影によるデータセット作成、データ拡張と統合、EfficientNet の学習、
//! 推論HTTPサーバーとクライアントを提供します。

pub mod capture;
pub mod client;
pub mod dataset;
pub mod ml;
pub mod model;
pub mod server;
pub mod types;
pub mod video;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// ログ出力を初期化（`RUST_LOG` 未指定時は info）
///
/// 2回目以降の呼び出しは何もしない。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = tracing_subscriber::fmt::layer().with_filter(filter);
    tracing_subscriber::registry().with(log_layer).try_init().ok();
}
