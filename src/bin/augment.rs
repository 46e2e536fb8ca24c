//! raw データセットから拡張画像を生成する

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use hand_gesture_lib::dataset::{augment_dataset, AugmentPipeline};
use hand_gesture_lib::model::AppConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Write augmented copies of the raw gesture dataset")]
struct AugmentArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// 入力（raw データセット）
    #[arg(long)]
    raw: Option<PathBuf>,
    /// 出力先
    #[arg(long)]
    out: Option<PathBuf>,
    /// 1枚あたりの生成枚数
    #[arg(long)]
    variants: Option<usize>,
    /// 出力画像サイズ
    #[arg(long)]
    size: Option<u32>,
    /// 乱数シード
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    hand_gesture_lib::init_tracing();
    let args = AugmentArgs::parse();
    let config = AppConfig::load_or_default(&args.config);

    let mut settings = config.augment.clone();
    if let Some(size) = args.size {
        settings.output_size = size;
    }
    if args.seed.is_some() {
        settings.seed = args.seed;
    }
    let variants = args.variants.unwrap_or(settings.variants_per_image);
    let raw = args.raw.unwrap_or(config.dataset.raw_dir);
    let out = args.out.unwrap_or(config.dataset.augmented_dir);

    let pipeline = AugmentPipeline::from_settings(&settings);
    let report = augment_dataset(&raw, &out, &pipeline, variants)?;

    for path in &report.skipped {
        println!("skipped: {}", path.display());
    }
    println!(
        "{} classes, {} source images, {} written",
        report.classes, report.source_images, report.written
    );
    Ok(())
}
