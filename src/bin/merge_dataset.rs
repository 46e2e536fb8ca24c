//! raw と augmented を最終データセットへ統合する

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use hand_gesture_lib::dataset::merge_datasets;
use hand_gesture_lib::model::AppConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Merge raw and augmented trees into the final dataset")]
struct MergeArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// 統合するデータセット（複数指定可）。未指定なら raw と augmented
    #[arg(long = "source")]
    sources: Vec<PathBuf>,
    /// 出力先
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() -> Result<()> {
    hand_gesture_lib::init_tracing();
    let args = MergeArgs::parse();
    let config = AppConfig::load_or_default(&args.config);

    let sources = if args.sources.is_empty() {
        vec![
            config.dataset.raw_dir.clone(),
            config.dataset.augmented_dir.clone(),
        ]
    } else {
        args.sources
    };
    let out = args.out.unwrap_or(config.dataset.final_dir);

    let source_refs: Vec<&std::path::Path> = sources.iter().map(|p| p.as_path()).collect();
    let report = merge_datasets(&source_refs, &out)?;

    println!(
        "{} classes ({}), {} files, {} renamed",
        report.classes.len(),
        report.classes.join(", "),
        report.copied,
        report.renamed
    );
    Ok(())
}
