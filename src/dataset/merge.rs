//! raw + augmented を最終データセットへ統合

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::dataset::{list_class_dirs, list_images};

/// 統合結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// 統合後のクラス名（ソート済み）
    pub classes: Vec<String>,
    pub copied: usize,
    /// 名前が衝突して連番を付けたファイル数
    pub renamed: usize,
    pub skipped: Vec<PathBuf>,
}

/// 衝突しないファイル名を探す（`name.png` → `name_1.png` → `name_2.png` ...）
fn unique_destination(dir: &Path, file_name: &Path) -> (PathBuf, bool) {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return (candidate, false);
    }

    let stem = file_name
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = file_name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut n = 1usize;
    loop {
        let candidate = dir.join(format!("{}_{}{}", stem, n, ext));
        if !candidate.exists() {
            return (candidate, true);
        }
        n += 1;
    }
}

/// 複数のデータセットツリーをクラスごとに和集合として統合する
///
/// 存在しないソースは警告を出して無視する。コピーに失敗したファイルはスキップする。
pub fn merge_datasets(sources: &[&Path], final_dir: &Path) -> Result<MergeReport> {
    fs::create_dir_all(final_dir)
        .with_context(|| format!("出力ディレクトリを作成できません: {}", final_dir.display()))?;

    let mut report = MergeReport::default();

    for source in sources {
        if !source.is_dir() {
            warn!("ソースディレクトリが存在しません: {}", source.display());
            continue;
        }
        info!("統合: {} -> {}", source.display(), final_dir.display());

        for class_name in list_class_dirs(source)? {
            let class_out = final_dir.join(&class_name);
            fs::create_dir_all(&class_out)?;
            if !report.classes.contains(&class_name) {
                report.classes.push(class_name.clone());
            }

            for path in list_images(&source.join(&class_name))? {
                let Some(file_name) = path.file_name() else {
                    continue;
                };
                let (dest, renamed) = unique_destination(&class_out, Path::new(file_name));
                match fs::copy(&path, &dest) {
                    Ok(_) => {
                        report.copied += 1;
                        if renamed {
                            report.renamed += 1;
                        }
                    }
                    Err(e) => {
                        warn!("コピーに失敗したためスキップします {}: {}", path.display(), e);
                        report.skipped.push(path);
                    }
                }
            }
        }
    }

    report.classes.sort();
    info!(
        "統合が完了しました: {} クラス, {} 枚 (名前変更 {} 枚)",
        report.classes.len(),
        report.copied,
        report.renamed
    );
    Ok(report)
}
