//! データセットディレクトリの走査と保存
//!
//! データセットは「1クラス = 1サブフォルダ」の構造そのものがフォーマットで、マニフェストは持たない。

pub mod augment;
pub mod merge;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub use augment::{augment_dataset, AugmentPipeline, AugmentReport};
pub use merge::{merge_datasets, MergeReport};

/// 対応する画像拡張子
pub const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// 拡張子が対応画像形式かどうか（大文字小文字を区別しない）
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_lowercase();
            IMAGE_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

/// クラスディレクトリ名をソートして返す（隠しディレクトリは除外）
pub fn list_class_dirs(root: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(root)
        .with_context(|| format!("データセットディレクトリを読み込めません: {}", root.display()))?;

    let mut classes = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        classes.push(name);
    }
    classes.sort();
    Ok(classes)
}

/// ディレクトリ直下の対応画像をパス順で返す
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("ディレクトリを読み込めません: {}", dir.display()))?;

    let mut images = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && is_supported_image(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// RGB画像を保存（親ディレクトリがなければ作成、形式は拡張子から決まる）
pub fn save_rgb_image(path: &Path, img: &image::RgbImage) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("ディレクトリを作成できません: {}", parent.display()))?;
    }
    img.save(path)
        .with_context(|| format!("画像を保存できません: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_supported_image() {
        assert!(is_supported_image(Path::new("a/b.png")));
        assert!(is_supported_image(Path::new("a/b.JPG")));
        assert!(is_supported_image(Path::new("b.jpeg")));
        assert!(!is_supported_image(Path::new("b.gif")));
        assert!(!is_supported_image(Path::new("README")));
    }

    #[test]
    fn test_scan_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("palm")).unwrap();
        fs::create_dir_all(root.join("fist")).unwrap();
        fs::create_dir_all(root.join(".cache")).unwrap();
        fs::write(root.join("notes.txt"), "x").unwrap();

        let img = image::RgbImage::new(4, 4);
        save_rgb_image(&root.join("palm").join("b.png"), &img).unwrap();
        save_rgb_image(&root.join("palm").join("a.jpg"), &img).unwrap();
        fs::write(root.join("palm").join("c.txt"), "x").unwrap();

        assert_eq!(list_class_dirs(root).unwrap(), vec!["fist", "palm"]);

        let images = list_images(&root.join("palm")).unwrap();
        assert_eq!(images.len(), 2);
        assert!(images[0].ends_with("a.jpg"));
        assert!(list_images(&root.join("fist")).unwrap().is_empty());
    }

    #[test]
    fn test_missing_root_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_class_dirs(&dir.path().join("nope")).is_err());
    }
}
