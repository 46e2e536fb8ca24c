//! チェックポイントとバンドルの永続化
//!
//! チェックポイントディレクトリ:
//! - efficient_b0.mpk / efficient_b2.mpk - モデルの重み
//! - class_map.json                       - クラスインデックス → ラベル
//!
//! バンドル（tar.gz内部）:
//! - metadata.json   - メタデータ
//! - class_map.json  - クラスマップ
//! - model.mpk       - モデルの重み

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};
use tracing::{info, warn};

use crate::ml::EfficientNetVariant;
use crate::model::class_map::{ClassMap, CLASS_MAP_FILE};
use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const WEIGHTS_ENTRY: &str = "model.mpk";

/// 読み込んだチェックポイント
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub variant: EfficientNetVariant,
    pub class_map: ClassMap,
    /// burn named-msgpack 形式の重み
    pub weights: Vec<u8>,
    /// バンドルから読み込んだ場合のみ存在
    pub metadata: Option<ModelMetadata>,
    pub source: PathBuf,
}

fn is_bundle_path(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some("gz")
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, data)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// メタデータ・クラスマップ・重みをTar.gz形式で保存
///
/// 拡張子が `.gz` でなければ `.tar.gz` を付加し、実際に書き込んだパスを返す。
pub fn save_bundle(
    output_path: &Path,
    metadata: &ModelMetadata,
    class_map: &ClassMap,
    weights: &[u8],
) -> Result<PathBuf> {
    if metadata.num_classes != class_map.len() {
        anyhow::bail!(
            "メタデータのクラス数 ({}) とクラスマップ ({}) が一致しません",
            metadata.num_classes,
            class_map.len()
        );
    }

    let tar_gz_path = if is_bundle_path(output_path) {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    };

    if let Some(parent) = tar_gz_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
    }

    let tar_gz_file = File::create(&tar_gz_path)
        .with_context(|| format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    append_entry(&mut tar_builder, METADATA_ENTRY, metadata.to_json_string()?.as_bytes())?;
    append_entry(&mut tar_builder, CLASS_MAP_FILE, class_map.to_json_string()?.as_bytes())?;
    append_entry(&mut tar_builder, WEIGHTS_ENTRY, weights)?;

    tar_builder
        .into_inner()
        .context("Failed to finalize tar.gz archive")?
        .finish()
        .context("Failed to finish gzip stream")?;

    Ok(tar_gz_path)
}

/// Tar.gzからメタデータ・クラスマップ・重みを読み込む
pub fn load_bundle(tar_gz_path: &Path) -> Result<(ModelMetadata, ClassMap, Vec<u8>)> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut class_map_opt: Option<ClassMap> = None;
    let mut weights_opt: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();

        match name.as_str() {
            METADATA_ENTRY => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            CLASS_MAP_FILE => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                class_map_opt = Some(ClassMap::from_json_str(&json_str)?);
            }
            WEIGHTS_ENTRY => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                weights_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, class_map_opt, weights_opt) {
        (Some(metadata), Some(class_map), Some(weights)) => Ok((metadata, class_map, weights)),
        (None, _, _) => Err(anyhow::anyhow!("{} not found in tar.gz archive", METADATA_ENTRY)),
        (_, None, _) => Err(anyhow::anyhow!("{} not found in tar.gz archive", CLASS_MAP_FILE)),
        (_, _, None) => Err(anyhow::anyhow!("{} not found in tar.gz archive", WEIGHTS_ENTRY)),
    }
}

/// チェックポイントを読み込む
///
/// `path` はチェックポイントディレクトリ、`.mpk` ファイル、またはバンドルのいずれか。
/// バンドルの場合はメタデータのバリアントが優先される。
pub fn load_checkpoint(path: &Path, variant: EfficientNetVariant) -> Result<LoadedCheckpoint> {
    if path.is_file() && is_bundle_path(path) {
        let (metadata, class_map, weights) = load_bundle(path)?;
        if metadata.variant != variant {
            warn!(
                "バンドルのバリアント ({}) が指定 ({}) と異なります。バンドルの値を使用します",
                metadata.variant, variant
            );
        }
        info!("バンドルを読み込みました: {}", path.display());
        return Ok(LoadedCheckpoint {
            variant: metadata.variant,
            class_map,
            weights,
            metadata: Some(metadata),
            source: path.to_path_buf(),
        });
    }

    let (weights_path, class_map_path) = if path.is_dir() {
        (
            path.join(format!("{}.mpk", variant.file_stem())),
            path.join(CLASS_MAP_FILE),
        )
    } else {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        (path.to_path_buf(), dir.join(CLASS_MAP_FILE))
    };

    let weights = std::fs::read(&weights_path)
        .with_context(|| format!("モデル重みを読み込めません: {}", weights_path.display()))?;
    let class_map = ClassMap::load(&class_map_path)
        .with_context(|| format!("クラスマップを読み込めません: {}", class_map_path.display()))?;
    info!(
        "チェックポイントを読み込みました: {} ({} クラス)",
        weights_path.display(),
        class_map.len()
    );

    Ok(LoadedCheckpoint {
        variant,
        class_map,
        weights,
        metadata: None,
        source: weights_path,
    })
}
