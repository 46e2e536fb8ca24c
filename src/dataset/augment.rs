//! 画像データ拡張
//!
//! 生画像を出力サイズへリサイズした後、回転・ノイズ・ズーム・明るさの変換を確率的に適用します。
//! 各派生画像には最低1つの変換が必ず適用され、出力サイズは常に設定値と一致します。

use anyhow::Result;
use image::imageops::FilterType;
use image::RgbImage;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::dataset::{list_class_dirs, list_images, save_rgb_image};
use crate::model::AugmentSettings;

/// 変換の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Rotation,
    Noise,
    Zoom,
    Brightness,
}

const ALL_TRANSFORMS: [Transform; 4] = [
    Transform::Rotation,
    Transform::Noise,
    Transform::Zoom,
    Transform::Brightness,
];

#[derive(Debug, Clone)]
pub struct AugmentPipeline {
    pub output_size: u32,
    pub max_rotation_deg: f32,
    pub rotation_prob: f32,
    pub noise_prob: f32,
    pub noise_strength: f32,
    pub zoom_prob: f32,
    pub zoom_min: f32,
    pub zoom_max: f32,
    pub brightness_prob: f32,
    pub brightness_min: f32,
    pub brightness_max: f32,
    pub seed: Option<u64>,
}

impl AugmentPipeline {
    pub fn from_settings(settings: &AugmentSettings) -> Self {
        Self {
            output_size: settings.output_size.max(1),
            max_rotation_deg: settings.max_rotation_deg.abs(),
            rotation_prob: settings.rotation_prob,
            noise_prob: settings.noise_prob,
            noise_strength: settings.noise_strength,
            zoom_prob: settings.zoom_prob,
            zoom_min: settings.zoom_min,
            zoom_max: settings.zoom_max,
            brightness_prob: settings.brightness_prob,
            brightness_min: settings.brightness_min,
            brightness_max: settings.brightness_max,
            seed: settings.seed,
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "size={} rotation_p={:.2} max_deg={:.1} noise_p={:.2} strength={:.3} zoom_p={:.2} range=[{:.2},{:.2}] brightness_p={:.2} range=[{:.2},{:.2}] seed={}",
            self.output_size,
            self.rotation_prob,
            self.max_rotation_deg,
            self.noise_prob,
            self.noise_strength,
            self.zoom_prob,
            self.zoom_min,
            self.zoom_max,
            self.brightness_prob,
            self.brightness_min,
            self.brightness_max,
            self.seed
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string())
        )
    }

    /// 変換が1つでも実行可能か（確率以外の条件）
    fn usable(&self, t: Transform) -> bool {
        match t {
            Transform::Rotation => self.max_rotation_deg > 0.0,
            Transform::Noise => self.noise_strength > 0.0,
            Transform::Zoom => self.zoom_min > 0.0 && self.zoom_max > 0.0,
            Transform::Brightness => self.brightness_min >= 0.0 && self.brightness_max > 0.0,
        }
    }

    fn prob(&self, t: Transform) -> f32 {
        match t {
            Transform::Rotation => self.rotation_prob,
            Transform::Noise => self.noise_prob,
            Transform::Zoom => self.zoom_prob,
            Transform::Brightness => self.brightness_prob,
        }
    }

    fn run(&self, t: Transform, img: &mut RgbImage, rng: &mut dyn rand::RngCore) {
        match t {
            Transform::Rotation => {
                let deg = sample_range(rng, -self.max_rotation_deg, self.max_rotation_deg);
                *img = rotate_about_center(img, deg.to_radians());
            }
            Transform::Noise => add_noise(img, self.noise_strength, rng),
            Transform::Zoom => {
                let scale = sample_range(rng, self.zoom_min, self.zoom_max);
                *img = zoom(img, scale, rng);
            }
            Transform::Brightness => {
                let factor = sample_range(rng, self.brightness_min, self.brightness_max);
                scale_brightness(img, factor);
            }
        }
    }

    /// 1枚の派生画像を生成し、適用した変換の一覧と共に返す
    pub fn apply_traced(
        &self,
        img: &RgbImage,
        rng: &mut dyn rand::RngCore,
    ) -> (RgbImage, Vec<Transform>) {
        let size = self.output_size;
        let mut out = if img.dimensions() == (size, size) {
            img.clone()
        } else {
            image::imageops::resize(img, size, size, FilterType::Triangle)
        };

        let mut applied = Vec::new();
        for t in ALL_TRANSFORMS {
            let p = self.prob(t);
            if p <= 0.0 || !self.usable(t) {
                continue;
            }
            if rng.gen_range(0.0..1.0) < p {
                self.run(t, &mut out, rng);
                applied.push(t);
            }
        }

        // どれも選ばれなかった場合は使える変換から1つを必ず適用する
        if applied.is_empty() {
            let candidates: Vec<Transform> = ALL_TRANSFORMS
                .iter()
                .copied()
                .filter(|t| self.usable(*t))
                .collect();
            let t = if candidates.is_empty() {
                Transform::Brightness
            } else {
                candidates[rng.gen_range(0..candidates.len())]
            };
            self.run(t, &mut out, rng);
            applied.push(t);
        }

        (out, applied)
    }

    pub fn apply(&self, img: &RgbImage, rng: &mut dyn rand::RngCore) -> RgbImage {
        self.apply_traced(img, rng).0
    }

    /// シード付きの乱数生成器（シード未指定ならエントロピーから）
    pub fn rng(&self) -> rand::rngs::StdRng {
        match self.seed {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
            None => rand::rngs::StdRng::from_entropy(),
        }
    }
}

fn sample_range(rng: &mut dyn rand::RngCore, lo: f32, hi: f32) -> f32 {
    if hi > lo {
        rng.gen_range(lo..hi)
    } else {
        lo
    }
}

fn bilinear(img: &RgbImage, x: f32, y: f32) -> Option<[f32; 3]> {
    let (w, h) = img.dimensions();
    if x < 0.0 || y < 0.0 || x > (w - 1) as f32 || y > (h - 1) as f32 {
        return None;
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);

    let mut out = [0.0f32; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = top * (1.0 - fy) + bottom * fy;
    }
    Some(out)
}

/// 画像中心を軸に回転（はみ出した領域は黒）
pub fn rotate_about_center(img: &RgbImage, radians: f32) -> RgbImage {
    let (w, h) = img.dimensions();
    let cx = (w as f32 - 1.0) / 2.0;
    let cy = (h as f32 - 1.0) / 2.0;
    let (sin, cos) = radians.sin_cos();

    RgbImage::from_fn(w, h, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        // 出力座標から入力座標への逆写像
        let sx = cos * dx + sin * dy + cx;
        let sy = -sin * dx + cos * dy + cy;
        match bilinear(img, sx, sy) {
            Some(rgb) => image::Rgb([
                rgb[0].round().clamp(0.0, 255.0) as u8,
                rgb[1].round().clamp(0.0, 255.0) as u8,
                rgb[2].round().clamp(0.0, 255.0) as u8,
            ]),
            None => image::Rgb([0, 0, 0]),
        }
    })
}

pub fn add_noise(img: &mut RgbImage, strength: f32, rng: &mut dyn rand::RngCore) {
    if strength <= 0.0 {
        return;
    }
    for pixel in img.pixels_mut() {
        for c in 0..3 {
            let noise = rng.gen_range(-strength..strength);
            let v = (pixel[c] as f32 / 255.0 + noise).clamp(0.0, 1.0);
            pixel[c] = (v * 255.0).round() as u8;
        }
    }
}

/// 拡大時はランダム位置で切り出し、縮小時は中央に配置して黒で埋める
pub fn zoom(img: &RgbImage, scale: f32, rng: &mut dyn rand::RngCore) -> RgbImage {
    let (w, h) = img.dimensions();
    let new_w = ((w as f32 * scale).round() as u32).max(1);
    let new_h = ((h as f32 * scale).round() as u32).max(1);
    if (new_w, new_h) == (w, h) {
        return img.clone();
    }

    let resized = image::imageops::resize(img, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::new(w, h);

    if new_w >= w && new_h >= h {
        let x0 = rng.gen_range(0..=new_w - w) as i64;
        let y0 = rng.gen_range(0..=new_h - h) as i64;
        image::imageops::replace(&mut canvas, &resized, -x0, -y0);
    } else {
        let x0 = (w as i64 - new_w as i64) / 2;
        let y0 = (h as i64 - new_h as i64) / 2;
        image::imageops::replace(&mut canvas, &resized, x0, y0);
    }
    canvas
}

pub fn scale_brightness(img: &mut RgbImage, factor: f32) {
    for pixel in img.pixels_mut() {
        for c in 0..3 {
            pixel[c] = (pixel[c] as f32 * factor).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// データ拡張の結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AugmentReport {
    pub classes: usize,
    pub source_images: usize,
    pub written: usize,
    pub skipped: Vec<PathBuf>,
}

/// `<stem>_aug<i>.<ext>` 形式の出力パス
pub fn augmented_path(out_dir: &Path, source: &Path, index: usize) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string());
    let ext = source
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "png".to_string());
    out_dir.join(format!("{}_aug{}.{}", stem, index, ext))
}

/// raw ツリーと同じ構造で拡張画像を書き出す
///
/// 読み込めない画像は警告を出してスキップする（再試行はしない）。
pub fn augment_dataset(
    raw_dir: &Path,
    out_dir: &Path,
    pipeline: &AugmentPipeline,
    variants_per_image: usize,
) -> Result<AugmentReport> {
    info!("データ拡張: {} -> {}", raw_dir.display(), out_dir.display());
    info!("  {}", pipeline.describe());

    let mut rng = pipeline.rng();
    let mut report = AugmentReport::default();

    for class_name in list_class_dirs(raw_dir)? {
        let class_out = out_dir.join(&class_name);
        std::fs::create_dir_all(&class_out)?;
        report.classes += 1;

        let mut written = 0usize;
        for path in list_images(&raw_dir.join(&class_name))? {
            let img = match image::open(&path) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    warn!("画像を読み込めないためスキップします {}: {}", path.display(), e);
                    report.skipped.push(path);
                    continue;
                }
            };
            report.source_images += 1;

            for i in 0..variants_per_image {
                let augmented = pipeline.apply(&img, &mut rng);
                save_rgb_image(&augmented_path(&class_out, &path, i), &augmented)?;
                written += 1;
            }
        }
        info!("  {}: {} 枚生成", class_name, written);
        report.written += written;
    }

    info!(
        "データ拡張が完了しました: {} クラス, 元画像 {} 枚, 生成 {} 枚, スキップ {} 枚",
        report.classes,
        report.source_images,
        report.written,
        report.skipped.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline_with(settings: AugmentSettings) -> AugmentPipeline {
        AugmentPipeline::from_settings(&settings)
    }

    fn checker(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                image::Rgb([220, 180, 140])
            } else {
                image::Rgb([30, 60, 90])
            }
        })
    }

    #[test]
    fn test_output_size_is_invariant() {
        let pipeline = pipeline_with(AugmentSettings {
            output_size: 48,
            seed: Some(3),
            ..Default::default()
        });
        let mut rng = pipeline.rng();

        for (w, h) in [(64, 40), (20, 90), (48, 48)] {
            for _ in 0..10 {
                let out = pipeline.apply(&checker(w, h), &mut rng);
                assert_eq!(out.dimensions(), (48, 48));
            }
        }
    }

    #[test]
    fn test_at_least_one_transform() {
        // 確率0でも1つは適用される
        let pipeline = pipeline_with(AugmentSettings {
            output_size: 16,
            rotation_prob: 0.0,
            noise_prob: 0.0,
            zoom_prob: 0.0,
            brightness_prob: 0.0,
            seed: Some(1),
            ..Default::default()
        });
        let mut rng = pipeline.rng();

        for _ in 0..20 {
            let (_, applied) = pipeline.apply_traced(&checker(16, 16), &mut rng);
            assert_eq!(applied.len(), 1);
        }
    }

    #[test]
    fn test_seeded_pipeline_is_reproducible() {
        let pipeline = pipeline_with(AugmentSettings {
            output_size: 24,
            seed: Some(99),
            ..Default::default()
        });
        let img = checker(30, 30);

        let a = pipeline.apply(&img, &mut pipeline.rng());
        let b = pipeline.apply(&img, &mut pipeline.rng());
        assert_eq!(a, b);
    }

    #[test]
    fn test_rotation_zero_is_identity_and_corners_fill_black() {
        let img = RgbImage::from_pixel(9, 9, image::Rgb([200, 200, 200]));
        assert_eq!(rotate_about_center(&img, 0.0), img);

        let rotated = rotate_about_center(&img, 45f32.to_radians());
        assert_eq!(rotated.get_pixel(0, 0), &image::Rgb([0, 0, 0]));
        assert_eq!(rotated.get_pixel(4, 4), &image::Rgb([200, 200, 200]));
    }

    #[test]
    fn test_brightness_and_zoom() {
        let mut img = RgbImage::from_pixel(8, 8, image::Rgb([100, 200, 250]));
        scale_brightness(&mut img, 1.2);
        assert_eq!(img.get_pixel(0, 0), &image::Rgb([120, 240, 255]));

        let mut rng = rand::rngs::StdRng::seed_from_u64(5);
        assert_eq!(zoom(&img, 1.5, &mut rng).dimensions(), (8, 8));
        let shrunk = zoom(&img, 0.5, &mut rng);
        assert_eq!(shrunk.dimensions(), (8, 8));
        assert_eq!(shrunk.get_pixel(0, 0), &image::Rgb([0, 0, 0]));
    }

    #[test]
    fn test_augment_dataset_tree() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        let out = dir.path().join("augmented");
        save_rgb_image(&raw.join("palm").join("p1.png"), &checker(20, 20)).unwrap();
        save_rgb_image(&raw.join("fist").join("f1.jpg"), &checker(30, 10)).unwrap();
        std::fs::write(raw.join("fist").join("broken.png"), b"garbage").unwrap();

        let pipeline = pipeline_with(AugmentSettings {
            output_size: 32,
            seed: Some(7),
            ..Default::default()
        });
        let report = augment_dataset(&raw, &out, &pipeline, 3).unwrap();

        assert_eq!(report.classes, 2);
        assert_eq!(report.source_images, 2);
        assert_eq!(report.written, 6);
        assert_eq!(report.skipped.len(), 1);

        let produced = out.join("fist").join("f1_aug2.jpg");
        assert!(produced.exists());
        let decoded = image::open(&produced).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 32));
        assert!(out.join("palm").join("p1_aug0.png").exists());
    }
}
