//! カメラ画像の撮影とラベル付け保存
//!
//! 1行入力するごとに1フレームを取得し、`raw/<class>/<class>_<timestamp>.<ext>` に保存します。
//! 入力はクラス名または一覧の番号（1始まり）、`q` で終了します。

use anyhow::Result;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::dataset::save_rgb_image;
use crate::video::FrameSource;

pub struct CaptureSession {
    raw_dir: PathBuf,
    labels: Vec<String>,
    image_format: String,
}

/// 1行の入力に対する動作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureCommand {
    Save(String),
    Quit,
    Skip,
    Unknown(String),
}

impl CaptureSession {
    /// クラスごとのフォルダを作成してセッションを開始
    pub fn new(raw_dir: &Path, labels: Vec<String>, image_format: &str) -> Result<Self> {
        if labels.is_empty() {
            anyhow::bail!("撮影するラベルが指定されていません");
        }
        let image_format = image_format.trim_start_matches('.').to_lowercase();
        if !crate::dataset::IMAGE_EXTENSIONS.contains(&image_format.as_str()) {
            anyhow::bail!("未対応の画像形式です: {}", image_format);
        }
        for label in &labels {
            std::fs::create_dir_all(raw_dir.join(label))?;
        }
        Ok(Self {
            raw_dir: raw_dir.to_path_buf(),
            labels,
            image_format,
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// クラス名または番号（1始まり）からラベルを解決
    pub fn resolve_label(&self, input: &str) -> Option<&str> {
        let input = input.trim();
        if let Ok(n) = input.parse::<usize>() {
            return n
                .checked_sub(1)
                .and_then(|i| self.labels.get(i))
                .map(String::as_str);
        }
        self.labels
            .iter()
            .find(|l| l.eq_ignore_ascii_case(input))
            .map(String::as_str)
    }

    pub fn parse_command(&self, line: &str) -> CaptureCommand {
        let line = line.trim();
        if line.is_empty() {
            return CaptureCommand::Skip;
        }
        if line.eq_ignore_ascii_case("q") {
            return CaptureCommand::Quit;
        }
        match self.resolve_label(line) {
            Some(label) => CaptureCommand::Save(label.to_string()),
            None => CaptureCommand::Unknown(line.to_string()),
        }
    }

    /// フレームを保存し、保存先を返す
    pub fn save_frame(&self, label: &str, img: &image::RgbImage) -> Result<PathBuf> {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f");
        let class_dir = self.raw_dir.join(label);
        let base = format!("{}_{}", label, timestamp);
        let mut path = class_dir.join(format!("{}.{}", base, self.image_format));
        // 同じミリ秒に複数保存しても上書きしない
        let mut n = 1;
        while path.exists() {
            path = class_dir.join(format!("{}_{}.{}", base, n, self.image_format));
            n += 1;
        }
        save_rgb_image(&path, img)?;
        Ok(path)
    }

    fn print_menu<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        writeln!(out, "ラベルを入力して撮影 (q で終了):")?;
        for (i, label) in self.labels.iter().enumerate() {
            writeln!(out, "  {}: {}", i + 1, label)?;
        }
        Ok(())
    }

    /// 対話ループ。保存した枚数を返す
    pub fn run<R: BufRead, W: Write>(
        &self,
        source: &mut dyn FrameSource,
        input: R,
        mut out: W,
    ) -> Result<usize> {
        self.print_menu(&mut out)?;
        let mut saved = 0usize;

        for line in input.lines() {
            match self.parse_command(&line?) {
                CaptureCommand::Quit => break,
                CaptureCommand::Skip => continue,
                CaptureCommand::Unknown(text) => {
                    writeln!(out, "不明なラベルです: {}", text)?;
                    self.print_menu(&mut out)?;
                }
                CaptureCommand::Save(label) => match source.grab_frame() {
                    Ok(frame) => {
                        let path = self.save_frame(&label, &frame)?;
                        saved += 1;
                        info!("保存しました: {}", path.display());
                        writeln!(out, "保存しました: {}", path.display())?;
                    }
                    Err(e) => {
                        warn!("フレームを取得できません: {:#}", e);
                        writeln!(out, "フレームを取得できません: {}", e)?;
                    }
                },
            }
        }

        info!("撮影を終了しました ({} 枚保存)", saved);
        Ok(saved)
    }
}
