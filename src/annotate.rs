//! 检测结果绘制
//!
//! 在原图副本上画框与 "类别 置信度" 标签, 保存为 results/detected_<原文件名>

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::{info, warn};

use crate::error::SortError;
use crate::DetectionResult;

pub const ANNOTATED_PREFIX: &str = "detected_";
const FONT_URL: &str = "https://ultralytics.com/assets/Arial.ttf";

const BRIGHT_COLORS: [(u8, u8, u8); 12] = [
    (255, 0, 0),     // 红色
    (0, 255, 0),     // 绿色
    (0, 0, 255),     // 蓝色
    (255, 255, 0),   // 黄色
    (255, 0, 255),   // 品红
    (0, 255, 255),   // 青色
    (255, 128, 0),   // 橙色
    (255, 0, 128),   // 粉红
    (128, 255, 0),   // 黄绿
    (0, 128, 255),   // 天蓝
    (255, 255, 255), // 白色
    (128, 0, 255),   // 紫色
];

pub struct Annotator {
    font: Option<FontVec>,
    thickness: u32,
}

impl Annotator {
    pub fn new(font: Option<FontVec>) -> Self {
        Self { font, thickness: 2 }
    }

    /// 字体加载失败不影响分拣, 只画框不写字
    pub fn load(font_path: Option<&Path>) -> Self {
        let font = match font_path {
            Some(path) => read_font(path),
            None => cached_font(),
        };
        match font {
            Ok(font) => Self::new(Some(font)),
            Err(e) => {
                warn!("字体不可用, 标注将不含文字: {:#}", e);
                Self::new(None)
            }
        }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    fn color(id: usize) -> Rgb<u8> {
        let (r, g, b) = BRIGHT_COLORS[id % BRIGHT_COLORS.len()];
        Rgb([r, g, b])
    }

    pub fn plot(&self, image: &DynamicImage, result: &DetectionResult) -> RgbImage {
        let mut canvas = image.to_rgb8();
        let (w, h) = canvas.dimensions();
        if w == 0 || h == 0 {
            return canvas;
        }

        for detection in &result.detections {
            let bbox = &detection.bbox;
            let color = Self::color(detection.class_id());
            let x = bbox.xmin().max(0.0) as i32;
            let y = bbox.ymin().max(0.0) as i32;
            let bw = (bbox.width().round() as u32).max(1);
            let bh = (bbox.height().round() as u32).max(1);

            for t in 0..self.thickness {
                let (tw, th) = (bw.saturating_sub(2 * t), bh.saturating_sub(2 * t));
                if tw == 0 || th == 0 {
                    break;
                }
                draw_hollow_rect_mut(
                    &mut canvas,
                    Rect::at(x + t as i32, y + t as i32).of_size(tw, th),
                    color,
                );
            }

            if let Some(font) = &self.font {
                let legend = format!("{} {:.2}", detection.label, detection.confidence());
                let scale = PxScale::from((h.min(w) as f32 / 40.0).clamp(12.0, 32.0));
                let (lw, lh) = text_size(scale, font, &legend);
                let lw = lw.max(1) + 4;
                let lh = lh.max(1) + 4;
                // 标签放在框上方, 放不下时放进框内
                let ly = if y >= lh as i32 { y - lh as i32 } else { y };
                draw_filled_rect_mut(&mut canvas, Rect::at(x, ly).of_size(lw, lh), color);
                draw_text_mut(
                    &mut canvas,
                    Rgb([0, 0, 0]),
                    x + 2,
                    ly + 2,
                    scale,
                    font,
                    &legend,
                );
            }
        }
        canvas
    }

    /// 绘制并保存, 返回输出路径
    pub fn save(
        &self,
        image: &DynamicImage,
        result: &DetectionResult,
        src: &Path,
        results_dir: &Path,
    ) -> Result<PathBuf> {
        let dst = annotated_path(results_dir, src)?;
        let canvas = self.plot(image, result);
        canvas
            .save(&dst)
            .with_context(|| format!("保存标注图片失败: {}", dst.display()))?;
        Ok(dst)
    }
}

/// results/detected_<原文件名>
pub fn annotated_path(results_dir: &Path, src: &Path) -> Result<PathBuf> {
    let name = src
        .file_name()
        .ok_or_else(|| SortError::InvalidPath(src.to_path_buf()))?;
    Ok(results_dir.join(format!("{}{}", ANNOTATED_PREFIX, name.to_string_lossy())))
}

fn read_font(path: &Path) -> Result<FontVec> {
    let bytes = fs::read(path).with_context(|| format!("读取字体失败: {}", path.display()))?;
    FontVec::try_from_vec(bytes).with_context(|| format!("无效字体: {}", path.display()))
}

/// 用户配置目录下缓存的 Arial.ttf, 首次使用时下载
fn cached_font() -> Result<FontVec> {
    let mut path = dirs::config_dir().context("无法定位用户配置目录")?;
    path.push("Ultralytics");
    path.push("Arial.ttf");

    if !path.is_file() {
        info!("下载字体 {} → {}", FONT_URL, path.display());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut buf = Vec::new();
        ureq::get(FONT_URL)
            .call()
            .context("字体下载失败")?
            .into_reader()
            .read_to_end(&mut buf)?;
        fs::write(&path, &buf)?;
    }
    read_font(&path)
}
