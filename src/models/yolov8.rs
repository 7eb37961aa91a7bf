// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 / YOLO11 检测模型
// 包含: 模型加载、预处理、推理、后处理

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView};
use ndarray::{s, Array, ArrayView2, Axis, IxDyn};
use tracing::info;

use super::COCO_NAMES;
use crate::{
    non_max_suppression, Bbox, Detection, DetectionResult, OrtBackend, OrtConfig, OrtEP,
    SortError,
};

const CXYWH_OFFSET: usize = 4;

/// YOLOv8 检测模型
pub struct YOLOv8 {
    engine: OrtBackend,
    nc: u32,
    height: u32,
    width: u32,
    conf: f32,
    iou: f32,
    names: Vec<String>,
    profile: bool,
}

impl YOLOv8 {
    pub fn new(config: OrtConfig, conf: f32, iou: f32, profile: bool) -> Result<Self> {
        let engine = OrtBackend::build(config)?;

        if let Some(task) = engine.task() {
            if task != "detect" {
                return Err(SortError::UnsupportedTask(task).into());
            }
        }

        // class names
        let names = engine
            .names()
            .unwrap_or_else(|| COCO_NAMES.iter().map(|s| s.to_string()).collect());
        let nc = engine.nc().unwrap_or(names.len() as u32);
        let (height, width) = (engine.height(), engine.width());

        Ok(Self {
            engine,
            nc,
            height,
            width,
            conf,
            iou,
            names,
            profile,
        })
    }

    fn scale_wh(&self, w0: f32, h0: f32, w1: f32, h1: f32) -> (f32, f32, f32) {
        let r = (w1 / w0).min(h1 / h0);
        (r, (w0 * r).round(), (h0 * r).round())
    }

    /// 等比缩放贴到左上角, 其余填充灰色
    pub fn preprocess(&mut self, xs: &[DynamicImage]) -> Result<Array<f32, IxDyn>> {
        let mut ys =
            Array::ones((xs.len(), 3, self.height as usize, self.width as usize)).into_dyn();
        ys.fill(144.0 / 255.0);
        for (idx, x) in xs.iter().enumerate() {
            let (w0, h0) = x.dimensions();
            let (_, w_new, h_new) =
                self.scale_wh(w0 as f32, h0 as f32, self.width as f32, self.height as f32);
            let img = x.resize_exact(
                w_new as u32,
                h_new as u32,
                image::imageops::FilterType::Triangle,
            );

            for (x, y, rgb) in img.pixels() {
                let x = x as usize;
                let y = y as usize;
                let [r, g, b, _] = rgb.0;
                ys[[idx, 0, y, x]] = (r as f32) / 255.0;
                ys[[idx, 1, y, x]] = (g as f32) / 255.0;
                ys[[idx, 2, y, x]] = (b as f32) / 255.0;
            }
        }

        Ok(ys)
    }

    pub fn postprocess(
        &self,
        xs: Vec<Array<f32, IxDyn>>,
        xs0: &[DynamicImage],
    ) -> Result<Vec<DetectionResult>> {
        let preds = xs.first().context("模型没有输出")?;
        let mut ys = Vec::with_capacity(xs0.len());
        for (idx, anchor) in preds.axis_iter(Axis(0)).enumerate() {
            let Some(image) = xs0.get(idx) else {
                break;
            };
            let anchor = anchor.into_dimensionality::<ndarray::Ix2>()?;
            let bboxes = decode_predictions(
                anchor,
                self.nc as usize,
                (self.width as f32, self.height as f32),
                (image.width() as f32, image.height() as f32),
                self.conf,
                self.iou,
            );
            let detections = bboxes
                .into_iter()
                .map(|bbox| {
                    let label = self
                        .names
                        .get(bbox.id())
                        .cloned()
                        .unwrap_or_else(|| format!("class_{}", bbox.id()));
                    Detection::new(label, bbox)
                })
                .collect();
            ys.push(DetectionResult::new(detections));
        }
        Ok(ys)
    }

    pub fn summary(&self) {
        info!(
            "模型: EP={:?} Dtype={:?} Batch={} Height={} ({}) Width={} ({}) nc={} conf={} iou={}",
            self.engine.ep(),
            self.engine.dtype(),
            self.engine.batch(),
            self.height,
            if self.engine.is_height_dynamic() {
                "Dynamic"
            } else {
                "Const"
            },
            self.width,
            if self.engine.is_width_dynamic() {
                "Dynamic"
            } else {
                "Const"
            },
            self.nc,
            self.conf,
            self.iou,
        );
        if !matches!(self.engine.ep(), OrtEP::CPU) {
            info!("(GPU 执行器仍可能回退到 CPU)");
        }
    }

    pub fn engine(&self) -> &OrtBackend {
        &self.engine
    }

    pub fn conf(&self) -> f32 {
        self.conf
    }

    pub fn iou(&self) -> f32 {
        self.iou
    }
}

/// 解码单张图片的检测头输出
///
/// `preds` 形状为 `[4 + nc, anchors]`, 每列为 cx, cy, w, h 及各类别分数 (输入尺寸坐标)。
/// 返回 NMS 后、缩放回原图并裁剪到图像范围内的框。
pub fn decode_predictions(
    preds: ArrayView2<f32>,
    nc: usize,
    input_wh: (f32, f32),
    original_wh: (f32, f32),
    conf: f32,
    iou: f32,
) -> Vec<Bbox> {
    let (width_original, height_original) = original_wh;
    let ratio = (input_wh.0 / width_original).min(input_wh.1 / height_original);
    let nc = nc.min(preds.nrows().saturating_sub(CXYWH_OFFSET));

    let mut data: Vec<Bbox> = Vec::new();
    for pred in preds.axis_iter(Axis(1)) {
        let bbox = pred.slice(s![0..CXYWH_OFFSET]);
        let clss = pred.slice(s![CXYWH_OFFSET..CXYWH_OFFSET + nc]);

        let Some((id, &confidence)) = clss
            .into_iter()
            .enumerate()
            .reduce(|max, x| if x.1 > max.1 { x } else { max })
        else {
            continue;
        };

        if confidence < conf {
            continue;
        }

        let cx = bbox[0] / ratio;
        let cy = bbox[1] / ratio;
        let w = bbox[2] / ratio;
        let h = bbox[3] / ratio;
        let x1 = (cx - w / 2.).clamp(0.0, width_original);
        let y1 = (cy - h / 2.).clamp(0.0, height_original);
        let x2 = (cx + w / 2.).clamp(0.0, width_original);
        let y2 = (cy + h / 2.).clamp(0.0, height_original);
        data.push(Bbox::from_xyxy(x1, y1, x2, y2, id, confidence));
    }

    non_max_suppression(&mut data, iou);
    data
}

impl super::Model for YOLOv8 {
    fn preprocess(&mut self, images: &[DynamicImage]) -> Result<Vec<Array<f32, IxDyn>>> {
        Ok(vec![YOLOv8::preprocess(self, images)?])
    }

    fn run(&mut self, xs: Vec<Array<f32, IxDyn>>, profile: bool) -> Result<Vec<Array<f32, IxDyn>>> {
        let profile = profile || self.profile;
        let mut ys = Vec::new();
        for x in xs {
            ys.extend(self.engine.run(x, profile)?);
        }
        Ok(ys)
    }

    fn postprocess(
        &self,
        xs: Vec<Array<f32, IxDyn>>,
        xs0: &[DynamicImage],
    ) -> Result<Vec<DetectionResult>> {
        YOLOv8::postprocess(self, xs, xs0)
    }

    fn forward(&mut self, images: &[DynamicImage]) -> Result<Vec<DetectionResult>> {
        let t_pre = std::time::Instant::now();
        let xs = super::Model::preprocess(self, images)?;
        if self.profile {
            println!("[Model Preprocess]: {:?}", t_pre.elapsed());
        }

        let ys = super::Model::run(self, xs, self.profile)?;

        let t_post = std::time::Instant::now();
        let ys = YOLOv8::postprocess(self, ys, images)?;
        if self.profile {
            println!("[Model Postprocess]: {:?}", t_post.elapsed());
        }
        Ok(ys)
    }

    fn names(&self) -> &[String] {
        &self.names
    }

    fn summary(&self) {
        YOLOv8::summary(self)
    }
}
