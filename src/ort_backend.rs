// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// ONNX Runtime 推理后端
// 负责: 执行器选择、会话创建、元数据读取、f32/f16 前向

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::{Array, IxDyn};
use ort::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider, ExecutionProviderDispatch,
    GraphOptimizationLevel, Session, SessionBuilder, TensorElementType,
    TensorRTExecutionProvider, ValueType,
};
use regex::Regex;
use tracing::{debug, warn};

/// 默认输入尺寸 (模型为动态尺寸且未指定时使用)
pub const DEFAULT_IMAGE_SIZE: u32 = 640;

/// 执行器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrtEP {
    CPU,
    CUDA(i32),
    Trt(i32),
}

impl OrtEP {
    /// 导出文件名中的执行器标记, 优化后的图与执行器相关
    pub fn tag(&self) -> &'static str {
        match self {
            OrtEP::CPU => "cpu",
            OrtEP::CUDA(_) => "cuda",
            OrtEP::Trt(_) => "trt",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrtConfig {
    pub f: PathBuf,
    pub ep: OrtEP,
    pub trt_fp16: bool,
    /// TensorRT 引擎缓存目录
    pub trt_cache: Option<PathBuf>,
    /// (height, width)
    pub image_size: (Option<u32>, Option<u32>),
}

impl OrtConfig {
    pub fn new(f: impl Into<PathBuf>, ep: OrtEP) -> Self {
        Self {
            f: f.into(),
            ep,
            trt_fp16: false,
            trt_cache: None,
            image_size: (None, None),
        }
    }
}

pub struct OrtBackend {
    session: Session,
    ep: OrtEP,
    dtype: TensorElementType,
    batch: u32,
    height: u32,
    width: u32,
    height_dynamic: bool,
    width_dynamic: bool,
}

impl OrtBackend {
    /// 按配置创建会话构建器 (已注册执行器)
    pub fn session_builder(config: &OrtConfig) -> Result<(SessionBuilder, OrtEP)> {
        let (providers, ep) = Self::providers(config);
        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_execution_providers(providers)?;
        Ok((builder, ep))
    }

    pub fn build(config: OrtConfig) -> Result<Self> {
        let (builder, ep) = Self::session_builder(&config)?;
        let session = builder
            .commit_from_file(&config.f)
            .with_context(|| format!("加载模型失败: {}", config.f.display()))?;

        // 输入: [batch, 3, height, width]
        let input = session
            .inputs
            .first()
            .context("模型没有输入")?;
        let (dtype, dims) = match &input.input_type {
            ValueType::Tensor { ty, dimensions, .. } => (*ty, dimensions.clone()),
            other => anyhow::bail!("不支持的输入类型: {:?}", other),
        };
        if dims.len() != 4 {
            anyhow::bail!("输入维度应为 4, 实际 {:?}", dims);
        }

        let imgsz = Self::parse_imgsz(&session);
        let (height, height_dynamic) =
            Self::resolve_dim(dims[2], config.image_size.0, imgsz.map(|s| s.0));
        let (width, width_dynamic) =
            Self::resolve_dim(dims[3], config.image_size.1, imgsz.map(|s| s.1));
        let batch = if dims[0] > 0 { dims[0] as u32 } else { 1 };

        debug!(
            "模型输入 {} {:?}: batch={} height={} width={}",
            input.name, dtype, batch, height, width
        );

        Ok(Self {
            session,
            ep,
            dtype,
            batch,
            height,
            width,
            height_dynamic,
            width_dynamic,
        })
    }

    fn providers(config: &OrtConfig) -> (Vec<ExecutionProviderDispatch>, OrtEP) {
        match config.ep {
            OrtEP::Trt(device_id) => {
                let mut trt = TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .with_fp16(config.trt_fp16);
                if let Some(cache) = &config.trt_cache {
                    trt = trt
                        .with_engine_cache(true)
                        .with_engine_cache_path(cache.to_string_lossy().to_string());
                }
                if let Ok(true) = trt.is_available() {
                    (
                        vec![
                            trt.build(),
                            CUDAExecutionProvider::default()
                                .with_device_id(device_id)
                                .build(),
                        ],
                        OrtEP::Trt(device_id),
                    )
                } else {
                    warn!("TensorRT 不可用, 回退到 CPU");
                    (vec![CPUExecutionProvider::default().build()], OrtEP::CPU)
                }
            }
            OrtEP::CUDA(device_id) => {
                let cuda = CUDAExecutionProvider::default().with_device_id(device_id);
                if let Ok(true) = cuda.is_available() {
                    (vec![cuda.build()], OrtEP::CUDA(device_id))
                } else {
                    warn!("CUDA 不可用, 回退到 CPU");
                    (vec![CPUExecutionProvider::default().build()], OrtEP::CPU)
                }
            }
            OrtEP::CPU => (vec![CPUExecutionProvider::default().build()], OrtEP::CPU),
        }
    }

    /// 维度优先级: 模型固定值 > 命令行 > 元数据 imgsz > 640
    fn resolve_dim(dim: i64, arg: Option<u32>, meta: Option<u32>) -> (u32, bool) {
        if dim > 0 {
            (dim as u32, false)
        } else {
            (arg.or(meta).unwrap_or(DEFAULT_IMAGE_SIZE), true)
        }
    }

    pub fn run(&mut self, xs: Array<f32, IxDyn>, profile: bool) -> Result<Vec<Array<f32, IxDyn>>> {
        let t = std::time::Instant::now();
        let ys = match self.dtype {
            TensorElementType::Float16 => self.run_fp16(xs)?,
            TensorElementType::Float32 => self.run_fp32(xs)?,
            other => anyhow::bail!("不支持的输入精度: {:?}", other),
        };
        if profile {
            println!("[ORT {:?}]: {:?}", self.ep, t.elapsed());
        }
        Ok(ys)
    }

    fn run_fp32(&mut self, xs: Array<f32, IxDyn>) -> Result<Vec<Array<f32, IxDyn>>> {
        let outputs = self.session.run(ort::inputs![xs.view()]?)?;
        let mut ys = Vec::with_capacity(self.session.outputs.len());
        for output in self.session.outputs.iter() {
            let y = outputs[output.name.as_str()].try_extract_tensor::<f32>()?;
            ys.push(y.view().into_owned());
        }
        Ok(ys)
    }

    fn run_fp16(&mut self, xs: Array<f32, IxDyn>) -> Result<Vec<Array<f32, IxDyn>>> {
        let xs = xs.mapv(half::f16::from_f32);
        let outputs = self.session.run(ort::inputs![xs.view()]?)?;
        let mut ys = Vec::with_capacity(self.session.outputs.len());
        for output in self.session.outputs.iter() {
            let y = outputs[output.name.as_str()].try_extract_tensor::<half::f16>()?;
            ys.push(y.mapv(half::f16::to_f32));
        }
        Ok(ys)
    }

    /// 输出第二维 = 4 + nc
    pub fn nc(&self) -> Option<u32> {
        let output = self.session.outputs.first()?;
        match &output.output_type {
            ValueType::Tensor { dimensions, .. } if dimensions.len() == 3 && dimensions[1] > 4 => {
                Some(dimensions[1] as u32 - 4)
            }
            _ => None,
        }
    }

    /// 元数据中的类别名, 形如 {0: 'person', 1: 'bicycle'}
    pub fn names(&self) -> Option<Vec<String>> {
        let names = self.fetch_from_metadata("names")?;
        parse_names(&names)
    }

    pub fn task(&self) -> Option<String> {
        self.fetch_from_metadata("task")
    }

    fn parse_imgsz(session: &Session) -> Option<(u32, u32)> {
        let imgsz = session.metadata().ok()?.custom("imgsz").ok()??;
        parse_imgsz(&imgsz)
    }

    pub fn fetch_from_metadata(&self, key: &str) -> Option<String> {
        match self.session.metadata() {
            Err(_) => None,
            Ok(metadata) => metadata.custom(key).unwrap_or(None),
        }
    }

    pub fn ep(&self) -> &OrtEP {
        &self.ep
    }

    pub fn dtype(&self) -> TensorElementType {
        self.dtype
    }

    pub fn batch(&self) -> u32 {
        self.batch
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn is_height_dynamic(&self) -> bool {
        self.height_dynamic
    }

    pub fn is_width_dynamic(&self) -> bool {
        self.width_dynamic
    }
}

/// 解析 Ultralytics 导出的 names 元数据
pub fn parse_names(names: &str) -> Option<Vec<String>> {
    let re = Regex::new(r#"(['"])([-()\w '"]+)(['"])"#).ok()?;
    let names_: Vec<String> = re
        .captures_iter(names)
        .map(|c| c.extract::<3>().1[1].to_string())
        .collect();
    if names_.is_empty() {
        None
    } else {
        Some(names_)
    }
}

/// 解析 imgsz 元数据, 形如 [640, 640]
pub fn parse_imgsz(imgsz: &str) -> Option<(u32, u32)> {
    let re = Regex::new(r"(\d+)\D+(\d+)").ok()?;
    let caps = re.captures(imgsz)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

/// 模型文件同目录下的派生路径, 如 yolo11n.onnx -> yolo11n.cpu.opt.onnx
pub fn sibling_path(model: &Path, suffix: &str) -> PathBuf {
    let stem = model
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "model".to_string());
    model.with_file_name(format!("{}{}", stem, suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names_from_metadata() {
        let names = parse_names("{0: 'person', 1: 'bicycle', 2: 'traffic light'}").unwrap();
        assert_eq!(names, vec!["person", "bicycle", "traffic light"]);
        assert!(parse_names("{}").is_none());
    }

    #[test]
    fn test_parse_imgsz() {
        assert_eq!(parse_imgsz("[640, 640]"), Some((640, 640)));
        assert_eq!(parse_imgsz("[480, 640]"), Some((480, 640)));
        assert_eq!(parse_imgsz("640"), None);
    }

    #[test]
    fn test_resolve_dim_prefers_fixed_shape() {
        assert_eq!(OrtBackend::resolve_dim(320, Some(640), None), (320, false));
        assert_eq!(OrtBackend::resolve_dim(-1, Some(512), Some(640)), (512, true));
        assert_eq!(OrtBackend::resolve_dim(-1, None, Some(480)), (480, true));
        assert_eq!(OrtBackend::resolve_dim(-1, None, None), (640, true));
    }

    #[test]
    fn test_sibling_path() {
        let p = sibling_path(Path::new("weights/yolo11n.onnx"), ".cpu.opt.onnx");
        assert_eq!(p, PathBuf::from("weights/yolo11n.cpu.opt.onnx"));
        let p = sibling_path(Path::new("yolo11n.onnx"), ".engine");
        assert_eq!(p, PathBuf::from("yolo11n.engine"));
    }
}
