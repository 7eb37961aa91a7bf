//! 模型导出与缓存
//!
//! 首次运行时把可移植的 ONNX 模型经 ONNX Runtime 优化后写到加速模型路径
//! (缺省 `<模型名>.<执行器>.opt.onnx`),
//! 之后直接加载加速模型。TensorRT 执行器额外使用 `<模型名>.engine/` 缓存引擎。

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::ort_backend::sibling_path;
use crate::{OrtBackend, OrtConfig, OrtEP, SortError};

pub struct ModelStore {
    portable: PathBuf,
    accelerated: PathBuf,
    ep: OrtEP,
    trt_fp16: bool,
    image_size: (Option<u32>, Option<u32>),
}

impl ModelStore {
    pub fn new(portable: impl Into<PathBuf>, ep: OrtEP) -> Self {
        let portable = portable.into();
        let accelerated = sibling_path(&portable, &format!(".{}.opt.onnx", ep.tag()));
        Self {
            portable,
            accelerated,
            ep,
            trt_fp16: false,
            image_size: (None, None),
        }
    }

    pub fn with_accelerated(mut self, accelerated: impl Into<PathBuf>) -> Self {
        self.accelerated = accelerated.into();
        self
    }

    pub fn with_fp16(mut self, fp16: bool) -> Self {
        self.trt_fp16 = fp16;
        self
    }

    /// (height, width)
    pub fn with_image_size(mut self, height: Option<u32>, width: Option<u32>) -> Self {
        self.image_size = (height, width);
        self
    }

    pub fn portable(&self) -> &Path {
        &self.portable
    }

    pub fn accelerated(&self) -> &Path {
        &self.accelerated
    }

    pub fn trt_cache(&self) -> PathBuf {
        sibling_path(&self.portable, ".engine")
    }

    /// 返回可直接加载的加速模型路径, 必要时先导出
    pub fn resolve(&self, force_export: bool) -> Result<PathBuf> {
        if self.accelerated.is_file() && !force_export {
            info!("使用已导出的加速模型: {}", self.accelerated.display());
            return Ok(self.accelerated.clone());
        }
        if !self.portable.is_file() {
            return Err(SortError::ModelMissing(self.portable.clone()).into());
        }
        self.export()?;
        Ok(self.accelerated.clone())
    }

    /// 加载模型用的 ORT 配置
    pub fn ort_config(&self, f: impl Into<PathBuf>) -> OrtConfig {
        OrtConfig {
            f: f.into(),
            ep: self.ep,
            trt_fp16: self.trt_fp16,
            trt_cache: match self.ep {
                OrtEP::Trt(_) => Some(self.trt_cache()),
                _ => None,
            },
            image_size: self.image_size,
        }
    }

    fn export(&self) -> Result<()> {
        info!(
            "导出加速模型: {} → {}",
            self.portable.display(),
            self.accelerated.display()
        );
        let t = std::time::Instant::now();

        if let Some(parent) = self.accelerated.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let config = self.ort_config(&self.portable);
        if let Some(cache) = &config.trt_cache {
            fs::create_dir_all(cache)
                .with_context(|| format!("创建引擎缓存目录失败: {}", cache.display()))?;
        }

        // 先写临时文件, 成功后再改名, 避免中断留下半个模型
        let staging = sibling_path(&self.accelerated, ".partial");
        let (builder, _) = OrtBackend::session_builder(&config)?;
        let session = builder
            .with_optimized_model_path(staging.to_string_lossy().to_string())?
            .commit_from_file(&self.portable)
            .with_context(|| format!("模型转换失败: {}", self.portable.display()))?;
        drop(session);

        if !staging.is_file() {
            return Err(SortError::ExportFailed(self.accelerated.clone()).into());
        }
        fs::rename(&staging, &self.accelerated)?;
        info!("导出完成, 耗时 {:?}", t.elapsed());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_artifact_paths() {
        let store = ModelStore::new("weights/yolo11n.onnx", OrtEP::CPU);
        assert_eq!(store.accelerated(), Path::new("weights/yolo11n.cpu.opt.onnx"));
        assert_eq!(store.trt_cache(), PathBuf::from("weights/yolo11n.engine"));
    }

    #[test]
    fn test_accelerated_model_is_per_provider() {
        let cpu = ModelStore::new("yolo11n.onnx", OrtEP::CPU);
        let cuda = ModelStore::new("yolo11n.onnx", OrtEP::CUDA(0));
        let trt = ModelStore::new("yolo11n.onnx", OrtEP::Trt(1));
        assert_eq!(cuda.accelerated(), Path::new("yolo11n.cuda.opt.onnx"));
        assert_eq!(trt.accelerated(), Path::new("yolo11n.trt.opt.onnx"));
        assert_ne!(cpu.accelerated(), cuda.accelerated());

        // CPU 导出的文件不会被 CUDA 复用
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("yolo11n.cpu.opt.onnx"), b"cached").unwrap();
        let store = ModelStore::new(dir.path().join("yolo11n.onnx"), OrtEP::CUDA(0));
        assert!(matches!(
            store.resolve(false).unwrap_err().downcast_ref::<SortError>(),
            Some(SortError::ModelMissing(_))
        ));
    }

    #[test]
    fn test_existing_accelerated_model_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let accelerated = dir.path().join("yolo11n.cpu.opt.onnx");
        fs::write(&accelerated, b"cached").unwrap();

        // 可移植模型不存在也没关系
        let store = ModelStore::new(dir.path().join("yolo11n.onnx"), OrtEP::CPU);
        assert_eq!(store.resolve(false).unwrap(), accelerated);
    }

    #[test]
    fn test_missing_model_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("missing.onnx"), OrtEP::CPU);
        let err = store.resolve(false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SortError>(),
            Some(SortError::ModelMissing(_))
        ));
    }

    #[test]
    fn test_trt_config_carries_engine_cache() {
        let store = ModelStore::new("yolo11n.onnx", OrtEP::Trt(0)).with_fp16(true);
        let config = store.ort_config(store.accelerated());
        assert_eq!(config.trt_cache, Some(PathBuf::from("yolo11n.engine")));
        assert!(config.trt_fp16);
        let cpu = ModelStore::new("yolo11n.onnx", OrtEP::CPU);
        assert!(cpu.ort_config("yolo11n.onnx").trt_cache.is_none());
    }
}
