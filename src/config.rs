//! 命令行参数与分拣配置
//!
//! 分拣相关选项可以写在 JSON 配置文件里, 命令行显式给出的值覆盖文件

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ort_backend::OrtEP;

/// 分拣方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// person / no-person 两类
    Binary,
    /// 4x4 网格 16 类 + no-person
    Grid,
}

/// 多个人物时选哪一个决定网格
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersonPick {
    /// 检测列表中的第一个
    First,
    /// 置信度最高 (并列取靠前)
    Confident,
    /// 面积最大 (并列取靠前)
    Largest,
}

/// 目标目录已有同名文件时的处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// 报错, 不移动
    Fail,
    /// 覆盖已有文件
    Overwrite,
    /// 追加 _1, _2 ... 后缀
    Rename,
    /// 原图留在输入目录, 计为跳过
    Skip,
}

#[derive(Parser, Clone, Debug)]
#[command(author, version, about = "按人物检测结果分拣图片", long_about = None)]
pub struct Args {
    /// ONNX 模型路径
    #[arg(long, default_value = "yolo11n.onnx")]
    pub model: PathBuf,

    /// 加速模型路径 (缺省: <模型名>.<cpu|cuda|trt>.opt.onnx)
    #[arg(long)]
    pub accelerated: Option<PathBuf>,

    /// 即使加速模型已存在也重新导出
    #[arg(long)]
    pub force_export: bool,

    /// JSON 配置文件
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// 输入图片目录
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// 标注图片与报告输出目录
    #[arg(short, long)]
    pub results: Option<PathBuf>,

    /// 分拣方式
    #[arg(long, value_enum)]
    pub variant: Option<Variant>,

    /// 多人时的网格选取策略
    #[arg(long, value_enum)]
    pub pick: Option<PersonPick>,

    /// 同名文件处理
    #[arg(long, value_enum)]
    pub on_collision: Option<CollisionPolicy>,

    /// 目标类别名
    #[arg(long = "class")]
    pub class: Option<String>,

    /// 标注写盘线程数, 0 表示在主线程完成
    #[arg(long)]
    pub workers: Option<usize>,

    /// 标注字体 (ttf)
    #[arg(long)]
    pub font: Option<PathBuf>,

    /// 置信度阈值
    #[arg(long, default_value_t = 0.25)]
    pub conf: f32,

    /// NMS IoU 阈值
    #[arg(long, default_value_t = 0.45)]
    pub iou: f32,

    /// 使用 CUDA
    #[arg(long)]
    pub cuda: bool,

    /// 使用 TensorRT
    #[arg(long)]
    pub trt: bool,

    /// TensorRT 使用 FP16
    #[arg(long)]
    pub fp16: bool,

    /// GPU 设备号
    #[arg(long, default_value_t = 0)]
    pub device_id: i32,

    /// 输入尺寸 (缺省读取模型)
    #[arg(long)]
    pub width: Option<u32>,

    #[arg(long)]
    pub height: Option<u32>,

    /// 打印各阶段耗时
    #[arg(long)]
    pub profile: bool,

    /// debug 级别日志
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn ep(&self) -> OrtEP {
        if self.trt {
            OrtEP::Trt(self.device_id)
        } else if self.cuda {
            OrtEP::CUDA(self.device_id)
        } else {
            OrtEP::CPU
        }
    }

    /// 合并配置文件与命令行, 得到最终分拣配置
    pub fn sort_config(&self) -> Result<SortConfig> {
        let mut config = match &self.config {
            Some(path) => SortConfig::load(path)?,
            None => SortConfig::default(),
        };
        if let Some(input) = &self.input {
            config.input_dir = input.clone();
        }
        if let Some(results) = &self.results {
            config.results_dir = results.clone();
        }
        if let Some(variant) = self.variant {
            config.variant = variant;
        }
        if let Some(pick) = self.pick {
            config.pick = pick;
        }
        if let Some(policy) = self.on_collision {
            config.on_collision = policy;
        }
        if let Some(class) = &self.class {
            config.class = class.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(font) = &self.font {
            config.font = Some(font.clone());
        }
        Ok(config)
    }
}

/// 分拣配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SortConfig {
    pub input_dir: PathBuf,
    pub results_dir: PathBuf,
    pub variant: Variant,
    pub pick: PersonPick,
    pub on_collision: CollisionPolicy,
    pub class: String,
    pub workers: usize,
    pub font: Option<PathBuf>,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("images"),
            results_dir: PathBuf::from("results"),
            variant: Variant::Grid,
            pick: PersonPick::First,
            on_collision: CollisionPolicy::Fail,
            class: "person".to_string(),
            workers: 0,
            font: None,
        }
    }
}

impl SortConfig {
    /// 从 JSON 文件加载; 文件不存在时写出默认配置
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("配置文件不存在, 创建默认配置: {}", path.display());
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }
        let json = fs::read_to_string(path)
            .with_context(|| format!("读取配置失败: {}", path.display()))?;
        let config = serde_json::from_str(&json)
            .with_context(|| format!("配置文件解析失败: {}", path.display()))?;
        info!("配置已从 {} 加载", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("保存配置失败: {}", path.display()))?;
        Ok(())
    }
}
