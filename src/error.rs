//! 错误处理

use std::path::PathBuf;

use thiserror::Error;

/// 调用方需要区分的失败情形; 其余错误经 anyhow 附加上下文后传递
#[derive(Error, Debug)]
pub enum SortError {
    #[error("模型文件不存在: {0}")]
    ModelMissing(PathBuf),

    #[error("模型导出失败: {0} 未生成")]
    ExportFailed(PathBuf),

    #[error("不支持的模型任务: {0} (仅支持 detect)")]
    UnsupportedTask(String),

    #[error("无法读取图片 {path}: {source}")]
    UnreadableImage {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("图片尺寸为零: {width}x{height}")]
    EmptyFrame { width: u32, height: u32 },

    #[error("目标文件已存在: {0}")]
    Collision(PathBuf),

    #[error("无效路径: {0}")]
    InvalidPath(PathBuf),
}

pub type SortResult<T> = Result<T, SortError>;
