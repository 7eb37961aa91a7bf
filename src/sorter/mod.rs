/// 图片分拣系统 (Sorter)
///
/// 流程: 扫描输入目录 → 逐张推理 → 绘制标注 → 决定类别 → 移动原图 → 统计
/// - enumerate:  输入目录扫描
/// - grid:       4x4 网格划分
/// - distribute: 类别决策与文件移动
/// - report:     分布统计与报告
pub mod distribute;
pub mod enumerate;
pub mod grid;
pub mod report;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Sender;
use image::{DynamicImage, GenericImageView, ImageReader};
use tracing::{debug, info};

use crate::annotate::Annotator;
use crate::config::SortConfig;
use crate::error::SortError;
use crate::models::Model;
use crate::DetectionResult;
pub use distribute::{Bucket, Distributor, MoveOutcome};
pub use report::Distribution;

/// 单张图片的处理记录
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub result: DetectionResult,
    pub bucket: Bucket,
    pub outcome: MoveOutcome,
}

/// 一次运行的结果
#[derive(Debug)]
pub struct RunSummary {
    pub processed: usize,
    pub distribution: Distribution,
    pub report: PathBuf,
}

/// 运行上下文: 模型句柄与计数器只在主线程持有
pub struct Sorter<M: Model> {
    model: M,
    config: SortConfig,
    distributor: Distributor,
    annotator: Arc<Annotator>,
    distribution: Distribution,
}

impl<M: Model> Sorter<M> {
    pub fn new(model: M, config: SortConfig, annotator: Annotator) -> Self {
        Self {
            model,
            distributor: Distributor::new(&config),
            distribution: Distribution::new(config.variant),
            annotator: Arc::new(annotator),
            config,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn distribution(&self) -> &Distribution {
        &self.distribution
    }

    /// 处理输入目录中的全部图片, 任一图片失败即终止
    pub fn run(&mut self) -> Result<RunSummary> {
        let t = Instant::now();
        fs::create_dir_all(&self.config.results_dir).with_context(|| {
            format!("创建结果目录失败: {}", self.config.results_dir.display())
        })?;
        self.distributor.prepare()?;

        let images = enumerate::list_images(&self.config.input_dir)?;
        info!(
            "{} 张图片待处理 ({})",
            images.len(),
            self.config.input_dir.display()
        );

        let mut sink = AnnotationSink::new(
            self.annotator.clone(),
            self.config.results_dir.clone(),
            self.config.workers,
        );
        let total = images.len();
        let mut processed = 0;
        for (i, path) in images.iter().enumerate() {
            let record = match self.process(path, &mut sink) {
                Ok(record) => record,
                Err(e) => {
                    // 已提交的标注任务仍需收尾, 但以当前错误为准
                    let _ = sink.finish();
                    return Err(e);
                }
            };
            processed += 1;
            info!(
                "[{}/{}] {} → {} ({} 个检测)",
                i + 1,
                total,
                file_label(path),
                record.bucket,
                record.result.detections.len()
            );
        }
        sink.finish()?;

        let report = self.distribution.write(&self.config.results_dir)?;
        self.distribution.print();
        info!(
            "完成: {} 张, 耗时 {:?}, 报告 {}",
            processed,
            t.elapsed(),
            report.display()
        );

        Ok(RunSummary {
            processed,
            distribution: self.distribution.clone(),
            report,
        })
    }

    /// 单张: 读取 → 推理 → 标注 → 决策 → 移动 → 计数
    pub fn process(&mut self, path: &Path, sink: &mut AnnotationSink) -> Result<ImageRecord> {
        let image = open_image(path)?;
        let (width, height) = image.dimensions();

        let result = self
            .model
            .forward(std::slice::from_ref(&image))?
            .into_iter()
            .next()
            .unwrap_or_default();
        debug!("{}: {}x{} {:?}", file_label(path), width, height, result);

        let bucket = self.distributor.decide(&result, width, height)?;
        sink.submit(image, result.clone(), path.to_path_buf())?;

        let outcome = self.distributor.dispatch(path, bucket)?;
        match outcome {
            MoveOutcome::Moved(_) => self.distribution.record(bucket),
            MoveOutcome::Skipped => self.distribution.record_skipped(),
        }

        Ok(ImageRecord {
            path: path.to_path_buf(),
            width,
            height,
            result,
            bucket,
            outcome,
        })
    }
}

/// 按文件内容识别格式解码, 扩展名只作兜底
fn open_image(path: &Path) -> Result<DynamicImage, SortError> {
    let unreadable = |source: image::ImageError| SortError::UnreadableImage {
        path: path.to_path_buf(),
        source,
    };
    ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|e| unreadable(image::ImageError::IoError(e)))?
        .decode()
        .map_err(unreadable)
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// 线程池中的一次标注任务
pub struct AnnotationJob {
    image: DynamicImage,
    result: DetectionResult,
    src: PathBuf,
}

/// 标注写盘: workers == 0 时在主线程完成, 否则交给线程池
pub enum AnnotationSink {
    Inline {
        annotator: Arc<Annotator>,
        results_dir: PathBuf,
    },
    Pool {
        tx: Option<Sender<AnnotationJob>>,
        handles: Vec<JoinHandle<Result<()>>>,
    },
}

impl AnnotationSink {
    pub fn new(annotator: Arc<Annotator>, results_dir: PathBuf, workers: usize) -> Self {
        if workers == 0 {
            return AnnotationSink::Inline {
                annotator,
                results_dir,
            };
        }

        let (tx, rx) = crossbeam_channel::bounded::<AnnotationJob>(workers * 2);
        let handles = (0..workers)
            .map(|_| {
                let rx = rx.clone();
                let annotator = annotator.clone();
                let results_dir = results_dir.clone();
                std::thread::spawn(move || -> Result<()> {
                    for job in rx.iter() {
                        annotator.save(&job.image, &job.result, &job.src, &results_dir)?;
                    }
                    Ok(())
                })
            })
            .collect();
        AnnotationSink::Pool {
            tx: Some(tx),
            handles,
        }
    }

    fn submit(&mut self, image: DynamicImage, result: DetectionResult, src: PathBuf) -> Result<()> {
        match self {
            AnnotationSink::Inline {
                annotator,
                results_dir,
            } => {
                annotator.save(&image, &result, &src, results_dir)?;
                return Ok(());
            }
            AnnotationSink::Pool { tx, .. } => {
                let job = AnnotationJob { image, result, src };
                let sent = tx.as_ref().map(|tx| tx.send(job).is_ok()).unwrap_or(false);
                if sent {
                    return Ok(());
                }
            }
        }
        // 所有线程都已退出, 取回它们的错误
        self.finish()?;
        Err(anyhow!("标注线程已退出"))
    }

    /// 等待全部标注完成, 返回第一个线程错误
    pub fn finish(&mut self) -> Result<()> {
        if let AnnotationSink::Pool { tx, handles } = self {
            tx.take();
            let mut first_err = None;
            for handle in handles.drain(..) {
                let res = handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("标注线程 panic")));
                if let Err(e) = res {
                    first_err.get_or_insert(e);
                }
            }
            if let Some(e) = first_err {
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};

    #[test]
    fn test_open_image_detects_format_from_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        DynamicImage::ImageRgb8(RgbImage::new(12, 7))
            .save_with_format(&path, ImageFormat::Png)
            .unwrap();
        assert_eq!(open_image(&path).unwrap().dimensions(), (12, 7));

        let broken = dir.path().join("broken.png");
        fs::write(&broken, b"not an image").unwrap();
        assert!(matches!(
            open_image(&broken),
            Err(SortError::UnreadableImage { .. })
        ));
    }

    #[test]
    fn test_pool_sink_writes_all_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = AnnotationSink::new(
            Arc::new(Annotator::new(None)),
            dir.path().to_path_buf(),
            3,
        );
        for i in 0..10 {
            let image = DynamicImage::ImageRgb8(RgbImage::new(8, 8));
            sink.submit(
                image,
                DetectionResult::default(),
                PathBuf::from(format!("img_{}.png", i)),
            )
            .unwrap();
        }
        sink.finish().unwrap();
        for i in 0..10 {
            assert!(dir.path().join(format!("detected_img_{}.png", i)).is_file());
        }
    }

    #[test]
    fn test_pool_sink_reports_worker_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-dir");
        let mut sink = AnnotationSink::new(Arc::new(Annotator::new(None)), missing, 1);
        let image = DynamicImage::ImageRgb8(RgbImage::new(8, 8));
        let _ = sink.submit(image, DetectionResult::default(), PathBuf::from("a.png"));
        assert!(sink.finish().is_err());
    }
}
