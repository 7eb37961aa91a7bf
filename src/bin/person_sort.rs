/// 人物分拣 (Person Sort)
///
/// 批量检测输入目录中的图片, 按是否有人 (以及人物所在网格) 移入子目录
///
/// 直接运行: cargo run --release --bin person-sort -- --input images --variant grid
use anyhow::Result;
use clap::Parser;
use tracing::info;

use person_sort::annotate::Annotator;
use person_sort::logging::init_logging;
use person_sort::{Args, ModelStore, Sorter, YOLOv8};

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = args.sort_config()?;
    info!(
        "输入: {} | 结果: {} | 方式: {:?} | 选取: {:?} | 同名: {:?}",
        config.input_dir.display(),
        config.results_dir.display(),
        config.variant,
        config.pick,
        config.on_collision
    );

    // 1. 模型: 首次运行导出加速模型
    let mut store = ModelStore::new(&args.model, args.ep())
        .with_fp16(args.fp16)
        .with_image_size(args.height, args.width);
    if let Some(accelerated) = &args.accelerated {
        store = store.with_accelerated(accelerated);
    }
    let model_path = store.resolve(args.force_export)?;
    let model = YOLOv8::new(store.ort_config(model_path), args.conf, args.iou, args.profile)?;
    model.summary();

    // 2. 标注字体
    let annotator = Annotator::load(config.font.as_deref());

    // 3. 分拣
    let mut sorter = Sorter::new(model, config, annotator);
    let summary = sorter.run()?;
    println!(
        "✅ 处理 {} 张 | 人物 {} | 无人物 {} | 报告 {}",
        summary.processed,
        summary.distribution.person(),
        summary.distribution.no_person(),
        summary.report.display()
    );

    Ok(())
}
