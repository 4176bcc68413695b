/// 农作物品质分拣 (Produce Sorter)
///
/// 子命令:
/// - detect:   单张图片检测, 输出JSON
/// - catalog:  列出作物图片目录
/// - annotate: 去背图片生成YOLO数据集
/// - belt:     无界面输送带模拟 (检测在独立推理线程中执行)
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use image::Rgba;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use produce_sorter::annotate::annotate_dir;
use produce_sorter::belt::{Belt, BeltConfig};
use produce_sorter::catalog::AssetCatalog;
use produce_sorter::config::Command;
use produce_sorter::detection::DetectorConfig;
use produce_sorter::{
    gen_time_string, Args, ClassName, DetectionBox, Detector, InferenceWorker, PixelFrame,
    SorterConfig,
};

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = SorterConfig::load(&args.config);
    config.apply_args(&args);
    config.validate()?;

    match &args.command {
        Command::Detect { image, save } => detect(&config, image, save.as_deref()),
        Command::Catalog => {
            let catalog = AssetCatalog::scan(&config.images_dir)?;
            println!("{}", serde_json::to_string_pretty(&catalog)?);
            Ok(())
        }
        Command::Annotate {
            src,
            out,
            val_ratio,
            seed,
        } => {
            let report = annotate_dir(src, out, *val_ratio, *seed)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Belt { ticks } => belt(&config, *ticks),
    }
}

fn detect(config: &SorterConfig, image_path: &Path, save: Option<&Path>) -> Result<()> {
    config.print_summary();

    let detector = Detector::new(DetectorConfig::from(config));
    detector.load(&config.model_source())?;

    let img = image::open(image_path)
        .with_context(|| format!("failed to open {}", image_path.display()))?;
    let t = Instant::now();
    let ys = detector.infer(&PixelFrame::from_image(&img))?;
    log::info!("🔍 {} boxes in {:?}", ys.len(), t.elapsed());

    println!("{}", serde_json::to_string_pretty(&ys)?);

    if let Some(save) = save {
        let path = if save.is_dir() {
            save.join(format!("{}.png", gen_time_string("-")))
        } else {
            save.to_path_buf()
        };
        let mut canvas = img.to_rgba8();
        draw_boxes(&mut canvas, &ys);
        canvas.save(&path)?;
        log::info!("💾 已保存: {}", path.display());
    }
    Ok(())
}

fn draw_boxes(canvas: &mut image::RgbaImage, ys: &[DetectionBox]) {
    let (w, h) = canvas.dimensions();
    for det in ys {
        let color = match det.class_name() {
            ClassName::Healthy => Rgba([0, 200, 80, 255]),
            ClassName::Diseased => Rgba([230, 40, 40, 255]),
        };
        let x = det.x1().max(0.0) as u32;
        let y = det.y1().max(0.0) as u32;
        let bw = (det.width() as u32).min(w.saturating_sub(x));
        let bh = (det.height() as u32).min(h.saturating_sub(y));

        // 线宽 2
        for t in 0..2u32 {
            let (iw, ih) = (bw.saturating_sub(2 * t), bh.saturating_sub(2 * t));
            if iw > 0 && ih > 0 {
                let rect = Rect::at((x + t) as i32, (y + t) as i32).of_size(iw, ih);
                draw_hollow_rect_mut(canvas, rect, color);
            }
        }
    }
}

fn belt(config: &SorterConfig, ticks: u64) -> Result<()> {
    config.print_summary();

    let catalog = AssetCatalog::scan(&config.images_dir)?;
    if catalog.is_empty() {
        log::warn!("⚠️  图片目录为空, 使用生成的替代图像");
    }

    let detector = Arc::new(Detector::new(DetectorConfig::from(config)));
    let mut client =
        InferenceWorker::spawn(detector, config.model_source(), config.queue_capacity)?;

    let seed = chrono::Local::now().timestamp_millis() as u64;
    let mut belt = Belt::new(BeltConfig::from(config), catalog, seed);
    let frame_time = Duration::from_secs_f64(1.0 / config.tick_rate as f64);

    log::info!("🚚 输送带启动: {} ticks @ {}Hz", ticks, config.tick_rate);
    let start = Instant::now();
    for _ in 0..ticks {
        let t = Instant::now();
        for (id, outcome) in belt.step(&client) {
            log::info!("📦 #{} -> {:?}", id, outcome);
        }
        if let Some(rest) = frame_time.checked_sub(t.elapsed()) {
            std::thread::sleep(rest);
        }
    }
    client.shutdown();

    let score = belt.score();
    log::info!("🏁 模拟结束 ({:.1}s)", start.elapsed().as_secs_f64());
    log::info!(
        "  正确: {} | 错误: {} | 漏检: {} (放弃检测 {}) | 准确率: {:.1}%",
        score.correct,
        score.wrong,
        score.missed,
        score.exhausted,
        score.accuracy() * 100.0
    );
    println!("{}", serde_json::to_string_pretty(score)?);
    Ok(())
}
