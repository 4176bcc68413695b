//! 去背图片自动标注
//! 透明通道外接矩形 → YOLO 格式标注 (归一化中心点 + 宽高), 并按比例划分训练/验证集

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;

use crate::catalog::is_image_file;
use crate::detection::types::ClassName;
use crate::error::Result;

/// 无透明通道时的灰度前景阈值
pub const LUMA_THRESHOLD: u8 = 10;

/// 前景外接矩形, YOLO 归一化 `[x_center, y_center, width, height]`
///
/// 有透明通道: alpha > 0 为前景; 否则灰度 > 10 为前景。没有前景返回 None。
pub fn alpha_bbox(img: &DynamicImage) -> Option<[f32; 4]> {
    let (w, h) = (img.width(), img.height());
    if w == 0 || h == 0 {
        return None;
    }

    let mask: Box<dyn Fn(u32, u32) -> bool> = if img.color().has_alpha() {
        let rgba = img.to_rgba8();
        Box::new(move |x, y| rgba.get_pixel(x, y)[3] > 0)
    } else {
        let luma = img.to_luma8();
        Box::new(move |x, y| luma.get_pixel(x, y)[0] > LUMA_THRESHOLD)
    };

    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for y in 0..h {
        for x in 0..w {
            if !mask(x, y) {
                continue;
            }
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((l, t, r, b)) => (l.min(x), t.min(y), r.max(x), b.max(y)),
            });
        }
    }

    let (l, t, r, b) = bounds?;
    let (bw, bh) = ((r - l + 1) as f32, (b - t + 1) as f32);
    Some([
        (l as f32 + bw / 2.0) / w as f32,
        (t as f32 + bh / 2.0) / h as f32,
        bw / w as f32,
        bh / h as f32,
    ])
}

/// 一行 YOLO 标注
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YoloLabel {
    pub class: ClassName,
    pub bbox: [f32; 4],
}

impl fmt::Display for YoloLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [xc, yc, w, h] = self.bbox;
        write!(f, "{} {:.6} {:.6} {:.6} {:.6}", self.class.id(), xc, yc, w, h)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AnnotateReport {
    pub total: usize,
    pub annotated: usize,
    pub train: usize,
    pub val: usize,
    pub failed: Vec<PathBuf>,
}

#[derive(Serialize)]
struct DatasetManifest {
    path: String,
    train: &'static str,
    val: &'static str,
    names: BTreeMap<usize, &'static str>,
}

/// 由 `<src>/healthy`, `<src>/diseased` 生成 YOLO 数据集
///
/// 输出: `images/{train,val}`, `labels/{train,val}`, `dataset.json`
pub fn annotate_dir(src: &Path, out: &Path, val_ratio: f32, seed: u64) -> Result<AnnotateReport> {
    for split in ["train", "val"] {
        fs::create_dir_all(out.join("images").join(split))?;
        fs::create_dir_all(out.join("labels").join(split))?;
    }

    log::info!("🏷️  自动标注: {} → {}", src.display(), out.display());

    let mut rng = StdRng::seed_from_u64(seed);
    let mut report = AnnotateReport::default();

    for class in [ClassName::Healthy, ClassName::Diseased] {
        let folder = src.join(class.as_str());
        if !folder.is_dir() {
            log::warn!("⚠️  找不到文件夹: {}", folder.display());
            continue;
        }

        let mut files: Vec<PathBuf> = fs::read_dir(&folder)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_image_file(p))
            .collect();
        files.sort();
        files.shuffle(&mut rng);

        let val_count = (files.len() as f32 * val_ratio.clamp(0.0, 1.0)) as usize;
        log::info!(
            "[{}] 总共 {} | 训练 {} | 验证 {}",
            class,
            files.len(),
            files.len() - val_count,
            val_count
        );

        for (i, file) in files.iter().enumerate() {
            let split = if i < val_count { "val" } else { "train" };
            report.total += 1;
            match annotate_image(file, class, &out.join("images").join(split), &out.join("labels").join(split)) {
                Ok(true) => {
                    report.annotated += 1;
                    if split == "val" {
                        report.val += 1;
                    } else {
                        report.train += 1;
                    }
                }
                Ok(false) => report.failed.push(file.clone()),
                Err(e) => {
                    log::warn!("⚠️  {}: {}", file.display(), e);
                    report.failed.push(file.clone());
                }
            }
        }
    }

    let manifest = DatasetManifest {
        path: out.display().to_string(),
        train: "images/train",
        val: "images/val",
        names: ClassName::ALL.iter().map(|c| (c.id(), c.as_str())).collect(),
    };
    fs::write(out.join("dataset.json"), serde_json::to_string_pretty(&manifest)?)?;

    log::info!(
        "✅ 完成: 总图片 {} | 成功标注 {} | 失败 {}",
        report.total,
        report.annotated,
        report.failed.len()
    );
    for f in report.failed.iter().take(10) {
        log::warn!("  - {}", f.display());
    }

    Ok(report)
}

/// 复制为 png 并写出标注, 没有前景时返回 false
fn annotate_image(path: &Path, class: ClassName, images_dir: &Path, labels_dir: &Path) -> Result<bool> {
    let img = image::open(path)?;
    let Some(bbox) = alpha_bbox(&img) else {
        return Ok(false);
    };

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
    let name = format!("{}_{}", class, stem);

    img.save(images_dir.join(format!("{}.png", name)))?;
    let label = YoloLabel { class, bbox };
    fs::write(labels_dir.join(format!("{}.txt", name)), format!("{}\n", label))?;
    Ok(true)
}
