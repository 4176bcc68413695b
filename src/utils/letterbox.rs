/// Letterbox 预处理与坐标还原
///
/// 等比缩放原图后居中放入 `target × target` 画布, 空白区域填充 0.5 灰度,
/// 输出 NCHW 平面 RGB 张量 `[1, 3, S, S]`, 数值归一化到 [0, 1]。
/// 检测框经 `(coord - offset) / scale` 映射回原图并裁剪到原图边界。
use image::{imageops, RgbaImage};
use ndarray::Array4;

use crate::detection::types::{DetectionBox, PAD_VALUE};

/// 单张图片的 letterbox 参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxTransform {
    pub scale: f32,
    pub offset_x: f32,
    pub offset_y: f32,
    pub original_width: u32,
    pub original_height: u32,
    /// 缩放后图像在画布中的实际尺寸
    pub resized_width: u32,
    pub resized_height: u32,
}

impl LetterboxTransform {
    /// 根据原图尺寸计算缩放与偏移 (不接触像素)
    pub fn new(original_width: u32, original_height: u32, target_size: u32) -> Self {
        let w0 = original_width.max(1) as f32;
        let h0 = original_height.max(1) as f32;
        let t = target_size as f32;
        let scale = (t / w0).min(t / h0);

        let resized_width = ((w0 * scale).round() as u32).clamp(1, target_size.max(1));
        let resized_height = ((h0 * scale).round() as u32).clamp(1, target_size.max(1));

        // 整数像素偏移, encode 与 decode 共用同一值
        let offset_x = (target_size.saturating_sub(resized_width) / 2) as f32;
        let offset_y = (target_size.saturating_sub(resized_height) / 2) as f32;

        Self {
            scale,
            offset_x,
            offset_y,
            original_width,
            original_height,
            resized_width,
            resized_height,
        }
    }

    /// 原图坐标 → letterbox 坐标
    pub fn forward_point(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.scale + self.offset_x, y * self.scale + self.offset_y)
    }

    /// letterbox 坐标 → 原图坐标 (不裁剪)
    pub fn inverse_point(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.offset_x) / self.scale,
            (y - self.offset_y) / self.scale,
        )
    }

    /// 角点框还原到原图并裁剪到 `[0, 原图尺寸]`
    pub fn unletterbox(&self, x1: f32, y1: f32, x2: f32, y2: f32) -> [f32; 4] {
        let w = self.original_width as f32;
        let h = self.original_height as f32;
        let (x1, y1) = self.inverse_point(x1, y1);
        let (x2, y2) = self.inverse_point(x2, y2);
        [
            x1.clamp(0.0, w),
            y1.clamp(0.0, h),
            x2.clamp(0.0, w),
            y2.clamp(0.0, h),
        ]
    }

    /// 将 letterbox 空间的检测框映射回原图空间
    pub fn decode_box(&self, bbox: &DetectionBox) -> DetectionBox {
        let [x1, y1, x2, y2] = self.unletterbox(bbox.x1(), bbox.y1(), bbox.x2(), bbox.y2());
        DetectionBox::new(x1, y1, x2, y2, bbox.confidence(), bbox.class_name())
    }
}

/// 图片 → `[1, 3, S, S]` 张量 + letterbox 参数
pub fn encode(img: &RgbaImage, target_size: u32) -> (Array4<f32>, LetterboxTransform) {
    let (w0, h0) = img.dimensions();
    let transform = LetterboxTransform::new(w0, h0, target_size);

    let size = target_size as usize;
    let mut ys = Array4::from_elem((1, 3, size, size), PAD_VALUE);

    let resized = imageops::resize(
        img,
        transform.resized_width,
        transform.resized_height,
        imageops::FilterType::Triangle,
    );

    let ox = transform.offset_x as usize;
    let oy = transform.offset_y as usize;
    for (x, y, rgba) in resized.enumerate_pixels() {
        let x = x as usize + ox;
        let y = y as usize + oy;
        if x >= size || y >= size {
            continue;
        }
        let [r, g, b, _] = rgba.0;
        ys[[0, 0, y, x]] = (r as f32) / 255.0;
        ys[[0, 1, y, x]] = (g as f32) / 255.0;
        ys[[0, 2, y, x]] = (b as f32) / 255.0;
    }

    (ys, transform)
}
