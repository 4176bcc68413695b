/// 分拣检测系统数据结构定义
/// Data structures for the produce sorting detector
use serde::{Deserialize, Serialize};

use crate::error::{DetectError, Result};

// ========== 公共常量 ==========

/// 模型推理输入尺寸 (正方形)
pub const INF_SIZE: u32 = 640;

/// letterbox 填充值 (归一化灰度)
pub const PAD_VALUE: f32 = 0.5;

/// 单个对象放弃检测前的最大尝试次数
pub const MAX_ATTEMPTS: u32 = 5;

/// 输送带上的对象ID (由展示层分配)
pub type ObjectId = u64;

// ========== 类别 ==========

/// 作物类别
///
/// 顺序即类别ID, 必须与模型输出通道顺序完全一致 (训练时按字母序: diseased, healthy)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassName {
    Diseased = 0,
    Healthy = 1,
}

impl ClassName {
    /// 按模型通道顺序排列的全部类别
    pub const ALL: [ClassName; 2] = [ClassName::Diseased, ClassName::Healthy];

    pub fn id(&self) -> usize {
        *self as usize
    }

    pub fn from_id(id: usize) -> Option<Self> {
        Self::ALL.get(id).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClassName::Diseased => "diseased",
            ClassName::Healthy => "healthy",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(name.trim()))
    }
}

impl std::fmt::Display for ClassName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ========== 检测框 ==========

/// 检测框 (原图像素坐标, 角点形式)
///
/// 构造时保证 `x1 <= x2`, `y1 <= y2`; 中心点与宽高为派生值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    confidence: f32,
    class_id: usize,
    class_name: ClassName,
    center_x: f32,
    center_y: f32,
    width: f32,
    height: f32,
}

impl DetectionBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32, class_name: ClassName) -> Self {
        let (x1, x2) = if x1 <= x2 { (x1, x2) } else { (x2, x1) };
        let (y1, y2) = if y1 <= y2 { (y1, y2) } else { (y2, y1) };
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence,
            class_id: class_name.id(),
            class_name,
            center_x: (x1 + x2) / 2.0,
            center_y: (y1 + y2) / 2.0,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    pub fn x1(&self) -> f32 {
        self.x1
    }

    pub fn y1(&self) -> f32 {
        self.y1
    }

    pub fn x2(&self) -> f32 {
        self.x2
    }

    pub fn y2(&self) -> f32 {
        self.y2
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn class_id(&self) -> usize {
        self.class_id
    }

    pub fn class_name(&self) -> ClassName {
        self.class_name
    }

    pub fn center_x(&self) -> f32 {
        self.center_x
    }

    pub fn center_y(&self) -> f32 {
        self.center_y
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn intersection_area(&self, another: &DetectionBox) -> f32 {
        let l = self.x1.max(another.x1);
        let r = self.x2.min(another.x2);
        let t = self.y1.max(another.y1);
        let b = self.y2.min(another.y2);
        (r - l).max(0.) * (b - t).max(0.)
    }

    pub fn union(&self, another: &DetectionBox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    /// Intersection-over-Union, 无重叠或退化框时为 0
    pub fn iou(&self, another: &DetectionBox) -> f32 {
        let union = self.union(another);
        if union <= 0.0 {
            return 0.0;
        }
        self.intersection_area(another) / union
    }
}

// ========== 像素数据 ==========

/// 一帧 RGBA 像素 (展示层截取的对象图像)
#[derive(Clone, Debug)]
pub struct PixelFrame {
    pub width: u32,
    pub height: u32,
    pub rgba_data: Vec<u8>,
}

impl PixelFrame {
    pub fn new(width: u32, height: u32, rgba_data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            rgba_data,
        }
    }

    pub fn from_image(img: &image::DynamicImage) -> Self {
        let rgba = img.to_rgba8();
        let (width, height) = rgba.dimensions();
        Self::new(width, height, rgba.into_raw())
    }

    /// 校验尺寸与缓冲区长度, 转为 RgbaImage
    pub fn to_image(&self) -> Result<image::RgbaImage> {
        if self.width == 0 || self.height == 0 {
            return Err(DetectError::MalformedInput(format!(
                "empty frame {}x{}",
                self.width, self.height
            )));
        }
        let expected = self.width as usize * self.height as usize * 4;
        if self.rgba_data.len() != expected {
            return Err(DetectError::MalformedInput(format!(
                "expected {} bytes for {}x{} RGBA, got {}",
                expected,
                self.width,
                self.height,
                self.rgba_data.len()
            )));
        }
        image::RgbaImage::from_raw(self.width, self.height, self.rgba_data.clone())
            .ok_or_else(|| DetectError::MalformedInput("RGBA buffer rejected".to_string()))
    }
}
