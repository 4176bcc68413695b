// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 作物检测模型
// 包含: 预处理 (letterbox)、推理、后处理 (解码 + 置信度过滤 + NMS)

use std::time::Instant;

use anyhow::{bail, Result};
use image::RgbaImage;
use ndarray::{s, Array4, ArrayView3};

use crate::detection::types::{ClassName, DetectionBox};
use crate::ort_backend::Engine;
use crate::utils::letterbox::{self, LetterboxTransform};
use crate::non_max_suppression;

const CXYWH_OFFSET: usize = 4;

/// 原始输出 `[1, 4 + nc, num_anchors]` → 原图空间检测框 (未做 NMS)
///
/// 每个 anchor 取类别分数最大者, 低于 `conf` 的 anchor 丢弃;
/// 中心点宽高转角点后经 letterbox 逆变换还原并裁剪到原图边界。
pub fn decode_detections(
    raw: &[f32],
    dims: &[usize],
    transform: &LetterboxTransform,
    classes: &[ClassName],
    conf: f32,
) -> Result<Vec<DetectionBox>> {
    let &[batch, rows, num_anchors] = dims else {
        bail!("expected 3-d output [1, 4+nc, anchors], got {:?}", dims);
    };
    if batch != 1 {
        bail!("expected batch of 1, got {}", batch);
    }
    if rows != CXYWH_OFFSET + classes.len() {
        bail!(
            "output has {} rows but {} classes are configured",
            rows,
            classes.len()
        );
    }
    let preds = ArrayView3::from_shape((batch, rows, num_anchors), raw)?;
    let preds = preds.slice(s![0, .., ..]);

    let ys = preds
        .columns()
        .into_iter()
        .filter_map(|pred| {
            let (id, confidence) = pred
                .slice(s![CXYWH_OFFSET..])
                .iter()
                .copied()
                .enumerate()
                .filter(|(_, score)| !score.is_nan())
                .reduce(|max, x| if x.1 > max.1 { x } else { max })?;

            if confidence < conf {
                return None;
            }

            let (cx, cy, w, h) = (pred[0], pred[1], pred[2], pred[3]);
            let [x1, y1, x2, y2] =
                transform.unletterbox(cx - w / 2., cy - h / 2., cx + w / 2., cy + h / 2.);
            Some(DetectionBox::new(x1, y1, x2, y2, confidence, classes[id]))
        })
        .collect();

    Ok(ys)
}

/// YOLOv8 检测模型
pub struct YOLOv8 {
    engine: Box<dyn Engine>,
    input_size: u32,
    conf: f32,
    iou: f32,
    classes: Vec<ClassName>,
}

impl YOLOv8 {
    pub fn new(engine: Box<dyn Engine>, conf: f32, iou: f32) -> Result<Self> {
        let classes = ClassName::ALL.to_vec();

        // 类别顺序是与模型之间的硬约定
        if let Some(names) = engine.names() {
            let expected: Vec<&str> = classes.iter().map(|c| c.as_str()).collect();
            if names.iter().map(String::as_str).ne(expected.iter().copied()) {
                bail!(
                    "model class order {:?} does not match {:?}",
                    names,
                    expected
                );
            }
        }

        Ok(Self {
            input_size: engine.input_size(),
            engine,
            conf,
            iou,
            classes,
        })
    }

    pub fn preprocess(&self, img: &RgbaImage) -> (Array4<f32>, LetterboxTransform) {
        letterbox::encode(img, self.input_size)
    }

    pub fn run(&mut self, xs: &Array4<f32>) -> Result<(Vec<f32>, Vec<usize>)> {
        self.engine.run(xs)
    }

    pub fn postprocess(
        &self,
        raw: &[f32],
        dims: &[usize],
        transform: &LetterboxTransform,
    ) -> Result<Vec<DetectionBox>> {
        let candidates = decode_detections(raw, dims, transform, &self.classes, self.conf)?;
        Ok(non_max_suppression(candidates, self.iou))
    }

    /// 完整流程: preprocess → run → postprocess
    pub fn forward(&mut self, img: &RgbaImage) -> Result<Vec<DetectionBox>> {
        let t_pre = Instant::now();
        let (xs, transform) = self.preprocess(img);
        log::debug!("[Model Preprocess]: {:?}", t_pre.elapsed());

        let t_run = Instant::now();
        let (raw, dims) = self.run(&xs)?;
        log::debug!("[Model Inference]: {:?}", t_run.elapsed());

        let t_post = Instant::now();
        let ys = self.postprocess(&raw, &dims, &transform)?;
        log::debug!("[Model Postprocess]: {:?} ({} boxes)", t_post.elapsed(), ys.len());

        Ok(ys)
    }

    pub fn summary(&self) {
        log::info!(
            "\nSummary:\n\
            > EP: {:?}\n\
            > Input: {}x{}\n\
            > classes: {:?}, conf: {}, iou: {}\n",
            self.engine.ep(),
            self.input_size,
            self.input_size,
            self.classes,
            self.conf,
            self.iou,
        );
    }

    pub fn conf(&self) -> f32 {
        self.conf
    }

    pub fn set_conf(&mut self, val: f32) {
        self.conf = val;
    }

    pub fn iou(&self) -> f32 {
        self.iou
    }

    pub fn set_iou(&mut self, val: f32) {
        self.iou = val;
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    pub fn classes(&self) -> &[ClassName] {
        &self.classes
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Rgba;

    /// 固定输出的假引擎
    pub(crate) struct ScriptedEngine {
        pub size: u32,
        pub raw: Vec<f32>,
        pub dims: Vec<usize>,
        pub names: Option<Vec<String>>,
    }

    impl Engine for ScriptedEngine {
        fn run(&mut self, xs: &Array4<f32>) -> Result<(Vec<f32>, Vec<usize>)> {
            let s = self.size as usize;
            assert_eq!(xs.shape(), &[1, 3, s, s]);
            Ok((self.raw.clone(), self.dims.clone()))
        }

        fn input_size(&self) -> u32 {
            self.size
        }

        fn names(&self) -> Option<Vec<String>> {
            self.names.clone()
        }
    }

    /// 行优先 `[1, 6, n]`: 每个 anchor 为 (cx, cy, w, h, diseased, healthy)
    pub(crate) fn raw_output(anchors: &[[f32; 6]]) -> (Vec<f32>, Vec<usize>) {
        let n = anchors.len();
        let mut raw = vec![0.0; 6 * n];
        for (i, a) in anchors.iter().enumerate() {
            for (row, v) in a.iter().enumerate() {
                raw[row * n + i] = *v;
            }
        }
        (raw, vec![1, 6, n])
    }

    fn identity() -> LetterboxTransform {
        LetterboxTransform::new(640, 640, 640)
    }

    #[test]
    fn test_decode_single_anchor() {
        let (raw, dims) = raw_output(&[
            [50.0, 50.0, 20.0, 20.0, 0.9, 0.1],
            [200.0, 200.0, 30.0, 30.0, 0.2, 0.3],
            [400.0, 100.0, 10.0, 10.0, 0.0, 0.0],
        ]);
        let ys = decode_detections(&raw, &dims, &identity(), &ClassName::ALL, 0.5).unwrap();

        assert_eq!(ys.len(), 1);
        let b = &ys[0];
        assert_eq!(b.class_id(), 0);
        assert_eq!(b.class_name(), ClassName::Diseased);
        assert!((b.confidence() - 0.9).abs() < 1e-6);
        assert_eq!((b.x1(), b.y1(), b.x2(), b.y2()), (40.0, 40.0, 60.0, 60.0));
        assert_eq!((b.center_x(), b.center_y()), (50.0, 50.0));
    }

    #[test]
    fn test_decode_argmax_picks_healthy() {
        let (raw, dims) = raw_output(&[[100.0, 100.0, 10.0, 10.0, 0.55, 0.7]]);
        let ys = decode_detections(&raw, &dims, &identity(), &ClassName::ALL, 0.5).unwrap();
        assert_eq!(ys.len(), 1);
        assert_eq!(ys[0].class_name(), ClassName::Healthy);
        assert!((ys[0].confidence() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_decode_threshold_is_inclusive() {
        let (raw, dims) = raw_output(&[[100.0, 100.0, 10.0, 10.0, 0.5, 0.0]]);
        let ys = decode_detections(&raw, &dims, &identity(), &ClassName::ALL, 0.5).unwrap();
        assert_eq!(ys.len(), 1);
    }

    #[test]
    fn test_decode_rejects_nan_scores() {
        let (raw, dims) = raw_output(&[
            [50.0, 50.0, 20.0, 20.0, f32::NAN, 0.1],
            [80.0, 80.0, 20.0, 20.0, f32::NAN, f32::NAN],
            [120.0, 120.0, 20.0, 20.0, f32::NAN, 0.8],
        ]);
        let ys = decode_detections(&raw, &dims, &identity(), &ClassName::ALL, 0.5).unwrap();

        assert_eq!(ys.len(), 1);
        assert_eq!(ys[0].class_name(), ClassName::Healthy);
        assert!((ys[0].confidence() - 0.8).abs() < 1e-6);
        assert!(ys.iter().all(|b| b.confidence() >= 0.5));
    }

    #[test]
    fn test_decode_inverts_letterbox_and_clamps() {
        // 1000x500 原图: scale 0.64, 上下各填充 160
        let t = LetterboxTransform::new(1000, 500, 640);
        let (raw, dims) = raw_output(&[
            [320.0, 320.0, 640.0, 320.0, 0.8, 0.1],
            [10.0, 170.0, 40.0, 40.0, 0.1, 0.95],
        ]);
        let ys = decode_detections(&raw, &dims, &t, &ClassName::ALL, 0.5).unwrap();
        assert_eq!(ys.len(), 2);

        let full = &ys[0];
        assert!(full.x1().abs() < 1e-3 && full.y1().abs() < 1e-3);
        assert!((full.x2() - 1000.0).abs() < 1e-3 && (full.y2() - 500.0).abs() < 1e-3);

        let edge = &ys[1];
        assert_eq!(edge.x1(), 0.0);
        assert_eq!(edge.y1(), 0.0);
        assert!(edge.x2() <= 1000.0 && edge.y2() <= 500.0);
    }

    #[test]
    fn test_decode_rejects_bad_shape() {
        let t = identity();
        assert!(decode_detections(&[0.0; 12], &[1, 4, 3], &t, &ClassName::ALL, 0.5).is_err());
        assert!(decode_detections(&[0.0; 12], &[2, 6], &t, &ClassName::ALL, 0.5).is_err());
        assert!(decode_detections(&[0.0; 10], &[1, 6, 3], &t, &ClassName::ALL, 0.5).is_err());
    }

    #[test]
    fn test_forward_applies_nms() {
        let (raw, dims) = raw_output(&[
            [20.0, 20.0, 16.0, 16.0, 0.9, 0.0],
            [22.0, 20.0, 16.0, 16.0, 0.8, 0.0],
            [50.0, 50.0, 8.0, 8.0, 0.0, 0.6],
        ]);
        let engine = ScriptedEngine {
            size: 64,
            raw,
            dims,
            names: None,
        };
        let mut model = YOLOv8::new(Box::new(engine), 0.5, 0.45).unwrap();
        let img = RgbaImage::from_pixel(64, 64, Rgba([120, 30, 30, 255]));
        let ys = model.forward(&img).unwrap();

        assert_eq!(ys.len(), 2);
        assert!((ys[0].confidence() - 0.9).abs() < 1e-6);
        assert_eq!(ys[1].class_name(), ClassName::Healthy);
    }

    #[test]
    fn test_class_order_contract() {
        let engine = ScriptedEngine {
            size: 64,
            raw: Vec::new(),
            dims: vec![1, 6, 0],
            names: Some(vec!["healthy".to_string(), "diseased".to_string()]),
        };
        assert!(YOLOv8::new(Box::new(engine), 0.5, 0.45).is_err());

        let engine = ScriptedEngine {
            size: 64,
            raw: Vec::new(),
            dims: vec![1, 6, 0],
            names: Some(vec!["diseased".to_string(), "healthy".to_string()]),
        };
        assert!(YOLOv8::new(Box::new(engine), 0.5, 0.45).is_ok());
    }
}
