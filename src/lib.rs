// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod annotate; // 去背图片自动标注
pub mod belt; // 无界面输送带模拟
pub mod catalog; // 作物图片目录
pub mod config; // 配置参数
pub mod detection; // 检测协调与调度
pub mod error; // 错误类型
pub mod models; // 模型实现
pub mod ort_backend; // ONNX Runtime 后端
pub mod utils; // letterbox 等工具

pub use crate::config::{Args, SorterConfig};
pub use crate::detection::types::{ClassName, DetectionBox, ObjectId, PixelFrame};
pub use crate::detection::{
    BeltView, DetectionScheduler, DetectionState, Detector, Dispatcher, InferenceClient,
    InferenceWorker, InlineDispatcher, PendingDetection, SchedulerEvent,
};
pub use crate::error::{DetectError, Result};
pub use crate::models::{decode_detections, YOLOv8};
pub use crate::ort_backend::{Engine, ModelSource, OrtBackend, OrtConfig, OrtEP};
pub use crate::utils::letterbox::LetterboxTransform;

/// 按类别的贪心 NMS
///
/// 按置信度降序依次保留最高分框, 丢弃与其同类别且 IoU >= `iou_threshold` 的框;
/// 不同类别之间互不抑制。返回新集合, 输入不做原地修改。
pub fn non_max_suppression(xs: Vec<DetectionBox>, iou_threshold: f32) -> Vec<DetectionBox> {
    let mut sorted = xs;
    sorted.sort_by(|b1, b2| b2.confidence().total_cmp(&b1.confidence()));

    sorted.into_iter().fold(Vec::new(), |mut kept: Vec<DetectionBox>, candidate| {
        let suppressed = kept.iter().any(|k| {
            k.class_id() == candidate.class_id() && k.iou(&candidate) >= iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
        kept
    })
}

pub fn gen_time_string(delimiter: &str) -> String {
    let t_now = chrono::Local::now();
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S",
        delimiter, delimiter, delimiter, delimiter, delimiter
    );
    t_now.format(&fmt).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x1: f32, y1: f32, x2: f32, y2: f32, conf: f32, class: ClassName) -> DetectionBox {
        DetectionBox::new(x1, y1, x2, y2, conf, class)
    }

    #[test]
    fn test_nms_keeps_highest_of_overlapping_pair() {
        // IoU = 0.6: 两个 10x10 框, 交集 75, 并集 125
        let a = bbox(0.0, 0.0, 10.0, 10.0, 0.8, ClassName::Diseased);
        let b = bbox(2.5, 0.0, 12.5, 10.0, 0.9, ClassName::Diseased);
        assert!((a.iou(&b) - 0.6).abs() < 1e-6);

        let ys = non_max_suppression(vec![a, b.clone()], 0.45);
        assert_eq!(ys, vec![b]);
    }

    #[test]
    fn test_nms_class_aware() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 0.9, ClassName::Diseased);
        let b = bbox(0.0, 0.0, 10.0, 10.0, 0.8, ClassName::Healthy);
        let ys = non_max_suppression(vec![a, b], 0.45);
        assert_eq!(ys.len(), 2);
    }

    #[test]
    fn test_nms_threshold_is_inclusive() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 0.9, ClassName::Healthy);
        let b = bbox(2.5, 0.0, 12.5, 10.0, 0.8, ClassName::Healthy);
        assert_eq!(non_max_suppression(vec![a.clone(), b.clone()], 0.6).len(), 1);
        assert_eq!(non_max_suppression(vec![a, b], 0.61).len(), 2);
    }

    #[test]
    fn test_nms_subset_and_ordering() {
        let xs = vec![
            bbox(0.0, 0.0, 10.0, 10.0, 0.3, ClassName::Healthy),
            bbox(1.0, 1.0, 11.0, 11.0, 0.7, ClassName::Healthy),
            bbox(50.0, 50.0, 60.0, 60.0, 0.5, ClassName::Healthy),
            bbox(0.0, 0.0, 10.0, 10.0, 0.95, ClassName::Diseased),
            bbox(100.0, 0.0, 110.0, 10.0, 0.2, ClassName::Diseased),
        ];
        let ys = non_max_suppression(xs.clone(), 0.45);

        assert!(ys.len() <= xs.len());
        assert!(ys.iter().all(|y| xs.contains(y)));
        assert_eq!(ys[0].confidence(), 0.95);
        assert!(ys.windows(2).all(|w| w[0].confidence() >= w[1].confidence()));

        // 同类别残留框两两 IoU < 阈值
        for (i, a) in ys.iter().enumerate() {
            for b in ys.iter().skip(i + 1) {
                if a.class_id() == b.class_id() {
                    assert!(a.iou(b) < 0.45);
                }
            }
        }
        assert_eq!(ys.len(), 4);
    }

    #[test]
    fn test_nms_empty() {
        assert!(non_max_suppression(Vec::new(), 0.45).is_empty());
    }

    #[test]
    fn test_gen_time_string() {
        let s = gen_time_string("-");
        assert_eq!(s.split('-').count(), 6);
    }
}
