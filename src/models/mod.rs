/// 模型实现
///
/// ## YOLOv8 作物检测
/// - 预处理 (letterbox → `[1, 3, S, S]`)
/// - 推理 (`Engine`, 默认为 ONNX Runtime)
/// - 后处理 (解码 → 置信度过滤 → 按类别 NMS)
///
/// ## 使用示例
/// ```no_run
/// use produce_sorter::models::YOLOv8;
/// use produce_sorter::{ModelSource, OrtBackend, OrtConfig, OrtEP};
///
/// let engine = OrtBackend::build(OrtConfig {
///     source: ModelSource::parse("models/apple.onnx"),
///     eps: vec![OrtEP::CPU],
///     image_size: 640,
///     num_threads: 4,
/// })?;
/// let mut model = YOLOv8::new(Box::new(engine), 0.5, 0.45)?;
/// let img = image::open("apple.png")?.to_rgba8();
/// let boxes = model.forward(&img)?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub mod yolov8;

pub use yolov8::{decode_detections, YOLOv8};
