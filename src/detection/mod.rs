/// 检测系统 (Detection System)
///
/// - Detector:  推理协调器, 模型只加载一次
/// - Worker:    独立推理线程, 请求/响应按对象ID关联
/// - Scheduler: 每个对象的检测状态机与重试上限
pub mod detector;
pub mod scheduler;
pub mod types;
pub mod worker;

pub use detector::{Detector, DetectorConfig, EngineBuilder};
pub use scheduler::{BeltView, DetectionScheduler, DetectionState, SchedulerEvent, TrackedObject};
pub use worker::{
    DetectRequest, DetectResult, Dispatcher, InferenceClient, InferenceWorker, InlineDispatcher,
    PendingDetection, WorkerStatus,
};
