//! 检测系统错误类型

use thiserror::Error;

/// 检测链路上所有公开操作的失败类型
///
/// - `ModelLoad`: 模型下载/解析失败, 本次会话内检测整体停用
/// - `NotLoaded` / `Inference`: 单次推理失败, 视为空结果并计入重试
/// - `MalformedInput`: 像素数据不可用, 仅中止当前这一次请求
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectError {
    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("model load already in progress")]
    LoadInProgress,

    #[error("model not loaded")]
    NotLoaded,

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("inference worker unavailable")]
    WorkerUnavailable,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("image error: {0}")]
    Image(String),

    #[error("json error: {0}")]
    Json(String),
}

impl From<std::io::Error> for DetectError {
    fn from(err: std::io::Error) -> Self {
        DetectError::Io(err.to_string())
    }
}

impl From<image::ImageError> for DetectError {
    fn from(err: image::ImageError) -> Self {
        DetectError::Image(err.to_string())
    }
}

impl From<serde_json::Error> for DetectError {
    fn from(err: serde_json::Error) -> Self {
        DetectError::Json(err.to_string())
    }
}

impl DetectError {
    /// 是否应计入调度器的重试次数
    pub fn counts_as_attempt(&self) -> bool {
        !matches!(self, DetectError::WorkerUnavailable | DetectError::LoadInProgress)
    }
}

pub type Result<T> = std::result::Result<T, DetectError>;
