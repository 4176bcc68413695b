/// 工具模块
/// Utility modules
pub mod letterbox;

pub use letterbox::{encode, LetterboxTransform};
