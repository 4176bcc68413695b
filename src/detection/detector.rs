//! 推理协调器 (Detector)
//! 职责: 模型只加载一次 → 单张图片推理 → 返回解码后的检测框或失败
//!
//! 不做重试, 重试策略属于调度器。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::detection::types::{DetectionBox, PixelFrame};
use crate::error::{DetectError, Result};
use crate::models::YOLOv8;
use crate::ort_backend::{Engine, ModelSource, OrtBackend, OrtConfig, OrtEP};

/// 由模型来源构建推理引擎
pub type EngineBuilder = Box<dyn Fn(&ModelSource) -> anyhow::Result<Box<dyn Engine>> + Send + Sync>;

/// 协调器参数
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub input_size: u32,
    pub conf: f32,
    pub iou: f32,
    pub eps: Vec<OrtEP>,
    pub num_threads: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_size: crate::detection::types::INF_SIZE,
            conf: 0.5,
            iou: 0.45,
            eps: vec![OrtEP::CPU],
            num_threads: 4,
        }
    }
}

impl From<&crate::SorterConfig> for DetectorConfig {
    fn from(config: &crate::SorterConfig) -> Self {
        Self {
            input_size: config.input_size,
            conf: config.conf_threshold,
            iou: config.iou_threshold,
            eps: config.eps(),
            num_threads: config.num_threads,
        }
    }
}

enum ModelState {
    Unloaded,
    Ready(YOLOv8),
    /// 加载失败后本次会话不再重试
    Failed(String),
}

pub struct Detector {
    config: DetectorConfig,
    builder: EngineBuilder,
    state: Mutex<ModelState>,
    loading: AtomicBool,
}

impl Detector {
    /// 使用 ONNX Runtime 后端
    pub fn new(config: DetectorConfig) -> Self {
        let ort_config = config.clone();
        let builder: EngineBuilder = Box::new(move |source: &ModelSource| {
            let engine = OrtBackend::build(OrtConfig {
                source: source.clone(),
                eps: ort_config.eps.clone(),
                image_size: ort_config.input_size,
                num_threads: ort_config.num_threads,
            })?;
            Ok(Box::new(engine) as Box<dyn Engine>)
        });
        Self::with_builder(config, builder)
    }

    /// 自定义引擎构建 (测试或其它后端)
    pub fn with_builder(config: DetectorConfig, builder: EngineBuilder) -> Self {
        Self {
            config,
            builder,
            state: Mutex::new(ModelState::Unloaded),
            loading: AtomicBool::new(false),
        }
    }

    /// 加载模型
    ///
    /// 已加载时为空操作; 另一次加载进行中时返回 `LoadInProgress`;
    /// 失败结果会被记住, 之后的调用直接返回同一错误。
    pub fn load(&self, source: &ModelSource) -> Result<()> {
        if let Some(done) = self.settled() {
            return done;
        }

        if self
            .loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("⚠️  模型正在加载中, 忽略重复请求");
            return Err(DetectError::LoadInProgress);
        }

        let result = self.load_claimed(source);
        self.loading.store(false, Ordering::Release);
        result
    }

    /// 已完成的加载结果 (成功或失败), 尚未加载时为 None
    fn settled(&self) -> Option<Result<()>> {
        let state = match self.lock_state() {
            Ok(state) => state,
            Err(e) => return Some(Err(e)),
        };
        match &*state {
            ModelState::Ready(_) => Some(Ok(())),
            ModelState::Failed(msg) => Some(Err(DetectError::ModelLoad(msg.clone()))),
            ModelState::Unloaded => None,
        }
    }

    /// 持有 `loading` 标志后执行加载, 标志由调用方清除
    fn load_claimed(&self, source: &ModelSource) -> Result<()> {
        // 首次检查与取得标志之间, 另一次加载可能已经结束
        if let Some(done) = self.settled() {
            return done;
        }

        log::info!("📦 加载检测模型: {}", source.describe());
        let t = Instant::now();

        // 构建期间不持有锁, infer 可以立即得到 NotLoaded
        let built = (self.builder)(source).and_then(|engine| {
            YOLOv8::new(engine, self.config.conf, self.config.iou)
        });

        let mut state = self.lock_state()?;
        match built {
            Ok(model) => {
                model.summary();
                log::info!(
                    "✅ 检测模型就绪 ({:.1}ms)",
                    t.elapsed().as_secs_f64() * 1000.0
                );
                *state = ModelState::Ready(model);
                Ok(())
            }
            Err(e) => {
                let msg = format!("{:#}", e);
                log::error!("❌ 检测模型加载失败: {}", msg);
                *state = ModelState::Failed(msg.clone());
                Err(DetectError::ModelLoad(msg))
            }
        }
    }

    /// 单张图片推理
    pub fn infer(&self, frame: &PixelFrame) -> Result<Vec<DetectionBox>> {
        let img = frame.to_image()?;

        let mut state = self.lock_state()?;
        let model = match &mut *state {
            ModelState::Ready(model) => model,
            _ => return Err(DetectError::NotLoaded),
        };

        model
            .forward(&img)
            .map_err(|e| DetectError::Inference(format!("{:#}", e)))
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.lock_state().as_deref(), Ok(ModelState::Ready(_)))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.lock_state().as_deref(), Ok(ModelState::Failed(_)))
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, ModelState>> {
        self.state
            .lock()
            .map_err(|_| DetectError::Inference("detector state poisoned".to_string()))
    }
}
