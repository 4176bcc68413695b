/// 推理工作线程 (Inference Worker)
/// 请求/响应按对象ID关联, 通过 channel 传递, 不共享内存
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use crate::detection::detector::Detector;
use crate::detection::types::{DetectionBox, ObjectId, PixelFrame};
use crate::error::{DetectError, Result};
use crate::ort_backend::ModelSource;

pub type DetectResult = Result<Vec<DetectionBox>>;

/// 单次检测的结果句柄
///
/// 每个请求一个单次回复 channel; 调度器按对象ID保存这些句柄
pub struct PendingDetection {
    object_id: ObjectId,
    rx: Receiver<DetectResult>,
}

impl PendingDetection {
    pub fn new(object_id: ObjectId, rx: Receiver<DetectResult>) -> Self {
        Self { object_id, rx }
    }

    /// 已完成的结果 (同步执行时使用)
    pub fn ready(object_id: ObjectId, result: DetectResult) -> Self {
        let (tx, rx) = bounded(1);
        let _ = tx.send(result);
        Self::new(object_id, rx)
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// 非阻塞取结果, 未完成时返回 None
    pub fn try_take(&self) -> Option<DetectResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Self::dropped())),
        }
    }

    /// 阻塞等待结果, 超时返回 None
    pub fn wait(&self, timeout: Duration) -> Option<DetectResult> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(Self::dropped())),
        }
    }

    fn dropped() -> DetectError {
        DetectError::Inference("request dropped by worker".to_string())
    }
}

/// 推理请求的发起方
pub trait Dispatcher {
    /// 模型已就绪, 可以接受请求
    fn available(&self) -> bool;

    fn dispatch(&self, object_id: ObjectId, frame: PixelFrame) -> Result<PendingDetection>;
}

/// 在调用线程上同步推理
pub struct InlineDispatcher {
    detector: Arc<Detector>,
}

impl InlineDispatcher {
    pub fn new(detector: Arc<Detector>) -> Self {
        Self { detector }
    }
}

impl Dispatcher for InlineDispatcher {
    fn available(&self) -> bool {
        self.detector.is_loaded()
    }

    fn dispatch(&self, object_id: ObjectId, frame: PixelFrame) -> Result<PendingDetection> {
        Ok(PendingDetection::ready(object_id, self.detector.infer(&frame)))
    }
}

/// 发往工作线程的请求
pub struct DetectRequest {
    pub object_id: ObjectId,
    pub frame: PixelFrame,
    pub reply: Sender<DetectResult>,
}

/// 工作线程加载模型后的状态
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerStatus {
    Ready,
    Failed(String),
}

pub struct InferenceWorker;

impl InferenceWorker {
    /// 启动推理线程: 先加载模型, 再循环处理请求
    pub fn spawn(
        detector: Arc<Detector>,
        source: ModelSource,
        capacity: usize,
    ) -> Result<InferenceClient> {
        let (tx, rx) = bounded::<DetectRequest>(capacity.max(1));
        let (status_tx, status_rx) = bounded::<WorkerStatus>(1);

        let handle = std::thread::Builder::new()
            .name("inference".to_string())
            .spawn(move || inference_thread(detector, source, rx, status_tx))?;

        Ok(InferenceClient {
            tx: Some(tx),
            status_rx,
            status: OnceLock::new(),
            handle: Some(handle),
        })
    }
}

fn inference_thread(
    detector: Arc<Detector>,
    source: ModelSource,
    rx: Receiver<DetectRequest>,
    status_tx: Sender<WorkerStatus>,
) {
    log::info!("✅ Inference thread started");

    if let Err(e) = detector.load(&source) {
        let _ = status_tx.send(WorkerStatus::Failed(e.to_string()));
        log::error!("❌ 推理线程退出: {}", e);
        return;
    }
    let _ = status_tx.send(WorkerStatus::Ready);

    let mut count = 0u64;
    let mut busy = Duration::ZERO;

    while let Ok(req) = rx.recv() {
        let t = Instant::now();
        let result = detector.infer(&req.frame);
        busy += t.elapsed();
        count += 1;

        match &result {
            Ok(ys) => log::debug!("🔍 #{} -> {} boxes ({:?})", req.object_id, ys.len(), t.elapsed()),
            Err(e) => log::debug!("⚠️  #{} -> {}", req.object_id, e),
        }

        // 对象已被移除时接收端不存在, 结果直接丢弃
        if req.reply.send(result).is_err() {
            log::debug!("🗑️  #{} 的结果无人接收", req.object_id);
        }
    }

    if count > 0 {
        log::info!(
            "🛑 Inference thread stopped: {} requests, avg {:.1}ms",
            count,
            busy.as_secs_f64() * 1000.0 / count as f64
        );
    } else {
        log::info!("🛑 Inference thread stopped");
    }
}

/// 工作线程的请求端
pub struct InferenceClient {
    tx: Option<Sender<DetectRequest>>,
    status_rx: Receiver<WorkerStatus>,
    status: OnceLock<WorkerStatus>,
    handle: Option<JoinHandle<()>>,
}

impl InferenceClient {
    /// 当前状态, 模型仍在加载时为 None
    pub fn status(&self) -> Option<&WorkerStatus> {
        if self.status.get().is_none() {
            if let Ok(status) = self.status_rx.try_recv() {
                let _ = self.status.set(status);
            }
        }
        self.status.get()
    }

    /// 阻塞等待模型加载结束
    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        if self.status.get().is_none() {
            match self.status_rx.recv_timeout(timeout) {
                Ok(status) => {
                    let _ = self.status.set(status);
                }
                Err(RecvTimeoutError::Timeout) => return Err(DetectError::LoadInProgress),
                Err(RecvTimeoutError::Disconnected) => return Err(DetectError::WorkerUnavailable),
            }
        }
        match self.status.get() {
            Some(WorkerStatus::Ready) => Ok(()),
            Some(WorkerStatus::Failed(msg)) => Err(DetectError::ModelLoad(msg.clone())),
            None => Err(DetectError::WorkerUnavailable),
        }
    }

    /// 关闭请求 channel 并等待线程退出
    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("❌ 推理线程异常退出");
            }
        }
    }
}

impl Dispatcher for InferenceClient {
    fn available(&self) -> bool {
        self.tx.is_some() && matches!(self.status(), Some(WorkerStatus::Ready))
    }

    fn dispatch(&self, object_id: ObjectId, frame: PixelFrame) -> Result<PendingDetection> {
        let tx = self.tx.as_ref().ok_or(DetectError::WorkerUnavailable)?;
        let (reply, rx) = bounded(1);
        match tx.try_send(DetectRequest {
            object_id,
            frame,
            reply,
        }) {
            Ok(()) => Ok(PendingDetection::new(object_id, rx)),
            Err(TrySendError::Full(_)) => {
                log::warn!("⚠️  推理队列已满, #{} 稍后重试", object_id);
                Err(DetectError::WorkerUnavailable)
            }
            Err(TrySendError::Disconnected(_)) => Err(DetectError::WorkerUnavailable),
        }
    }
}

impl Drop for InferenceClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
