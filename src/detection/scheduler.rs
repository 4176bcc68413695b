/// 检测请求调度器 (Detection Scheduler)
///
/// 每个对象的检测状态机:
///
/// ```text
/// NotRequested ──请求──▶ Pending ──非空结果──▶ Resolved
///      ▲                   │
///      └──空结果/失败 (+1)──┘
/// NotRequested ──次数达到上限──▶ Exhausted
/// ```
///
/// - 每个对象同时最多一个未完成请求
/// - Resolved 与 Exhausted 为终态, 不再发起请求
/// - 对象被移除后到达的结果直接忽略
use std::collections::{BTreeMap, HashMap};

use crate::detection::types::{DetectionBox, ObjectId, PixelFrame, MAX_ATTEMPTS};
use crate::detection::worker::{DetectResult, Dispatcher, PendingDetection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionState {
    NotRequested,
    Pending,
    Resolved,
    Exhausted,
}

/// 调度器持有的对象记录
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedObject {
    pub id: ObjectId,
    pub state: DetectionState,
    pub attempts: u32,
    pub result: Option<DetectionBox>,
}

impl TrackedObject {
    fn new(id: ObjectId) -> Self {
        Self {
            id,
            state: DetectionState::NotRequested,
            attempts: 0,
            result: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, DetectionState::Resolved | DetectionState::Exhausted)
    }
}

/// 一次 tick 中发生的状态变化
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Requested(ObjectId),
    Resolved(ObjectId, DetectionBox),
    Retry(ObjectId, u32),
    Exhausted(ObjectId),
}

/// 展示层: 提供对象当前可见的像素
pub trait BeltView {
    /// 对象尚不可见 (图片未加载/不在画面内) 时返回 None
    fn capture(&self, id: ObjectId) -> Option<PixelFrame>;
}

pub struct DetectionScheduler {
    objects: BTreeMap<ObjectId, TrackedObject>,
    pending: HashMap<ObjectId, PendingDetection>,
    max_attempts: u32,
}

impl Default for DetectionScheduler {
    fn default() -> Self {
        Self::new(MAX_ATTEMPTS)
    }
}

impl DetectionScheduler {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            objects: BTreeMap::new(),
            pending: HashMap::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// 开始跟踪新对象, 已存在时不变
    pub fn track(&mut self, id: ObjectId) {
        self.objects.entry(id).or_insert_with(|| TrackedObject::new(id));
    }

    /// 移除对象; 未完成的请求被丢弃, 不通知工作线程
    pub fn forget(&mut self, id: ObjectId) -> Option<TrackedObject> {
        self.pending.remove(&id);
        self.objects.remove(&id)
    }

    pub fn state(&self, id: ObjectId) -> Option<DetectionState> {
        self.objects.get(&id).map(|o| o.state)
    }

    pub fn object(&self, id: ObjectId) -> Option<&TrackedObject> {
        self.objects.get(&id)
    }

    pub fn result(&self, id: ObjectId) -> Option<&DetectionBox> {
        self.objects.get(&id).and_then(|o| o.result.as_ref())
    }

    pub fn objects(&self) -> impl Iterator<Item = &TrackedObject> {
        self.objects.values()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 每帧调用一次: 先收取已完成的结果, 再为可请求的对象发起检测
    pub fn tick(&mut self, view: &dyn BeltView, dispatcher: &dyn Dispatcher) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        self.drain(&mut events);
        self.request(view, dispatcher, &mut events);
        events
    }

    fn drain(&mut self, events: &mut Vec<SchedulerEvent>) {
        let finished: Vec<(ObjectId, DetectResult)> = self
            .pending
            .iter()
            .filter_map(|(&id, p)| p.try_take().map(|result| (id, result)))
            .collect();

        for (id, result) in finished {
            self.pending.remove(&id);
            if let Some(event) = self.complete(id, result) {
                events.push(event);
            }
        }
    }

    /// 应用一次检测结果; 对象不存在时为空操作
    pub fn complete(&mut self, id: ObjectId, result: DetectResult) -> Option<SchedulerEvent> {
        let max_attempts = self.max_attempts;
        let object = self.objects.get_mut(&id)?;
        if object.state != DetectionState::Pending {
            return None;
        }

        // 每次推理只对应一个对象, 取 NMS 后的第一个框
        let best = match result {
            Ok(ys) => ys.into_iter().next(),
            Err(e) if !e.counts_as_attempt() => {
                object.state = DetectionState::NotRequested;
                return None;
            }
            Err(e) => {
                log::debug!("⚠️  #{} 检测失败: {}", id, e);
                None
            }
        };

        match best {
            Some(det) => {
                object.state = DetectionState::Resolved;
                object.attempts = 0;
                object.result = Some(det.clone());
                log::debug!("🎯 #{} -> {} ({:.2})", id, det.class_name(), det.confidence());
                Some(SchedulerEvent::Resolved(id, det))
            }
            None => Some(Self::fail(object, max_attempts)),
        }
    }

    /// 空结果或失败: 计一次, 达到上限后放弃
    fn fail(object: &mut TrackedObject, max_attempts: u32) -> SchedulerEvent {
        object.attempts += 1;
        if object.attempts >= max_attempts {
            object.state = DetectionState::Exhausted;
            object.result = None;
            log::debug!("🚫 #{} 已尝试 {} 次, 放弃检测", object.id, object.attempts);
            SchedulerEvent::Exhausted(object.id)
        } else {
            object.state = DetectionState::NotRequested;
            SchedulerEvent::Retry(object.id, object.attempts)
        }
    }

    fn request(
        &mut self,
        view: &dyn BeltView,
        dispatcher: &dyn Dispatcher,
        events: &mut Vec<SchedulerEvent>,
    ) {
        if !dispatcher.available() {
            return;
        }

        for object in self.objects.values_mut() {
            if object.state != DetectionState::NotRequested || self.pending.contains_key(&object.id) {
                continue;
            }
            let Some(frame) = view.capture(object.id) else {
                continue;
            };

            match dispatcher.dispatch(object.id, frame) {
                Ok(pending) => {
                    object.state = DetectionState::Pending;
                    self.pending.insert(object.id, pending);
                    events.push(SchedulerEvent::Requested(object.id));
                }
                Err(e) if !e.counts_as_attempt() => {
                    // 队列满/线程不可用: 本帧停止发起, 不计入次数
                    log::debug!("⏳ #{} 暂不能请求: {}", object.id, e);
                    break;
                }
                Err(e) => {
                    log::debug!("⚠️  #{} 请求失败: {}", object.id, e);
                    events.push(Self::fail(object, self.max_attempts));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::ClassName;
    use crate::error::DetectError;
    use std::cell::RefCell;
    use std::collections::{HashSet, VecDeque};

    /// 所有对象都可见
    struct AllVisible;

    impl BeltView for AllVisible {
        fn capture(&self, _id: ObjectId) -> Option<PixelFrame> {
            Some(PixelFrame::new(1, 1, vec![0; 4]))
        }
    }

    struct Visible(HashSet<ObjectId>);

    impl BeltView for Visible {
        fn capture(&self, id: ObjectId) -> Option<PixelFrame> {
            self.0.contains(&id).then(|| PixelFrame::new(1, 1, vec![0; 4]))
        }
    }

    /// 按脚本返回结果; 结果在下一次 tick 收取
    struct Scripted {
        available: bool,
        results: RefCell<VecDeque<DetectResult>>,
        reject: RefCell<u32>,
        calls: RefCell<Vec<ObjectId>>,
    }

    impl Scripted {
        fn new(results: Vec<DetectResult>) -> Self {
            Self {
                available: true,
                results: RefCell::new(results.into()),
                reject: RefCell::new(0),
                calls: RefCell::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<ObjectId> {
            self.calls.borrow().clone()
        }
    }

    impl Dispatcher for Scripted {
        fn available(&self) -> bool {
            self.available
        }

        fn dispatch(&self, id: ObjectId, _frame: PixelFrame) -> crate::Result<PendingDetection> {
            let mut reject = self.reject.borrow_mut();
            if *reject > 0 {
                *reject -= 1;
                return Err(DetectError::WorkerUnavailable);
            }
            self.calls.borrow_mut().push(id);
            let result = self.results.borrow_mut().pop_front().unwrap_or(Ok(Vec::new()));
            Ok(PendingDetection::ready(id, result))
        }
    }

    /// 永不返回结果
    struct Stalled {
        calls: RefCell<u32>,
        senders: RefCell<Vec<crossbeam_channel::Sender<DetectResult>>>,
    }

    impl Dispatcher for Stalled {
        fn available(&self) -> bool {
            true
        }

        fn dispatch(&self, id: ObjectId, _frame: PixelFrame) -> crate::Result<PendingDetection> {
            *self.calls.borrow_mut() += 1;
            let (tx, rx) = crossbeam_channel::bounded(1);
            self.senders.borrow_mut().push(tx);
            Ok(PendingDetection::new(id, rx))
        }
    }

    fn detection(class: ClassName, conf: f32) -> DetectionBox {
        DetectionBox::new(10.0, 10.0, 50.0, 50.0, conf, class)
    }

    #[test]
    fn test_track_is_idempotent() {
        let mut s = DetectionScheduler::default();
        s.track(1);
        s.track(1);
        assert_eq!(s.len(), 1);
        assert_eq!(s.state(1), Some(DetectionState::NotRequested));
        assert_eq!(s.state(2), None);
    }

    #[test]
    fn test_resolve_attaches_first_box() {
        let mut s = DetectionScheduler::default();
        let d = Scripted::new(vec![Ok(vec![
            detection(ClassName::Healthy, 0.9),
            detection(ClassName::Diseased, 0.6),
        ])]);
        s.track(1);

        assert_eq!(s.tick(&AllVisible, &d), vec![SchedulerEvent::Requested(1)]);
        assert_eq!(s.state(1), Some(DetectionState::Pending));

        let events = s.tick(&AllVisible, &d);
        assert_eq!(
            events,
            vec![SchedulerEvent::Resolved(1, detection(ClassName::Healthy, 0.9))]
        );
        assert_eq!(s.state(1), Some(DetectionState::Resolved));
        assert_eq!(s.result(1).map(|b| b.class_name()), Some(ClassName::Healthy));

        // 终态不再请求
        assert!(s.tick(&AllVisible, &d).is_empty());
        assert_eq!(d.calls(), vec![1]);
    }

    #[test]
    fn test_at_most_one_outstanding_request() {
        let mut s = DetectionScheduler::default();
        let d = Stalled {
            calls: RefCell::new(0),
            senders: RefCell::new(Vec::new()),
        };
        s.track(1);
        s.track(2);

        for _ in 0..10 {
            s.tick(&AllVisible, &d);
            assert!(s.pending_count() <= s.len());
        }
        assert_eq!(*d.calls.borrow(), 2);
        assert_eq!(s.pending_count(), 2);
    }

    #[test]
    fn test_exhausted_after_max_attempts() {
        let mut s = DetectionScheduler::default();
        let d = Scripted::new(vec![
            Ok(Vec::new()),
            Err(DetectError::Inference("backend".into())),
            Ok(Vec::new()),
            Err(DetectError::MalformedInput("tainted".into())),
            Ok(Vec::new()),
        ]);
        s.track(9);

        let mut events = Vec::new();
        for _ in 0..20 {
            events.extend(s.tick(&AllVisible, &d));
        }

        assert_eq!(s.state(9), Some(DetectionState::Exhausted));
        assert_eq!(s.result(9), None);
        assert_eq!(s.object(9).map(|o| o.attempts), Some(5));
        assert_eq!(d.calls().len(), 5);
        assert_eq!(
            events.iter().filter(|e| matches!(e, SchedulerEvent::Retry(..))).count(),
            4
        );
        assert_eq!(events.last(), Some(&SchedulerEvent::Exhausted(9)));
    }

    #[test]
    fn test_resolve_after_retries_resets_attempts() {
        let mut s = DetectionScheduler::default();
        let d = Scripted::new(vec![
            Ok(Vec::new()),
            Ok(Vec::new()),
            Ok(vec![detection(ClassName::Diseased, 0.7)]),
        ]);
        s.track(3);

        for _ in 0..10 {
            s.tick(&AllVisible, &d);
        }
        let object = s.object(3).unwrap();
        assert_eq!(object.state, DetectionState::Resolved);
        assert_eq!(object.attempts, 0);
        assert_eq!(d.calls().len(), 3);
    }

    #[test]
    fn test_invisible_objects_are_not_requested() {
        let mut s = DetectionScheduler::default();
        let d = Scripted::new(Vec::new());
        s.track(1);
        s.track(2);

        let view = Visible([2].into_iter().collect());
        for _ in 0..3 {
            s.tick(&view, &d);
        }
        assert_eq!(s.state(1), Some(DetectionState::NotRequested));
        assert_eq!(s.object(1).map(|o| o.attempts), Some(0));
        assert!(d.calls().iter().all(|&id| id == 2));
    }

    #[test]
    fn test_worker_unavailable_does_not_count() {
        let mut s = DetectionScheduler::default();
        let d = Scripted::new(vec![Ok(vec![detection(ClassName::Healthy, 0.8)])]);
        *d.reject.borrow_mut() = 3;
        s.track(1);

        for _ in 0..3 {
            assert!(s.tick(&AllVisible, &d).is_empty());
            assert_eq!(s.state(1), Some(DetectionState::NotRequested));
            assert_eq!(s.object(1).map(|o| o.attempts), Some(0));
        }
        s.tick(&AllVisible, &d);
        s.tick(&AllVisible, &d);
        assert_eq!(s.state(1), Some(DetectionState::Resolved));
    }

    #[test]
    fn test_load_in_progress_result_does_not_count() {
        let mut s = DetectionScheduler::default();
        let d = Scripted::new(vec![
            Err(DetectError::LoadInProgress),
            Ok(vec![detection(ClassName::Healthy, 0.8)]),
        ]);
        s.track(1);

        s.tick(&AllVisible, &d);
        assert!(s.tick(&AllVisible, &d).contains(&SchedulerEvent::Requested(1)));
        assert_eq!(s.object(1).map(|o| o.attempts), Some(0));
        s.tick(&AllVisible, &d);
        assert_eq!(s.state(1), Some(DetectionState::Resolved));
    }

    #[test]
    fn test_unavailable_dispatcher_issues_nothing() {
        let mut s = DetectionScheduler::default();
        let mut d = Scripted::new(Vec::new());
        d.available = false;
        s.track(1);
        assert!(s.tick(&AllVisible, &d).is_empty());
        assert!(d.calls().is_empty());
    }

    #[test]
    fn test_late_response_for_forgotten_object() {
        let mut s = DetectionScheduler::default();
        let d = Scripted::new(vec![Ok(vec![detection(ClassName::Healthy, 0.9)])]);
        s.track(5);
        s.tick(&AllVisible, &d);
        assert_eq!(s.pending_count(), 1);

        assert!(s.forget(5).is_some());
        assert_eq!(s.pending_count(), 0);
        assert!(s.tick(&AllVisible, &d).is_empty());

        // 直接送达的过期结果同样忽略
        assert_eq!(s.complete(5, Ok(vec![detection(ClassName::Healthy, 0.9)])), None);
        assert_eq!(s.state(5), None);
    }

    #[test]
    fn test_custom_attempt_limit() {
        let mut s = DetectionScheduler::new(2);
        let d = Scripted::new(Vec::new());
        s.track(1);
        for _ in 0..10 {
            s.tick(&AllVisible, &d);
        }
        assert_eq!(s.state(1), Some(DetectionState::Exhausted));
        assert_eq!(d.calls().len(), 2);
    }
}
