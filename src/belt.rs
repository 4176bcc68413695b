//! 无界面输送带模拟
//!
//! 每个 tick: 按间隔生成作物 → 移动 → 调度检测 → 到达分拣区时按检测结果计分

use image::{Rgba, RgbaImage};
use imageproc::drawing::draw_filled_circle_mut;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::catalog::AssetCatalog;
use crate::config::SorterConfig;
use crate::detection::{BeltView, DetectionScheduler, DetectionState, Dispatcher, SchedulerEvent};
use crate::detection::types::{ClassName, ObjectId, PixelFrame};

/// 作物图像边长 (像素), 新对象从画面左侧外进入
pub const OBJECT_SIZE: u32 = 96;

#[derive(Debug, Clone)]
pub struct BeltObject {
    pub id: ObjectId,
    pub truth: ClassName,
    pub x: f32,
    pub asset: Option<String>,
    frame: Option<PixelFrame>,
}

impl BeltObject {
    /// 完全进入画面且图像可用
    pub fn is_visible(&self) -> bool {
        self.x >= 0.0 && self.frame.is_some()
    }
}

/// 输送带上的对象集合, 为调度器提供像素
#[derive(Debug, Default)]
pub struct Conveyor {
    objects: Vec<BeltObject>,
}

impl Conveyor {
    pub fn objects(&self) -> &[BeltObject] {
        &self.objects
    }

    pub fn get(&self, id: ObjectId) -> Option<&BeltObject> {
        self.objects.iter().find(|o| o.id == id)
    }
}

impl BeltView for Conveyor {
    fn capture(&self, id: ObjectId) -> Option<PixelFrame> {
        self.get(id).filter(|o| o.is_visible()).and_then(|o| o.frame.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Correct,
    Wrong,
    Missed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Score {
    pub spawned: usize,
    pub correct: usize,
    pub wrong: usize,
    pub missed: usize,
    /// 放弃检测的对象 (同时计入 missed)
    pub exhausted: usize,
    pub requests: usize,
}

impl Score {
    pub fn sorted(&self) -> usize {
        self.correct + self.wrong + self.missed
    }

    pub fn accuracy(&self) -> f32 {
        match self.sorted() {
            0 => 0.0,
            n => self.correct as f32 / n as f32,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeltConfig {
    pub speed: f32,
    pub length: f32,
    pub sorting_zone: [f32; 2],
    pub spawn_every: u64,
    pub max_attempts: u32,
}

impl From<&SorterConfig> for BeltConfig {
    fn from(config: &SorterConfig) -> Self {
        let ticks = config.spawn_interval_ms * config.tick_rate as u64 / 1000;
        Self {
            speed: config.belt_speed,
            length: config.belt_length,
            sorting_zone: config.sorting_zone,
            spawn_every: ticks.max(1),
            max_attempts: config.max_attempts,
        }
    }
}

pub struct Belt {
    config: BeltConfig,
    conveyor: Conveyor,
    scheduler: DetectionScheduler,
    catalog: AssetCatalog,
    rng: StdRng,
    next_id: ObjectId,
    ticks: u64,
    score: Score,
}

impl Belt {
    pub fn new(config: BeltConfig, catalog: AssetCatalog, seed: u64) -> Self {
        Self {
            scheduler: DetectionScheduler::new(config.max_attempts),
            config,
            conveyor: Conveyor::default(),
            catalog,
            rng: StdRng::seed_from_u64(seed),
            next_id: 1,
            ticks: 0,
            score: Score::default(),
        }
    }

    pub fn step(&mut self, dispatcher: &dyn Dispatcher) -> Vec<(ObjectId, Outcome)> {
        if self.ticks % self.config.spawn_every == 0 {
            self.spawn();
        }
        self.ticks += 1;

        for object in self.conveyor.objects.iter_mut() {
            object.x += self.config.speed;
        }

        for event in self.scheduler.tick(&self.conveyor, dispatcher) {
            match event {
                SchedulerEvent::Requested(_) => self.score.requests += 1,
                SchedulerEvent::Resolved(id, det) => {
                    log::debug!("🎯 #{} 检测为 {} ({:.2})", id, det.class_name(), det.confidence())
                }
                SchedulerEvent::Retry(id, attempts) => log::debug!("🔁 #{} 第 {} 次无结果", id, attempts),
                SchedulerEvent::Exhausted(id) => log::debug!("🚫 #{} 放弃检测", id),
            }
        }

        self.sort_arrivals()
    }

    fn spawn(&mut self) {
        let id = self.next_id;
        self.next_id += 1;

        let truth = if self.rng.gen_bool(0.5) {
            ClassName::Healthy
        } else {
            ClassName::Diseased
        };

        let asset = self.catalog.pick(truth, &mut self.rng).map(str::to_string);
        let img = match &asset {
            Some(name) => {
                let path = self.catalog.path(truth, name);
                match image::open(&path) {
                    Ok(img) => img.to_rgba8(),
                    Err(e) => {
                        log::warn!("⚠️  图片加载失败 {}: {}", path.display(), e);
                        synthesize(truth, &mut self.rng)
                    }
                }
            }
            None => synthesize(truth, &mut self.rng),
        };
        let (w, h) = img.dimensions();

        self.conveyor.objects.push(BeltObject {
            id,
            truth,
            x: -(OBJECT_SIZE as f32),
            asset,
            frame: Some(PixelFrame::new(w, h, img.into_raw())),
        });
        self.scheduler.track(id);
        self.score.spawned += 1;
    }

    /// 到达分拣区的对象按检测结果分拣并移出输送带,
    /// 越过输送带末端的对象直接掉落, 记为漏检
    fn sort_arrivals(&mut self) -> Vec<(ObjectId, Outcome)> {
        let [zone_start, _] = self.config.sorting_zone;
        let end = self.config.length;
        let mut outcomes = Vec::new();

        let mut remaining = Vec::with_capacity(self.conveyor.objects.len());
        for object in self.conveyor.objects.drain(..) {
            if object.x < zone_start {
                remaining.push(object);
                continue;
            }

            let outcome = match self.scheduler.result(object.id) {
                _ if object.x > end => Outcome::Missed,
                Some(det) if det.class_name() == object.truth => Outcome::Correct,
                Some(_) => Outcome::Wrong,
                None => Outcome::Missed,
            };
            if self.scheduler.state(object.id) == Some(DetectionState::Exhausted) {
                self.score.exhausted += 1;
            }
            match outcome {
                Outcome::Correct => self.score.correct += 1,
                Outcome::Wrong => self.score.wrong += 1,
                Outcome::Missed => self.score.missed += 1,
            }
            log::debug!("📦 #{} ({}) -> {:?}", object.id, object.truth, outcome);

            self.scheduler.forget(object.id);
            outcomes.push((object.id, outcome));
        }
        self.conveyor.objects = remaining;

        outcomes
    }

    pub fn score(&self) -> &Score {
        &self.score
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn conveyor(&self) -> &Conveyor {
        &self.conveyor
    }

    pub fn scheduler(&self) -> &DetectionScheduler {
        &self.scheduler
    }
}

/// 没有真实图片时生成的替代图像: 透明背景上的果实, 病果带深色斑点
pub fn synthesize<R: Rng>(class: ClassName, rng: &mut R) -> RgbaImage {
    let mut img = RgbaImage::from_pixel(OBJECT_SIZE, OBJECT_SIZE, Rgba([0, 0, 0, 0]));
    let c = (OBJECT_SIZE / 2) as i32;
    let r = c - 6;

    let body = match class {
        ClassName::Healthy => Rgba([200, 30, 40, 255]),
        ClassName::Diseased => Rgba([150, 90, 40, 255]),
    };
    draw_filled_circle_mut(&mut img, (c, c), r, body);

    if class == ClassName::Diseased {
        for _ in 0..rng.gen_range(3..7) {
            let x = c + rng.gen_range(-r / 2..=r / 2);
            let y = c + rng.gen_range(-r / 2..=r / 2);
            draw_filled_circle_mut(&mut img, (x, y), rng.gen_range(4..9), Rgba([60, 40, 20, 255]));
        }
    }
    img
}
