//! 分拣配置 - 通过JSON文件调整参数, 命令行可覆盖

use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::detection::types::{INF_SIZE, MAX_ATTEMPTS};
use crate::error::{DetectError, Result};
use crate::ort_backend::{ModelSource, OrtEP};

/// 分拣参数配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SorterConfig {
    // === 模型参数 ===
    pub model: String,                    // 模型路径或URL
    pub input_size: u32,                  // 正方形输入边长
    pub conf_threshold: f32,              // 置信度阈值
    pub iou_threshold: f32,               // NMS IOU阈值
    pub execution_providers: Vec<String>, // 执行设备偏好 (按顺序尝试)
    pub device_id: i32,
    pub num_threads: usize,

    // === 调度参数 ===
    pub max_attempts: u32,     // 单对象最大检测次数
    pub queue_capacity: usize, // 推理队列长度

    // === 输送带参数 ===
    pub tick_rate: u32,          // 每秒更新次数
    pub spawn_interval_ms: u64,  // 生成间隔
    pub belt_speed: f32,         // 像素/tick
    pub belt_length: f32,        // 像素
    pub sorting_zone: [f32; 2],  // 分拣区间 [起点, 终点]
    pub images_dir: String,      // 作物图片目录
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            model: "models/apple_detector.onnx".to_string(),
            input_size: INF_SIZE,
            conf_threshold: 0.5,
            iou_threshold: 0.45,
            execution_providers: vec!["cuda".to_string(), "cpu".to_string()],
            device_id: 0,
            num_threads: 4,

            max_attempts: MAX_ATTEMPTS,
            queue_capacity: 64,

            tick_rate: 60,
            spawn_interval_ms: 1200,
            belt_speed: 4.0,
            belt_length: 1200.0,
            sorting_zone: [900.0, 1000.0],
            images_dir: "images".to_string(),
        }
    }
}

impl SorterConfig {
    /// 从JSON文件加载配置
    ///
    /// 文件不存在时写出默认配置; 解析失败时使用默认值
    pub fn load(path: &str) -> Self {
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    log::info!("✅ 配置已从 {} 加载", path);
                    config
                }
                Err(e) => {
                    log::warn!("⚠️  配置文件解析失败: {}, 使用默认值", e);
                    Self::default()
                }
            },
            Err(_) => {
                log::info!("📝 配置文件不存在,创建默认配置...");
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    log::error!("❌ 保存配置失败: {}", e);
                }
                config
            }
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: &str) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        log::info!("💾 配置已保存到 {}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(DetectError::Config(msg));
        if !(0.0..=1.0).contains(&self.conf_threshold) {
            return bad(format!("conf_threshold {} not in [0, 1]", self.conf_threshold));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return bad(format!("iou_threshold {} not in [0, 1]", self.iou_threshold));
        }
        if self.input_size == 0 {
            return bad("input_size must be > 0".to_string());
        }
        if self.max_attempts == 0 {
            return bad("max_attempts must be >= 1".to_string());
        }
        if self.tick_rate == 0 {
            return bad("tick_rate must be > 0".to_string());
        }
        let [start, end] = self.sorting_zone;
        if !(start < end && end <= self.belt_length) {
            return bad(format!("sorting_zone {:?} not inside belt", self.sorting_zone));
        }
        Ok(())
    }

    pub fn model_source(&self) -> ModelSource {
        ModelSource::parse(&self.model)
    }

    /// 解析执行设备偏好, 无法识别的项忽略
    pub fn eps(&self) -> Vec<OrtEP> {
        self.execution_providers
            .iter()
            .filter_map(|name| {
                let ep = OrtEP::parse(name, self.device_id);
                if ep.is_none() {
                    log::warn!("⚠️  未知执行设备: {}", name);
                }
                ep
            })
            .collect()
    }

    /// 命令行覆盖
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(model) = &args.model {
            self.model = model.clone();
        }
        if let Some(conf) = args.conf {
            self.conf_threshold = conf;
        }
        if let Some(iou) = args.iou {
            self.iou_threshold = iou;
        }
        if args.cpu {
            self.execution_providers = vec!["cpu".to_string()];
        }
        if let Some(dir) = &args.images {
            self.images_dir = dir.display().to_string();
        }
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        log::info!("🎛️  当前分拣配置:");
        log::info!("  模型: {}", self.model);
        log::info!(
            "  输入: {} | 置信度: {:.2} | IOU: {:.2}",
            self.input_size,
            self.conf_threshold,
            self.iou_threshold
        );
        log::info!("  最大检测次数: {}", self.max_attempts);
        log::info!("  执行设备: {:?}", self.execution_providers);
    }
}

/// 作物分拣命令行参数
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "农作物品质分拣 - 输送带检测", long_about = None)]
pub struct Args {
    /// 配置文件
    #[arg(short, long, default_value = "sorter.json")]
    pub config: String,

    /// 模型路径或URL (覆盖配置文件)
    #[arg(short, long)]
    pub model: Option<String>,

    /// 置信度阈值
    #[arg(long)]
    pub conf: Option<f32>,

    /// NMS IOU阈值
    #[arg(long)]
    pub iou: Option<f32>,

    /// 仅使用CPU
    #[arg(long)]
    pub cpu: bool,

    /// 作物图片目录
    #[arg(long)]
    pub images: Option<PathBuf>,

    /// 输出调试日志
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// 单张图片检测
    Detect {
        image: PathBuf,
        /// 保存绘制了检测框的图片
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// 列出作物图片目录
    Catalog,
    /// 根据去背图片生成YOLO标注数据集
    Annotate {
        src: PathBuf,
        out: PathBuf,
        #[arg(long, default_value_t = 0.2)]
        val_ratio: f32,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// 无界面输送带模拟
    Belt {
        /// 运行的 tick 数
        #[arg(long, default_value_t = 3600)]
        ticks: u64,
    },
}
