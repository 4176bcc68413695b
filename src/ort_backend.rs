// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// ONNX Runtime 推理后端
// 输入 `[1, 3, S, S]` 平面 RGB 张量, 输出原始张量 `[1, 4 + nc, num_anchors]`

use std::io::Read;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use ndarray::Array4;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;

/// 推理引擎接口 (协调器与 ONNX Runtime 之间的接缝)
pub trait Engine: Send {
    /// 执行一次前向推理, 返回 (扁平数据, 维度)
    fn run(&mut self, xs: &Array4<f32>) -> Result<(Vec<f32>, Vec<usize>)>;

    /// 正方形输入边长
    fn input_size(&self) -> u32;

    fn ep(&self) -> OrtEP {
        OrtEP::CPU
    }

    /// 模型元数据中的类别名 (按ID顺序)
    fn names(&self) -> Option<Vec<String>> {
        None
    }
}

/// 执行设备偏好
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrtEP {
    CUDA(i32),
    CPU,
}

impl OrtEP {
    /// "cuda" / "cuda:1" / "cpu"
    pub fn parse(name: &str, device_id: i32) -> Option<Self> {
        let name = name.trim().to_lowercase();
        match name.as_str() {
            "cpu" => Some(OrtEP::CPU),
            "cuda" | "gpu" => Some(OrtEP::CUDA(device_id)),
            _ => name
                .strip_prefix("cuda:")
                .and_then(|id| id.parse().ok())
                .map(OrtEP::CUDA),
        }
    }

    fn dispatch(&self) -> ExecutionProviderDispatch {
        match self {
            OrtEP::CUDA(id) => CUDAExecutionProvider::default().with_device_id(*id).build(),
            OrtEP::CPU => CPUExecutionProvider::default().build(),
        }
    }
}

/// 模型来源
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
    Url(String),
}

impl ModelSource {
    pub fn parse(s: &str) -> Self {
        if s.starts_with("http://") || s.starts_with("https://") {
            ModelSource::Url(s.to_string())
        } else {
            ModelSource::Path(PathBuf::from(s))
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ModelSource::Path(p) => p.display().to_string(),
            ModelSource::Bytes(b) => format!("<{} bytes>", b.len()),
            ModelSource::Url(u) => u.clone(),
        }
    }

    /// 下载远程模型 (只取一次)
    fn fetch(url: &str) -> Result<Vec<u8>> {
        log::info!("🌐 下载模型: {}", url);
        let resp = ureq::get(url)
            .call()
            .map_err(|e| anyhow!("failed to fetch {url}: {e}"))?;
        let mut buf = Vec::new();
        resp.into_reader().read_to_end(&mut buf)?;
        if buf.is_empty() {
            bail!("empty model response from {url}");
        }
        Ok(buf)
    }
}

/// 后端构建参数
#[derive(Debug, Clone)]
pub struct OrtConfig {
    pub source: ModelSource,
    /// 按优先级排列, CPU 始终作为最终回退
    pub eps: Vec<OrtEP>,
    pub image_size: u32,
    pub num_threads: usize,
}

pub struct OrtBackend {
    session: Session,
    input_name: String,
    output_names: Vec<String>,
    image_size: u32,
    ep: OrtEP,
    names: Option<Vec<String>>,
}

impl OrtBackend {
    pub fn build(config: OrtConfig) -> Result<Self> {
        let t = Instant::now();

        if let ModelSource::Path(path) = &config.source {
            if !path.exists() {
                bail!("model file not found: {}", path.display());
            }
        }

        let mut eps: Vec<OrtEP> = config.eps.clone();
        if !eps.contains(&OrtEP::CPU) {
            eps.push(OrtEP::CPU);
        }
        let dispatch: Vec<ExecutionProviderDispatch> = eps.iter().map(|ep| ep.dispatch()).collect();

        let builder = Session::builder()
            .map_err(|e| anyhow!("failed to create session builder: {e}"))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!("failed to set optimization level: {e}"))?
            .with_intra_threads(config.num_threads.max(1))
            .map_err(|e| anyhow!("failed to set intra-thread count: {e}"))?
            .with_execution_providers(dispatch)
            .map_err(|e| anyhow!("failed to register execution providers: {e}"))?;

        let session = match &config.source {
            ModelSource::Path(path) => builder
                .commit_from_file(path)
                .map_err(|e| anyhow!("failed to load model: {e}"))?,
            ModelSource::Bytes(bytes) => builder
                .commit_from_memory(bytes)
                .map_err(|e| anyhow!("failed to load model: {e}"))?,
            ModelSource::Url(url) => {
                let bytes = ModelSource::fetch(url)?;
                builder
                    .commit_from_memory(&bytes)
                    .map_err(|e| anyhow!("failed to load model: {e}"))?
            }
        };

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "images".to_string());
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        if output_names.is_empty() {
            bail!("model has no outputs");
        }

        let names = match session.metadata() {
            Ok(meta) => match meta.custom("names") {
                Ok(Some(raw)) => Some(parse_names(&raw)),
                _ => None,
            },
            Err(_) => None,
        };

        log::info!(
            "✅ 模型加载完成 ({}) | 输入: {} | 输出: {:?} | {:.1}ms",
            config.source.describe(),
            input_name,
            output_names,
            t.elapsed().as_secs_f64() * 1000.0
        );

        Ok(Self {
            session,
            input_name,
            output_names,
            image_size: config.image_size,
            // 实际是否生效由 ORT 决定, 此处记录首选项
            ep: eps[0],
            names,
        })
    }
}

impl Engine for OrtBackend {
    fn run(&mut self, xs: &Array4<f32>) -> Result<(Vec<f32>, Vec<usize>)> {
        let xs = xs.as_standard_layout();
        let input = TensorRef::from_array_view(&xs)
            .map_err(|e| anyhow!("failed to create input tensor: {e}"))?;
        let inputs = ort::inputs![self.input_name.as_str() => input];

        let outputs = self
            .session
            .run(inputs)
            .map_err(|e| anyhow!("inference failed: {e}"))?;

        let output_name = &self.output_names[0];
        let output = outputs
            .get(output_name.as_str())
            .ok_or_else(|| anyhow!("output '{}' not found", output_name))?;

        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| anyhow!("failed to extract output: {e}"))?;

        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        Ok((data.to_vec(), dims))
    }

    fn input_size(&self) -> u32 {
        self.image_size
    }

    fn ep(&self) -> OrtEP {
        self.ep
    }

    fn names(&self) -> Option<Vec<String>> {
        self.names.clone()
    }
}

/// 解析 Ultralytics 元数据中的类别表: `{0: 'diseased', 1: 'healthy'}`
pub fn parse_names(raw: &str) -> Vec<String> {
    let mut pairs: Vec<(usize, String)> = raw
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .split(',')
        .filter_map(|item| {
            let (id, name) = item.split_once(':')?;
            let id = id.trim().parse::<usize>().ok()?;
            let name = name.trim().trim_matches(|c| c == '\'' || c == '"').to_string();
            Some((id, name))
        })
        .collect();
    pairs.sort_by_key(|(id, _)| *id);
    pairs.into_iter().map(|(_, name)| name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!(
            parse_names("{0: 'diseased', 1: 'healthy'}"),
            vec!["diseased".to_string(), "healthy".to_string()]
        );
        assert_eq!(
            parse_names("{1: \"healthy\", 0: \"diseased\"}"),
            vec!["diseased".to_string(), "healthy".to_string()]
        );
        assert!(parse_names("garbage").is_empty());
    }

    #[test]
    fn test_ep_parse() {
        assert_eq!(OrtEP::parse("cpu", 0), Some(OrtEP::CPU));
        assert_eq!(OrtEP::parse("CUDA", 2), Some(OrtEP::CUDA(2)));
        assert_eq!(OrtEP::parse("cuda:1", 0), Some(OrtEP::CUDA(1)));
        assert_eq!(OrtEP::parse("tpu", 0), None);
    }

    #[test]
    fn test_model_source_parse() {
        assert_eq!(
            ModelSource::parse("https://host/best.onnx"),
            ModelSource::Url("https://host/best.onnx".to_string())
        );
        assert_eq!(
            ModelSource::parse("models/best.onnx"),
            ModelSource::Path(PathBuf::from("models/best.onnx"))
        );
    }

    #[test]
    fn test_build_missing_file() {
        let config = OrtConfig {
            source: ModelSource::Path(PathBuf::from("/nonexistent/model.onnx")),
            eps: vec![OrtEP::CPU],
            image_size: 640,
            num_threads: 1,
        };
        assert!(OrtBackend::build(config).is_err());
    }
}
