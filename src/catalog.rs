//! 作物图片目录
//! `<images_dir>/healthy`, `<images_dir>/diseased` 下的图片文件名, 启动时读取一次

use std::fs;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::detection::types::ClassName;
use crate::error::Result;

pub const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "webp"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetCatalog {
    #[serde(skip)]
    root: PathBuf,
    pub healthy: Vec<String>,
    pub diseased: Vec<String>,
}

impl AssetCatalog {
    /// 扫描图片目录, 类别文件夹不存在时为空列表
    pub fn scan<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let root = dir.as_ref().to_path_buf();
        let catalog = Self {
            healthy: list_images(&root.join(ClassName::Healthy.as_str()))?,
            diseased: list_images(&root.join(ClassName::Diseased.as_str()))?,
            root,
        };
        log::info!(
            "🍎 图片目录 {}: healthy {} / diseased {}",
            catalog.root.display(),
            catalog.healthy.len(),
            catalog.diseased.len()
        );
        Ok(catalog)
    }

    pub fn names(&self, class: ClassName) -> &[String] {
        match class {
            ClassName::Healthy => &self.healthy,
            ClassName::Diseased => &self.diseased,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.healthy.is_empty() && self.diseased.is_empty()
    }

    pub fn len(&self) -> usize {
        self.healthy.len() + self.diseased.len()
    }

    pub fn pick<R: Rng + ?Sized>(&self, class: ClassName, rng: &mut R) -> Option<&str> {
        self.names(class).choose(rng).map(String::as_str)
    }

    pub fn path(&self, class: ClassName, name: &str) -> PathBuf {
        self.root.join(class.as_str()).join(name)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn list_images(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        log::debug!("📁 {} 不存在", dir.display());
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || !is_image_file(&path) {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}
