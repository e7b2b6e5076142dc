// 该文件是 Xinhao （信号灯） 项目的一部分。
// src/artifact.rs - 模型文件获取：本地缓存与镜像下载
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{
  fs, io,
  path::{Path, PathBuf},
  time::Duration,
};

use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const USER_AGENT: &str = concat!("xinhao/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum ArtifactError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] io::Error),
  #[error("HTTP 错误: {0}")]
  HttpError(#[from] reqwest::Error),
  #[error("不支持的镜像方案: {0}")]
  UnsupportedScheme(String),
  #[error("无效的本地文件地址: {0}")]
  InvalidFileUrl(Url),
  #[error("镜像返回了空文件: {0}")]
  EmptyArtifact(Url),
  #[error("本地缓存 {0} 不存在且未配置下载镜像")]
  NoMirror(PathBuf),
  #[error("全部 {tried} 个镜像均失败, 最后错误: {last}")]
  AllMirrorsFailed {
    tried: usize,
    last: Box<ArtifactError>,
  },
}

/// 模型文件来源：优先复用本地缓存，否则依次尝试各个镜像
#[derive(Debug, Clone)]
pub struct ArtifactSource {
  path: PathBuf,
  mirrors: Vec<Url>,
  timeout: Duration,
}

impl ArtifactSource {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    ArtifactSource {
      path: path.into(),
      mirrors: Vec::new(),
      timeout: DEFAULT_DOWNLOAD_TIMEOUT,
    }
  }

  pub fn mirrors(mut self, mirrors: Vec<Url>) -> Self {
    self.mirrors = mirrors;
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// 缓存文件存在且非空
  pub fn is_cached(&self) -> bool {
    fs::metadata(&self.path)
      .map(|meta| meta.is_file() && meta.len() > 0)
      .unwrap_or(false)
  }

  fn partial_path(&self) -> PathBuf {
    let mut name = self.path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    self.path.with_file_name(name)
  }

  /// 返回可用的本地模型文件路径。
  /// 下载先写入 `.part` 临时文件，完整后再改名，缓存路径上不会出现半个文件。
  pub fn acquire(&self) -> Result<PathBuf, ArtifactError> {
    if self.is_cached() {
      info!("复用本地模型文件: {}", self.path.display());
      return Ok(self.path.clone());
    }

    if self.mirrors.is_empty() {
      return Err(ArtifactError::NoMirror(self.path.clone()));
    }

    if let Some(parent) = self.path.parent() {
      if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)?;
      }
    }

    let partial = self.partial_path();
    let mut last = ArtifactError::NoMirror(self.path.clone());
    for (idx, mirror) in self.mirrors.iter().enumerate() {
      info!("尝试镜像 {}/{}: {}", idx + 1, self.mirrors.len(), mirror);
      match self.fetch(mirror, &partial) {
        Ok(size) => {
          fs::rename(&partial, &self.path)?;
          info!(
            "模型文件获取成功: {} ({:.2} MB)",
            self.path.display(),
            size as f64 / (1024.0 * 1024.0)
          );
          return Ok(self.path.clone());
        }
        Err(e) => {
          warn!("镜像 {} 获取失败: {}", mirror, e);
          if let Err(clean) = fs::remove_file(&partial) {
            debug!("清理临时文件: {}", clean);
          }
          last = e;
        }
      }
    }

    Err(ArtifactError::AllMirrorsFailed {
      tried: self.mirrors.len(),
      last: Box::new(last),
    })
  }

  fn fetch(&self, mirror: &Url, dest: &Path) -> Result<u64, ArtifactError> {
    let size = match mirror.scheme() {
      "file" => {
        let src = mirror
          .to_file_path()
          .map_err(|_| ArtifactError::InvalidFileUrl(mirror.clone()))?;
        fs::copy(src, dest)?
      }
      "http" | "https" => {
        let client = reqwest::blocking::Client::builder()
          .user_agent(USER_AGENT)
          .timeout(self.timeout)
          .build()?;
        let mut response = client.get(mirror.clone()).send()?.error_for_status()?;
        let mut file = fs::File::create(dest)?;
        let size = response.copy_to(&mut file)?;
        file.sync_all()?;
        size
      }
      other => return Err(ArtifactError::UnsupportedScheme(other.to_string())),
    };

    if size == 0 {
      return Err(ArtifactError::EmptyArtifact(mirror.clone()));
    }
    Ok(size)
  }
}
